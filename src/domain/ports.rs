use super::dispute::Dispute;
use super::gateway::{PaymentConfirmation, PaymentIntent, RefundReceipt, Transfer, TransferRequest};
use super::ledger::{EntryId, EntryType, LedgerEntry, Role, StatusRollup, SubjectId};
use super::money::{Currency, MinorUnits};
use super::order::Order;
use super::payout::Payout;
use super::seller::SellerAccount;
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// A set of writes that must become visible together or not at all.
///
/// Ledger entries are appended; orders, payouts, disputes and sellers are
/// upserted. A store must reject the whole unit if any part of it fails.
#[derive(Debug, Clone, Default)]
pub struct AtomicUnit {
    pub entries: Vec<LedgerEntry>,
    pub orders: Vec<Order>,
    pub payouts: Vec<Payout>,
    pub disputes: Vec<Dispute>,
    pub sellers: Vec<SellerAccount>,
}

impl AtomicUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: LedgerEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn payout(mut self, payout: Payout) -> Self {
        self.payouts.push(payout);
        self
    }

    pub fn dispute(mut self, dispute: Dispute) -> Self {
        self.disputes.push(dispute);
        self
    }

    pub fn seller(mut self, seller: SellerAccount) -> Self {
        self.sellers.push(seller);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.orders.is_empty()
            && self.payouts.is_empty()
            && self.disputes.is_empty()
            && self.sellers.is_empty()
    }

    /// Validates each entry and rejects ids repeated inside the unit.
    /// Conflicts with already persisted entries are the store's job.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut external_ids = HashSet::new();
        for entry in &self.entries {
            entry.validate()?;
            if !ids.insert(entry.id) {
                return Err(SettlementError::ImmutableEntry(entry.id));
            }
            if !external_ids.insert(entry.external_id.as_str()) {
                return Err(SettlementError::DuplicateExternalId(
                    entry.external_id.clone(),
                ));
            }
        }
        Ok(())
    }

    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

/// Append-only entry log. No update or delete.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Applies every write in `unit` atomically and returns the appended entry ids.
    async fn commit(&self, unit: AtomicUnit) -> Result<Vec<EntryId>>;
    async fn get_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<LedgerEntry>>;
    async fn find_by_payment_intent(
        &self,
        intent_id: &str,
        entry_type: EntryType,
    ) -> Result<Option<LedgerEntry>>;
    async fn entries_for_subject(&self, subject: &SubjectId, role: Role) -> Result<Vec<LedgerEntry>>;
    async fn entries_for_order(&self, order_id: Uuid) -> Result<Vec<LedgerEntry>>;

    async fn append(&self, entry: LedgerEntry) -> Result<EntryId> {
        let id = entry.id;
        self.commit(AtomicUnit::new().entry(entry)).await?;
        Ok(id)
    }

    async fn append_batch(&self, entries: Vec<LedgerEntry>) -> Result<Vec<EntryId>> {
        self.commit(AtomicUnit {
            entries,
            ..AtomicUnit::default()
        })
        .await
    }

    async fn balance(
        &self,
        subject: &SubjectId,
        role: Role,
        currency: Currency,
        allowed: &[EntryType],
    ) -> Result<i64> {
        let entries = self.entries_for_subject(subject, role).await?;
        Ok(super::ledger::sum_available(&entries, currency, allowed))
    }

    async fn aggregate_by_status(
        &self,
        subject: &SubjectId,
        role: Role,
    ) -> Result<BTreeMap<Currency, StatusRollup>> {
        let entries = self.entries_for_subject(subject, role).await?;
        Ok(super::ledger::rollup(&entries))
    }
}

/// Read access to the collaborator records this crate works against.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>>;
    async fn find_order_by_external_id(&self, external_id: &str) -> Result<Option<Order>>;
    async fn get_payout(&self, payout_id: Uuid) -> Result<Option<Payout>>;
    /// Every payout record for an order, one per paid seller.
    async fn payouts_for_order(&self, order_id: Uuid) -> Result<Vec<Payout>>;
    async fn find_dispute_by_order(&self, order_id: Uuid) -> Result<Option<Dispute>>;
    async fn get_seller(&self, seller_id: &SubjectId) -> Result<Option<SellerAccount>>;
    /// Every subject that holds at least one ledger entry, with its role.
    async fn subjects(&self) -> Result<Vec<(SubjectId, Role)>>;

    async fn find_payout(&self, order_id: Uuid, seller_id: &SubjectId) -> Result<Option<Payout>> {
        Ok(self
            .payouts_for_order(order_id)
            .await?
            .into_iter()
            .find(|p| &p.seller_id == seller_id))
    }

    /// Resolves an order by external id first, then by internal id.
    async fn resolve_order(&self, reference: &str) -> Result<Order> {
        if let Some(order) = self.find_order_by_external_id(reference).await? {
            return Ok(order);
        }
        if let Ok(id) = Uuid::parse_str(reference)
            && let Some(order) = self.get_order(id).await?
        {
            return Ok(order);
        }
        Err(SettlementError::OrderNotFound(reference.to_string()))
    }
}

pub trait SettlementStore: LedgerStore + RecordStore {}

impl<T: LedgerStore + RecordStore> SettlementStore for T {}

/// The external payment processor. Every call is assumed to honour the
/// idempotency key it is given.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_transfer(&self, request: TransferRequest) -> Result<Transfer>;
    async fn refund(
        &self,
        payment_reference: &str,
        amount: Option<i64>,
        reason: &str,
    ) -> Result<RefundReceipt>;
    async fn create_payment_intent(
        &self,
        amount: MinorUnits,
        currency: Currency,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent>;
    async fn retrieve_payment_confirmation(&self, intent_id: &str) -> Result<PaymentConfirmation>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub order_id: String,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

pub type StoreRef = Arc<dyn SettlementStore>;
pub type GatewayRef = Arc<dyn PaymentGateway>;
pub type AuditSinkRef = Arc<dyn AuditSink>;
