#![allow(dead_code)]

use async_trait::async_trait;
use escrow_ledger::application::engine::SettlementEngine;
use escrow_ledger::config::SettlementConfig;
use escrow_ledger::domain::dispute::Dispute;
use escrow_ledger::domain::ledger::{EntryId, EntryType, LedgerEntry, Role, SubjectId};
use escrow_ledger::domain::money::Currency;
use escrow_ledger::domain::order::Order;
use escrow_ledger::domain::payout::Payout;
use escrow_ledger::domain::ports::{AtomicUnit, AuditSinkRef, LedgerStore, RecordStore, StoreRef};
use escrow_ledger::domain::seller::SellerAccount;
use escrow_ledger::error::{Result, SettlementError};
use escrow_ledger::infrastructure::gateway::SandboxGateway;
use escrow_ledger::infrastructure::in_memory::InMemoryStore;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use uuid::Uuid;

pub const SCRIPT_HEADER: &str = "op,order,buyer,seller,amount,currency,reference,actor,note";

/// Writes a command script with the standard header.
pub fn write_script(rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{SCRIPT_HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file.flush().unwrap();
    file
}

pub fn subject(id: &str) -> SubjectId {
    SubjectId::new(id).unwrap()
}

pub fn engine(
    store: StoreRef,
    gateway: &SandboxGateway,
    audit: Option<AuditSinkRef>,
) -> SettlementEngine {
    SettlementEngine::new(
        store,
        Arc::new(gateway.clone()),
        audit,
        SettlementConfig::default(),
    )
}

/// An in-memory store whose commits can be made to fail on demand.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    fail_all: Arc<AtomicBool>,
    fail_on: Arc<Mutex<Option<EntryType>>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every commit fails while set.
    pub fn fail_all_commits(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Commits that append an entry of `entry_type` fail.
    pub fn fail_commits_with(&self, entry_type: Option<EntryType>) {
        *self.fail_on.lock().unwrap() = entry_type;
    }

    fn should_fail(&self, unit: &AtomicUnit) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        match *self.fail_on.lock().unwrap() {
            Some(entry_type) => unit.entries.iter().any(|e| e.entry_type == entry_type),
            None => false,
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn commit(&self, unit: AtomicUnit) -> Result<Vec<EntryId>> {
        if self.should_fail(&unit) {
            return Err(SettlementError::internal("injected commit failure"));
        }
        self.inner.commit(unit).await
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        self.inner.get_entry(id).await
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<LedgerEntry>> {
        self.inner.find_by_external_id(external_id).await
    }

    async fn find_by_payment_intent(
        &self,
        intent_id: &str,
        entry_type: EntryType,
    ) -> Result<Option<LedgerEntry>> {
        self.inner.find_by_payment_intent(intent_id, entry_type).await
    }

    async fn entries_for_subject(&self, subject: &SubjectId, role: Role) -> Result<Vec<LedgerEntry>> {
        self.inner.entries_for_subject(subject, role).await
    }

    async fn entries_for_order(&self, order_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.inner.entries_for_order(order_id).await
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        self.inner.get_order(id).await
    }

    async fn find_order_by_external_id(&self, external_id: &str) -> Result<Option<Order>> {
        self.inner.find_order_by_external_id(external_id).await
    }

    async fn get_payout(&self, payout_id: Uuid) -> Result<Option<Payout>> {
        self.inner.get_payout(payout_id).await
    }

    async fn payouts_for_order(&self, order_id: Uuid) -> Result<Vec<Payout>> {
        self.inner.payouts_for_order(order_id).await
    }

    async fn find_dispute_by_order(&self, order_id: Uuid) -> Result<Option<Dispute>> {
        self.inner.find_dispute_by_order(order_id).await
    }

    async fn get_seller(&self, seller_id: &SubjectId) -> Result<Option<SellerAccount>> {
        self.inner.get_seller(seller_id).await
    }

    async fn subjects(&self) -> Result<Vec<(SubjectId, Role)>> {
        self.inner.subjects().await
    }
}

/// Registers `seller_1` and places a card-paid order `ord_1` for `amount`.
pub async fn seeded_card_order(
    engine: &SettlementEngine,
    gateway: &SandboxGateway,
    amount: i64,
) -> Order {
    engine
        .register_seller(SellerAccount::new(subject("seller_1"), "acct_seller_1"))
        .await
        .unwrap();
    gateway
        .record_captured_payment("pi_card_1", amount, Currency::Usd)
        .await;
    let order = Order::new(
        "ord_1",
        subject("buyer_1"),
        subject("seller_1"),
        amount,
        Currency::Usd,
        Some("pi_card_1".to_string()),
    );
    engine.place_order(order, &[]).await.unwrap().data.order
}
