use crate::domain::dispute::Dispute;
use crate::domain::ledger::{EntryId, EntryType, LedgerEntry, Role, SubjectId};
use crate::domain::order::Order;
use crate::domain::payout::Payout;
use crate::domain::ports::{AtomicUnit, AuditEvent, AuditSink, LedgerStore, RecordStore};
use crate::domain::seller::SellerAccount;
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    entries: Vec<LedgerEntry>,
    entry_index: HashMap<EntryId, usize>,
    external_index: HashMap<String, EntryId>,
    orders: HashMap<Uuid, Order>,
    order_external_index: HashMap<String, Uuid>,
    payouts: HashMap<Uuid, Payout>,
    payout_by_order: HashMap<Uuid, Vec<Uuid>>,
    disputes: HashMap<Uuid, Dispute>,
    dispute_by_order: HashMap<Uuid, Uuid>,
    sellers: HashMap<SubjectId, SellerAccount>,
}

impl State {
    fn check_conflicts(&self, unit: &AtomicUnit) -> Result<()> {
        for entry in &unit.entries {
            if self.entry_index.contains_key(&entry.id) {
                return Err(SettlementError::ImmutableEntry(entry.id));
            }
            if self.external_index.contains_key(&entry.external_id) {
                return Err(SettlementError::DuplicateExternalId(
                    entry.external_id.clone(),
                ));
            }
        }
        Ok(())
    }

    fn apply(&mut self, unit: AtomicUnit) {
        for entry in unit.entries {
            self.entry_index.insert(entry.id, self.entries.len());
            self.external_index
                .insert(entry.external_id.clone(), entry.id);
            self.entries.push(entry);
        }
        for order in unit.orders {
            self.order_external_index
                .insert(order.external_id.clone(), order.id);
            self.orders.insert(order.id, order);
        }
        for payout in unit.payouts {
            let ids = self.payout_by_order.entry(payout.order_id).or_default();
            if !ids.contains(&payout.payout_id) {
                ids.push(payout.payout_id);
            }
            self.payouts.insert(payout.payout_id, payout);
        }
        for dispute in unit.disputes {
            self.dispute_by_order.insert(dispute.order_id, dispute.id);
            self.disputes.insert(dispute.id, dispute);
        }
        for seller in unit.sellers {
            self.sellers.insert(seller.seller_id.clone(), seller);
        }
    }
}

/// A thread-safe in-memory settlement store.
///
/// All state sits behind one `RwLock`; a unit is checked and applied while the
/// write guard is held, which makes every commit all-or-nothing.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn commit(&self, unit: AtomicUnit) -> Result<Vec<EntryId>> {
        unit.validate()?;
        let ids = unit.entry_ids();
        let mut state = self.state.write().await;
        state.check_conflicts(&unit)?;
        state.apply(unit);
        Ok(ids)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entry_index
            .get(&id)
            .map(|idx| state.entries[*idx].clone()))
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .external_index
            .get(external_id)
            .and_then(|id| state.entry_index.get(id))
            .map(|idx| state.entries[*idx].clone()))
    }

    async fn find_by_payment_intent(
        &self,
        intent_id: &str,
        entry_type: EntryType,
    ) -> Result<Option<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .find(|e| {
                e.entry_type == entry_type
                    && e.related_payment_intent_id.as_deref() == Some(intent_id)
            })
            .cloned())
    }

    async fn entries_for_subject(
        &self,
        subject: &SubjectId,
        role: Role,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| &e.subject_id == subject && e.role == role)
            .cloned()
            .collect())
    }

    async fn entries_for_order(&self, order_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.related_order_id == Some(order_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let state = self.state.read().await;
        Ok(state.orders.get(&id).cloned())
    }

    async fn find_order_by_external_id(&self, external_id: &str) -> Result<Option<Order>> {
        let state = self.state.read().await;
        Ok(state
            .order_external_index
            .get(external_id)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn get_payout(&self, payout_id: Uuid) -> Result<Option<Payout>> {
        let state = self.state.read().await;
        Ok(state.payouts.get(&payout_id).cloned())
    }

    async fn payouts_for_order(&self, order_id: Uuid) -> Result<Vec<Payout>> {
        let state = self.state.read().await;
        Ok(state
            .payout_by_order
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.payouts.get(id))
            .cloned()
            .collect())
    }

    async fn find_dispute_by_order(&self, order_id: Uuid) -> Result<Option<Dispute>> {
        let state = self.state.read().await;
        Ok(state
            .dispute_by_order
            .get(&order_id)
            .and_then(|id| state.disputes.get(id))
            .cloned())
    }

    async fn get_seller(&self, seller_id: &SubjectId) -> Result<Option<SellerAccount>> {
        let state = self.state.read().await;
        Ok(state.sellers.get(seller_id).cloned())
    }

    async fn subjects(&self) -> Result<Vec<(SubjectId, Role)>> {
        let state = self.state.read().await;
        let subjects: BTreeSet<(SubjectId, Role)> = state
            .entries
            .iter()
            .map(|e| (e.subject_id.clone(), e.role))
            .collect();
        Ok(subjects.into_iter().collect())
    }
}

/// Keeps audit events in memory.
#[derive(Default, Clone)]
pub struct InMemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::{EntryStatus, SELLER_TYPES};
    use crate::domain::money::Currency;

    fn lock(order_id: Uuid, external_id: &str, amount: i64) -> LedgerEntry {
        LedgerEntry::new(
            external_id,
            SubjectId::new("seller_1").unwrap(),
            EntryType::EscrowLock,
            amount,
            Currency::Usd,
            EntryStatus::Locked,
        )
        .for_order(order_id)
    }

    #[tokio::test]
    async fn test_append_and_lookup() {
        let store = InMemoryStore::new();
        let order_id = Uuid::new_v4();
        let entry = lock(order_id, "lock_1", 500);

        let id = store.append(entry.clone()).await.unwrap();
        assert_eq!(store.get_entry(id).await.unwrap(), Some(entry.clone()));
        assert_eq!(
            store.find_by_external_id("lock_1").await.unwrap(),
            Some(entry)
        );
        assert_eq!(store.entries_for_order(order_id).await.unwrap().len(), 1);
        assert!(store.find_by_external_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rewrite_of_existing_id_rejected() {
        let store = InMemoryStore::new();
        let entry = lock(Uuid::new_v4(), "lock_1", 500);
        store.append(entry.clone()).await.unwrap();

        let mut tampered = entry.clone();
        tampered.amount = 50_000;
        tampered.external_id = "lock_1_tampered".to_string();
        assert!(matches!(
            store.append(tampered).await,
            Err(SettlementError::ImmutableEntry(_))
        ));
        assert_eq!(store.get_entry(entry.id).await.unwrap().unwrap().amount, 500);
    }

    #[tokio::test]
    async fn test_failed_unit_leaves_no_partial_writes() {
        let store = InMemoryStore::new();
        let order_id = Uuid::new_v4();
        store.append(lock(order_id, "lock_1", 500)).await.unwrap();

        let result = store
            .append_batch(vec![
                lock(order_id, "lock_2", 100),
                lock(order_id, "lock_1", 100),
            ])
            .await;
        assert!(matches!(
            result,
            Err(SettlementError::DuplicateExternalId(_))
        ));
        assert!(store.find_by_external_id("lock_2").await.unwrap().is_none());
        assert_eq!(store.entries_for_order(order_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_entry_rejects_unit() {
        let store = InMemoryStore::new();
        let mut bad = lock(Uuid::new_v4(), "lock_bad", 100);
        bad.related_order_id = None;
        let order = Order::new(
            "ord_1",
            SubjectId::new("b").unwrap(),
            SubjectId::new("seller_1").unwrap(),
            100,
            Currency::Usd,
            None,
        );

        let result = store
            .commit(AtomicUnit::new().entry(bad).order(order))
            .await;
        assert!(matches!(result, Err(SettlementError::ValidationError(_))));
        assert!(store
            .find_order_by_external_id("ord_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_balance_returns_zero_without_rows() {
        let store = InMemoryStore::new();
        let subject = SubjectId::new("nobody").unwrap();
        let balance = store
            .balance(&subject, Role::Seller, Currency::Usd, SELLER_TYPES)
            .await
            .unwrap();
        assert_eq!(balance, 0);
        assert!(store
            .aggregate_by_status(&subject, Role::Seller)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_records_upsert_and_resolve() {
        let store = InMemoryStore::new();
        let mut order = Order::new(
            "ord_42",
            SubjectId::new("b").unwrap(),
            SubjectId::new("s").unwrap(),
            900,
            Currency::Eur,
            Some("pi_42".to_string()),
        );
        store.commit(AtomicUnit::new().order(order.clone())).await.unwrap();

        assert_eq!(store.resolve_order("ord_42").await.unwrap().id, order.id);
        assert_eq!(
            store.resolve_order(&order.id.to_string()).await.unwrap().id,
            order.id
        );
        assert!(matches!(
            store.resolve_order("ord_missing").await,
            Err(SettlementError::OrderNotFound(_))
        ));

        order.mark_refunded().unwrap();
        store.commit(AtomicUnit::new().order(order.clone())).await.unwrap();
        assert_eq!(store.get_order(order.id).await.unwrap(), Some(order));
    }

    #[tokio::test]
    async fn test_audit_sink_collects_events() {
        let sink = InMemoryAuditSink::new();
        sink.record(AuditEvent {
            action: "refund".to_string(),
            order_id: "ord_1".to_string(),
            actor: "admin".to_string(),
            outcome: crate::domain::ports::AuditOutcome::Succeeded,
            detail: "re_1".to_string(),
            at: chrono::Utc::now(),
        })
        .await
        .unwrap();
        assert_eq!(sink.events().await.len(), 1);
    }
}
