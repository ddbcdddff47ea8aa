//! Seller payouts as a three-phase saga around the gateway transfer.
//!
//! Phase A reserves the payout in one storage unit. Phase B calls the gateway
//! outside any unit, because a transfer cannot be rolled back. Phase C re-reads
//! the payout and records the outcome in a second unit. The persisted `Payout`
//! is the source of truth between phases.
//!
//! A Phase C failure after a successful transfer leaves the ledger behind the
//! gateway. That drift is reported as `CriticalDrift` and left to
//! reconciliation; it is never retried here.

use crate::application::escrow::SellerShare;
use crate::config::SettlementConfig;
use crate::domain::gateway::TransferRequest;
use crate::domain::ledger::{EntryId, EntryStatus, EntryType, LedgerEntry, SubjectId};
use crate::domain::money::Currency;
use crate::domain::order::Order;
use crate::domain::payout::{Payout, PayoutStatus};
use crate::domain::ports::{AtomicUnit, GatewayRef, StoreRef};
use crate::error::{Result, SettlementError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of Phase B, carried into Phase C instead of being thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Succeeded { transfer_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutOutcome {
    pub payout_id: Uuid,
    pub order_id: Uuid,
    pub seller_id: SubjectId,
    pub status: PayoutStatus,
    pub attempt: u32,
    pub amount: i64,
    pub currency: Currency,
    pub transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub ledger_reservation_id: Option<EntryId>,
}

impl From<&Payout> for PayoutOutcome {
    fn from(payout: &Payout) -> Self {
        Self {
            payout_id: payout.payout_id,
            order_id: payout.order_id,
            seller_id: payout.seller_id.clone(),
            status: payout.status,
            attempt: payout.attempt,
            amount: payout.amount,
            currency: payout.currency,
            transfer_id: payout.gateway_transfer_id.clone(),
            failure_reason: payout.failure_reason.clone(),
            ledger_reservation_id: payout.ledger_reservation_id,
        }
    }
}

#[derive(Clone)]
pub struct PayoutOrchestrator {
    store: StoreRef,
    gateway: GatewayRef,
    config: Arc<SettlementConfig>,
}

impl PayoutOrchestrator {
    pub fn new(store: StoreRef, gateway: GatewayRef, config: Arc<SettlementConfig>) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Runs all three phases for one seller's share of `order`.
    ///
    /// A declined transfer is not an error here: it comes back as a `Failed`
    /// outcome and the payout can be retried with a fresh attempt.
    #[instrument(skip(self, order, share), fields(order = %order.external_id, seller = %share.seller_id))]
    pub async fn execute(&self, order: &Order, share: &SellerShare) -> Result<PayoutOutcome> {
        order.ensure_held()?;
        let seller = self
            .store
            .get_seller(&share.seller_id)
            .await?
            .ok_or_else(|| SettlementError::SellerNotFound(share.seller_id.to_string()))?;

        let payout = self.reserve(order, share).await?;
        let outcome = self
            .execute_transfer(&payout, &seller.payout_destination)
            .await;
        self.finalize(payout.payout_id, outcome).await
    }

    /// Phase A. Creates or reuses the seller's payout record and its
    /// reservation marker. Only a held escrow can be paid out.
    pub async fn reserve(&self, order: &Order, share: &SellerShare) -> Result<Payout> {
        order.ensure_held()?;
        let existing = self
            .store
            .find_payout(order.id, &share.seller_id)
            .await
            .map_err(|e| SettlementError::PhaseAFailed(Box::new(e)))?;

        let mut payout = match existing {
            Some(p) if p.status.blocks_new_attempt() => {
                return Err(SettlementError::PayoutAlreadyActiveOrDone {
                    order_id: order.external_id.clone(),
                    status: p.status,
                });
            }
            Some(mut failed) => {
                failed.retry(&self.config.payout_key_prefix)?;
                info!(payout = %failed.payout_id, attempt = failed.attempt, "retrying failed payout");
                failed
            }
            None => Payout::start(
                order.id,
                share.seller_id.clone(),
                share.amount,
                order.currency,
                &self.config.payout_key_prefix,
            ),
        };

        let mut unit = AtomicUnit::new();
        if payout.ledger_reservation_id.is_none() {
            let reservation = LedgerEntry::new(
                format!("payout_reservation_{}", payout.payout_id.simple()),
                payout.seller_id.clone(),
                EntryType::PayoutReservation,
                0,
                payout.currency,
                EntryStatus::Locked,
            )
            .for_order(payout.order_id)
            .with_metadata("payout_id", payout.payout_id);
            payout.ledger_reservation_id = Some(reservation.id);
            unit = unit.entry(reservation);
        }

        self.store
            .commit(unit.payout(payout.clone()))
            .await
            .map_err(|e| {
                warn!(payout = %payout.payout_id, error = %e, "payout reservation failed");
                SettlementError::PhaseAFailed(Box::new(e))
            })?;
        info!(payout = %payout.payout_id, attempt = payout.attempt, "payout reserved");
        Ok(payout)
    }

    /// Phase B. Never fails: the gateway's answer is captured for Phase C.
    pub async fn execute_transfer(&self, payout: &Payout, destination: &str) -> TransferOutcome {
        let request = TransferRequest {
            destination: destination.to_string(),
            amount: payout.amount,
            currency: payout.currency,
            idempotency_key: payout.transfer_key(&self.config.transfer_key_prefix),
            metadata: BTreeMap::from([
                ("payout_id".to_string(), payout.payout_id.to_string()),
                ("order_id".to_string(), payout.order_id.to_string()),
                ("attempt".to_string(), payout.attempt.to_string()),
            ]),
        };
        match self.gateway.create_transfer(request).await {
            Ok(transfer) => {
                info!(payout = %payout.payout_id, transfer = %transfer.transfer_id, "transfer created");
                TransferOutcome::Succeeded {
                    transfer_id: transfer.transfer_id,
                }
            }
            Err(e) => {
                warn!(payout = %payout.payout_id, error = %e, "transfer failed");
                TransferOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Phase C. Re-reads the payout and records the transfer outcome.
    pub async fn finalize(&self, payout_id: Uuid, outcome: TransferOutcome) -> Result<PayoutOutcome> {
        let result = self.record_outcome(payout_id, &outcome).await;
        match (result, outcome) {
            (Ok(payout), _) => Ok(PayoutOutcome::from(&payout)),
            (Err(e), TransferOutcome::Succeeded { transfer_id }) => {
                error!(
                    payout = %payout_id,
                    transfer = %transfer_id,
                    error = %e,
                    "payout transfer succeeded but could not be recorded; reconciliation required"
                );
                Err(SettlementError::CriticalDrift {
                    context: format!("payout {payout_id}"),
                    external_ref: transfer_id,
                    source: Box::new(e),
                })
            }
            (Err(e), TransferOutcome::Failed { .. }) => {
                warn!(payout = %payout_id, error = %e, "failed payout left in processing");
                Err(e)
            }
        }
    }

    async fn record_outcome(&self, payout_id: Uuid, outcome: &TransferOutcome) -> Result<Payout> {
        let mut payout = self
            .store
            .get_payout(payout_id)
            .await?
            .ok_or(SettlementError::PayoutNotFound(payout_id))?;

        let release = |outcome_label: &str| {
            LedgerEntry::new(
                format!(
                    "payout_reservation_release_{}_{}",
                    payout.payout_id.simple(),
                    payout.attempt
                ),
                payout.seller_id.clone(),
                EntryType::PayoutReservationRelease,
                0,
                payout.currency,
                EntryStatus::Settled,
            )
            .for_order(payout.order_id)
            .with_metadata("payout_id", payout.payout_id)
            .with_metadata("outcome", outcome_label)
        };

        let unit = match outcome {
            TransferOutcome::Succeeded { transfer_id } => {
                let debit = LedgerEntry::new(
                    format!("payout_debit_{}", payout.payout_id.simple()),
                    payout.seller_id.clone(),
                    EntryType::PayoutDebit,
                    payout.amount,
                    payout.currency,
                    EntryStatus::Settled,
                )
                .for_order(payout.order_id)
                .with_metadata("payout_id", payout.payout_id)
                .with_metadata("transfer_id", transfer_id);
                let unit = AtomicUnit::new().entry(debit).entry(release("completed"));
                payout.complete(transfer_id)?;
                unit
            }
            TransferOutcome::Failed { reason } => {
                let unit = AtomicUnit::new().entry(release("failed"));
                payout.fail(reason)?;
                unit
            }
        };

        self.store.commit(unit.payout(payout.clone())).await?;
        info!(payout = %payout.payout_id, status = ?payout.status, "payout finalized");
        Ok(payout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::EscrowStatus;
    use crate::domain::ports::{LedgerStore, RecordStore};
    use crate::domain::seller::SellerAccount;
    use crate::infrastructure::gateway::SandboxGateway;
    use crate::infrastructure::in_memory::InMemoryStore;

    fn seller() -> SubjectId {
        SubjectId::new("seller_1").unwrap()
    }

    fn full_share(order: &Order) -> SellerShare {
        SellerShare {
            seller_id: order.seller_id.clone(),
            amount: order.total_amount,
        }
    }

    async fn setup() -> (PayoutOrchestrator, InMemoryStore, SandboxGateway, Order) {
        let store = InMemoryStore::new();
        let gateway = SandboxGateway::default();
        let order = Order::new(
            "ord_1",
            SubjectId::new("buyer_1").unwrap(),
            seller(),
            3000,
            Currency::Usd,
            Some("pi_1".to_string()),
        );
        store
            .commit(
                AtomicUnit::new()
                    .order(order.clone())
                    .seller(SellerAccount::new(seller(), "acct_seller_1")),
            )
            .await
            .unwrap();
        let orchestrator = PayoutOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(SettlementConfig::default()),
        );
        (orchestrator, store, gateway, order)
    }

    #[tokio::test]
    async fn test_successful_payout_writes_debit_and_release() {
        let (orchestrator, store, gateway, order) = setup().await;
        let outcome = orchestrator.execute(&order, &full_share(&order)).await.unwrap();

        assert_eq!(outcome.status, PayoutStatus::Completed);
        assert_eq!(outcome.seller_id, seller());
        assert!(outcome.transfer_id.is_some());

        let entries = store.entries_for_order(order.id).await.unwrap();
        let types: Vec<EntryType> = entries.iter().map(|e| e.entry_type).collect();
        assert_eq!(
            types,
            vec![
                EntryType::PayoutReservation,
                EntryType::PayoutDebit,
                EntryType::PayoutReservationRelease
            ]
        );
        let debit = entries
            .iter()
            .find(|e| e.entry_type == EntryType::PayoutDebit)
            .unwrap();
        assert_eq!(debit.amount, -3000);
        assert_eq!(debit.status, EntryStatus::Settled);

        let transfers = gateway.transfers().await;
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].destination, "acct_seller_1");
        assert!(transfers[0].idempotency_key.starts_with("tr_po_"));
    }

    #[tokio::test]
    async fn test_active_or_completed_payout_blocks_new_attempt() {
        let (orchestrator, _, _, order) = setup().await;
        let share = full_share(&order);
        orchestrator.execute(&order, &share).await.unwrap();
        assert!(matches!(
            orchestrator.execute(&order, &share).await,
            Err(SettlementError::PayoutAlreadyActiveOrDone {
                status: PayoutStatus::Completed,
                ..
            })
        ));

        let (orchestrator, _, _, order) = setup().await;
        let share = full_share(&order);
        orchestrator.reserve(&order, &share).await.unwrap();
        assert!(matches!(
            orchestrator.reserve(&order, &share).await,
            Err(SettlementError::PayoutAlreadyActiveOrDone {
                status: PayoutStatus::Processing,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_each_seller_share_gets_its_own_payout() {
        let (orchestrator, store, gateway, order) = setup().await;
        let other = SubjectId::new("seller_2").unwrap();
        store
            .commit(AtomicUnit::new().seller(SellerAccount::new(other.clone(), "acct_seller_2")))
            .await
            .unwrap();

        let first = SellerShare {
            seller_id: seller(),
            amount: 1800,
        };
        let second = SellerShare {
            seller_id: other.clone(),
            amount: 1200,
        };
        orchestrator.execute(&order, &first).await.unwrap();
        orchestrator.execute(&order, &second).await.unwrap();

        let mut paid: Vec<(String, i64)> = gateway
            .transfers()
            .await
            .iter()
            .map(|t| (t.destination.clone(), t.amount))
            .collect();
        paid.sort();
        assert_eq!(
            paid,
            vec![("acct_seller_1".to_string(), 1800), ("acct_seller_2".to_string(), 1200)]
        );
        assert_eq!(store.payouts_for_order(order.id).await.unwrap().len(), 2);
        assert_eq!(
            store.find_payout(order.id, &other).await.unwrap().unwrap().amount,
            1200
        );
    }

    #[tokio::test]
    async fn test_payout_requires_held_escrow() {
        let (orchestrator, store, gateway, mut order) = setup().await;
        order.mark_refunded().unwrap();
        store.commit(AtomicUnit::new().order(order.clone())).await.unwrap();

        assert!(matches!(
            orchestrator.execute(&order, &full_share(&order)).await,
            Err(SettlementError::InvalidEscrowStatus {
                status: EscrowStatus::Refunded,
                ..
            })
        ));
        assert!(gateway.transfers().await.is_empty());
        assert!(store.payouts_for_order(order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replayed_phase_b_uses_same_transfer_key() {
        let (orchestrator, _, gateway, order) = setup().await;
        let payout = orchestrator.reserve(&order, &full_share(&order)).await.unwrap();

        let first = orchestrator.execute_transfer(&payout, "acct_seller_1").await;
        let replay = orchestrator.execute_transfer(&payout, "acct_seller_1").await;
        assert_eq!(first, replay);
        assert_eq!(gateway.transfers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_seller_has_no_side_effects() {
        let store = InMemoryStore::new();
        let order = Order::new(
            "ord_9",
            SubjectId::new("b").unwrap(),
            SubjectId::new("ghost").unwrap(),
            100,
            Currency::Usd,
            None,
        );
        let orchestrator = PayoutOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(SandboxGateway::default()),
            Arc::new(SettlementConfig::default()),
        );
        assert!(matches!(
            orchestrator.execute(&order, &full_share(&order)).await,
            Err(SettlementError::SellerNotFound(_))
        ));
        assert!(store.payouts_for_order(order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_unknown_payout_after_transfer_is_drift() {
        let (orchestrator, _, _, _) = setup().await;
        let result = orchestrator
            .finalize(
                Uuid::new_v4(),
                TransferOutcome::Succeeded {
                    transfer_id: "tr_x".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(SettlementError::CriticalDrift { .. })));

        let result = orchestrator
            .finalize(
                Uuid::new_v4(),
                TransferOutcome::Failed {
                    reason: "declined".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(SettlementError::PayoutNotFound(_))));
    }
}
