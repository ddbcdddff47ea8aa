//! Per-order escrow transitions.
//!
//! ```text
//! held ──release──────────▶ released
//!  │
//!  ├──refund (gateway)────▶ refunded
//!  └──refund_to_wallet────▶ refunded
//! ```
//!
//! Every transition checks `held` first, so a repeated call fails with
//! `InvalidEscrowStatus` before anything is written. An order's escrow may be
//! split across several sellers; payouts, releases and reversals are written
//! per seller share.

use crate::application::audit::AuditTrail;
use crate::application::payout::{PayoutOrchestrator, PayoutOutcome};
use crate::application::wallet::{self, WalletService};
use crate::config::SettlementConfig;
use crate::domain::dispute::{Dispute, DisputeStatus};
use crate::domain::gateway::RefundReceipt;
use crate::domain::ledger::{
    EntryId, EntryStatus, EntryType, LedgerEntry, Role, StatusRollup, SubjectId,
};
use crate::domain::money::Currency;
use crate::domain::order::Order;
use crate::domain::payout::PayoutStatus;
use crate::domain::ports::{AtomicUnit, AuditOutcome, GatewayRef, StoreRef};
use crate::error::{Result, SettlementError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// One seller's part of a captured payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerShare {
    pub seller_id: SubjectId,
    pub amount: i64,
}

/// Splits an order total across sellers. No shares means the order's own
/// seller takes the whole amount. A seller may hold at most one share.
pub fn allocate_shares(order: &Order, shares: &[SellerShare]) -> Result<Vec<SellerShare>> {
    if shares.is_empty() {
        return Ok(vec![SellerShare {
            seller_id: order.seller_id.clone(),
            amount: order.total_amount,
        }]);
    }
    let mut seen = HashSet::new();
    if let Some(repeated) = shares.iter().find(|s| !seen.insert(&s.seller_id)) {
        return Err(SettlementError::ValidationError(format!(
            "Seller {} holds more than one share of order {}",
            repeated.seller_id, order.external_id
        )));
    }
    let allocated: i64 = shares.iter().map(|s| s.amount).sum();
    if allocated != order.total_amount || shares.iter().any(|s| s.amount <= 0) {
        return Err(SettlementError::ValidationError(format!(
            "Seller shares {allocated} do not split order total {}",
            order.total_amount
        )));
    }
    Ok(shares.to_vec())
}

/// The platform capture and one escrow lock per share for a card payment.
pub fn capture_entries(order: &Order, shares: &[SellerShare], intent_id: &str) -> Vec<LedgerEntry> {
    let capture = LedgerEntry::new(
        format!("payment_capture_{}", order.id.simple()),
        SubjectId::platform(),
        EntryType::PaymentCapture,
        order.total_amount,
        order.currency,
        EntryStatus::Available,
    )
    .for_order(order.id)
    .with_payment_intent(intent_id);

    let mut entries = vec![capture];
    entries.extend(shares.iter().map(|share| {
        wallet::escrow_lock_entry(order, &share.seller_id, share.amount).with_payment_intent(intent_id)
    }));
    entries
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    pub order: Order,
    pub payouts: Vec<PayoutOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundOutcome {
    pub order: Order,
    pub receipt: RefundReceipt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletRefundOutcome {
    pub order: Order,
    pub dispute: Dispute,
    pub credited: i64,
    pub buyer_balance: i64,
}

/// A seller's locked funds moved to available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleasedShare {
    pub seller_id: SubjectId,
    pub amount: i64,
    pub debit_entry_id: EntryId,
    pub credit_entry_id: EntryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForceReleaseOutcome {
    pub order: Order,
    pub amount: i64,
    pub shares: Vec<ReleasedShare>,
}

/// Where one seller's funds for one order currently sit.
#[derive(Debug, Clone, Copy, Default)]
struct SellerPosition {
    escrowed: i64,
    locked: i64,
    available: i64,
}

type Positions = BTreeMap<SubjectId, SellerPosition>;

#[derive(Clone)]
pub struct EscrowService {
    store: StoreRef,
    gateway: GatewayRef,
    payouts: PayoutOrchestrator,
    wallet: WalletService,
    audit: AuditTrail,
    config: Arc<SettlementConfig>,
}

impl EscrowService {
    pub fn new(
        store: StoreRef,
        gateway: GatewayRef,
        payouts: PayoutOrchestrator,
        wallet: WalletService,
        audit: AuditTrail,
        config: Arc<SettlementConfig>,
    ) -> Self {
        Self {
            store,
            gateway,
            payouts,
            wallet,
            audit,
            config,
        }
    }

    /// Records a successful card payment: one platform capture and one escrow
    /// lock per seller share, in a single unit.
    #[instrument(skip(self, shares))]
    pub async fn capture_payment(
        &self,
        order_ref: &str,
        shares: &[SellerShare],
    ) -> Result<Vec<EntryId>> {
        let order = self.store.resolve_order(order_ref).await?;
        order.ensure_held()?;
        self.config.ensure_supported(order.currency)?;
        let intent_id = order.payment_intent_id.clone().ok_or_else(|| {
            SettlementError::MissingPaymentReference {
                order_id: order.external_id.clone(),
            }
        })?;

        let shares = allocate_shares(&order, shares)?;
        let unit = capture_entries(&order, &shares, &intent_id)
            .into_iter()
            .fold(AtomicUnit::new(), AtomicUnit::entry);

        let ids = self.store.commit(unit).await?;
        info!(order = %order.external_id, amount = order.total_amount, sellers = shares.len(), "payment captured into escrow");
        Ok(ids)
    }

    /// Pays every seller share out, then marks the escrow released and moves
    /// any still locked funds to available. If a payout does not complete the
    /// order stays `held`; completed shares are not paid again on retry.
    #[instrument(skip(self))]
    pub async fn release(&self, order_ref: &str, actor_id: &str) -> Result<ReleaseOutcome> {
        let order = self.store.resolve_order(order_ref).await?;
        order.ensure_held()?;

        let payouts = self.pay_out_shares(&order).await?;
        if let Some(unpaid) = payouts.iter().find(|p| p.status != PayoutStatus::Completed) {
            let reason = unpaid
                .failure_reason
                .clone()
                .unwrap_or_else(|| "payout did not complete".to_string());
            warn!(order = %order.external_id, seller = %unpaid.seller_id, %reason, "release aborted, escrow stays held");
            return Err(SettlementError::GatewayError(reason));
        }

        let mut order = self
            .store
            .get_order(order.id)
            .await?
            .ok_or_else(|| SettlementError::OrderNotFound(order_ref.to_string()))?;
        order.mark_released(actor_id, Utc::now())?;
        let positions = self.positions(&order).await?;
        let (entries, _) = release_pairs(&order, &positions, actor_id, "released");
        let unit = entries
            .into_iter()
            .fold(AtomicUnit::new().order(order.clone()), AtomicUnit::entry);
        self.store.commit(unit).await?;
        info!(order = %order.external_id, sellers = payouts.len(), "escrow released");
        Ok(ReleaseOutcome { order, payouts })
    }

    /// Administrative payout of every seller share without releasing the
    /// escrow. Fails when every share has already been paid.
    #[instrument(skip(self, order), fields(order = %order.external_id))]
    pub async fn pay_out(&self, order: &Order) -> Result<Vec<PayoutOutcome>> {
        order.ensure_held()?;
        let shares = self.escrowed_shares(order).await?;
        let payouts = self.store.payouts_for_order(order.id).await?;
        let all_paid = shares.iter().all(|share| {
            payouts
                .iter()
                .any(|p| p.seller_id == share.seller_id && p.status == PayoutStatus::Completed)
        });
        if all_paid {
            return Err(SettlementError::PayoutAlreadyActiveOrDone {
                order_id: order.external_id.clone(),
                status: PayoutStatus::Completed,
            });
        }
        self.pay_out_shares(order).await
    }

    /// Refunds the buyer's card through the gateway and reverses the escrow.
    #[instrument(skip(self))]
    pub async fn refund(&self, order_ref: &str, actor_id: &str, reason: &str) -> Result<RefundOutcome> {
        let mut order = self.store.resolve_order(order_ref).await?;
        order.ensure_held()?;
        let payment_reference = order.payment_intent_id.clone().ok_or_else(|| {
            SettlementError::MissingPaymentReference {
                order_id: order.external_id.clone(),
            }
        })?;
        self.ensure_not_paid_out(&order).await?;

        let receipt = match self.gateway.refund(&payment_reference, None, reason).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.audit
                    .record("refund", &order.external_id, actor_id, AuditOutcome::Failed, e.to_string())
                    .await;
                return Err(e);
            }
        };

        let positions = self.positions(&order).await?;
        let refund = LedgerEntry::new(
            format!("refund_{}", receipt.refund_id),
            SubjectId::platform(),
            EntryType::Refund,
            receipt.amount,
            receipt.currency,
            EntryStatus::Available,
        )
        .for_order(order.id)
        .with_payment_intent(&payment_reference)
        .with_metadata("actor", actor_id)
        .with_metadata("reason", reason)
        .with_metadata("refund_id", &receipt.refund_id);

        order.mark_refunded()?;
        let unit = seller_reversals(&order, &positions, "refund")
            .into_iter()
            .fold(AtomicUnit::new().entry(refund).order(order.clone()), AtomicUnit::entry);

        if let Err(e) = self.store.commit(unit).await {
            error!(order = %order.external_id, refund = %receipt.refund_id, error = %e,
                "gateway refund succeeded but could not be recorded; reconciliation required");
            self.audit
                .record("refund", &order.external_id, actor_id, AuditOutcome::Failed, e.to_string())
                .await;
            return Err(SettlementError::CriticalDrift {
                context: format!("refund of order {}", order.external_id),
                external_ref: receipt.refund_id,
                source: Box::new(e),
            });
        }

        self.audit
            .record("refund", &order.external_id, actor_id, AuditOutcome::Succeeded, receipt.refund_id.clone())
            .await;
        info!(order = %order.external_id, amount = receipt.amount, "escrow refunded to card");
        Ok(RefundOutcome { order, receipt })
    }

    /// Credits the buyer's wallet instead of refunding the card. Requires an
    /// open dispute, which is closed in the same unit.
    #[instrument(skip(self, justification))]
    pub async fn refund_to_wallet(
        &self,
        order_ref: &str,
        actor_id: &str,
        justification: &str,
    ) -> Result<WalletRefundOutcome> {
        let mut order = self.store.resolve_order(order_ref).await?;
        order.ensure_held()?;

        let mut dispute = match self.store.find_dispute_by_order(order.id).await? {
            Some(d) if d.status == DisputeStatus::Open => d,
            other => {
                return Err(SettlementError::NoOpenDispute {
                    order_id: order.external_id.clone(),
                    status: other.map(|d| d.status),
                });
            }
        };
        self.ensure_not_paid_out(&order).await?;

        let positions = self.positions(&order).await?;
        let credit = LedgerEntry::new(
            format!("wallet_refund_{}", order.id.simple()),
            order.buyer_id.clone(),
            EntryType::WalletCreditRefund,
            order.total_amount,
            order.currency,
            EntryStatus::Available,
        )
        .for_order(order.id)
        .with_metadata("actor", actor_id)
        .with_metadata("justification", justification)
        .with_metadata("dispute_id", dispute.id);

        order.mark_refunded()?;
        dispute.close("refunded_to_wallet", actor_id, justification)?;
        let unit = seller_reversals(&order, &positions, "refund_to_wallet")
            .into_iter()
            .fold(
                AtomicUnit::new()
                    .entry(credit)
                    .order(order.clone())
                    .dispute(dispute.clone()),
                AtomicUnit::entry,
            );
        self.store.commit(unit).await?;

        let buyer_balance = self
            .wallet
            .assert_invariants(&order.buyer_id, order.currency)
            .await?;
        info!(order = %order.external_id, buyer = %order.buyer_id, buyer_balance, "escrow refunded to wallet");
        Ok(WalletRefundOutcome {
            credited: order.total_amount,
            order,
            dispute,
            buyer_balance,
        })
    }

    /// Makes an order payable now, bypassing time-based holds. Every seller
    /// with locked funds on the order must be active.
    #[instrument(skip(self, reason))]
    pub async fn force_release(
        &self,
        order_ref: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<ForceReleaseOutcome> {
        let mut order = self.store.resolve_order(order_ref).await?;
        order.ensure_held()?;
        let positions = self.positions(&order).await?;

        let mut sellers: BTreeSet<&SubjectId> = positions
            .iter()
            .filter(|(_, p)| p.locked > 0)
            .map(|(id, _)| id)
            .collect();
        sellers.insert(&order.seller_id);
        for seller_id in sellers {
            self.store
                .get_seller(seller_id)
                .await?
                .ok_or_else(|| SettlementError::SellerNotFound(seller_id.to_string()))?
                .ensure_force_releasable()?;
        }
        order.mark_eligible(actor_id, reason, Utc::now())?;

        let (entries, shares) = release_pairs(&order, &positions, actor_id, reason);
        if shares.is_empty() {
            return Err(SettlementError::ValidationError(format!(
                "Order {} has no locked escrow to release",
                order.external_id
            )));
        }
        let amount = shares.iter().map(|s| s.amount).sum();

        let unit = entries
            .into_iter()
            .fold(AtomicUnit::new().order(order.clone()), AtomicUnit::entry);
        self.store.commit(unit).await?;
        info!(order = %order.external_id, actor = actor_id, amount, sellers = shares.len(), "escrow force released");
        Ok(ForceReleaseOutcome {
            order,
            amount,
            shares,
        })
    }

    pub async fn seller_balance(&self, seller_id: &SubjectId) -> Result<BTreeMap<Currency, StatusRollup>> {
        self.store.aggregate_by_status(seller_id, Role::Seller).await
    }

    /// One payout per escrowed share. A share whose payout already completed
    /// is reported as is, without a new transfer.
    async fn pay_out_shares(&self, order: &Order) -> Result<Vec<PayoutOutcome>> {
        let shares = self.escrowed_shares(order).await?;
        let existing = self.store.payouts_for_order(order.id).await?;
        let mut outcomes = Vec::with_capacity(shares.len());
        for share in &shares {
            let outcome = match existing.iter().find(|p| p.seller_id == share.seller_id) {
                Some(p) if p.status == PayoutStatus::Completed => PayoutOutcome::from(p),
                _ => self.payouts.execute(order, share).await?,
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn escrowed_shares(&self, order: &Order) -> Result<Vec<SellerShare>> {
        let shares: Vec<SellerShare> = self
            .positions(order)
            .await?
            .into_iter()
            .filter(|(_, p)| p.escrowed > 0)
            .map(|(seller_id, p)| SellerShare {
                seller_id,
                amount: p.escrowed,
            })
            .collect();
        if shares.is_empty() {
            return Err(SettlementError::ValidationError(format!(
                "Order {} has no escrow to pay out",
                order.external_id
            )));
        }
        Ok(shares)
    }

    /// A refund must not race or follow money already sent to a seller.
    async fn ensure_not_paid_out(&self, order: &Order) -> Result<()> {
        let payouts = self.store.payouts_for_order(order.id).await?;
        match payouts.iter().find(|p| p.status.blocks_new_attempt()) {
            Some(payout) => Err(SettlementError::PayoutAlreadyActiveOrDone {
                order_id: order.external_id.clone(),
                status: payout.status,
            }),
            None => Ok(()),
        }
    }

    async fn positions(&self, order: &Order) -> Result<Positions> {
        let entries = self.store.entries_for_order(order.id).await?;
        let mut positions = Positions::new();
        for entry in entries.iter().filter(|e| e.role == Role::Seller) {
            let position = positions.entry(entry.subject_id.clone()).or_default();
            if entry.entry_type == EntryType::EscrowLock {
                position.escrowed += entry.amount;
            }
            match entry.status {
                EntryStatus::Locked => position.locked += entry.amount,
                EntryStatus::Available => position.available += entry.amount,
                EntryStatus::Settled => {}
            }
        }
        Ok(positions)
    }
}

/// Paired locked debit and available credit for every seller that still has
/// funds locked on the order.
fn release_pairs(
    order: &Order,
    positions: &Positions,
    actor_id: &str,
    reason: &str,
) -> (Vec<LedgerEntry>, Vec<ReleasedShare>) {
    let mut entries = Vec::new();
    let mut shares = Vec::new();
    for (seller_id, position) in positions.iter().filter(|(_, p)| p.locked > 0) {
        let paired = |entry_type: EntryType, status: EntryStatus| {
            LedgerEntry::new(
                format!("{}_{}_{}", entry_type, order.id.simple(), seller_id),
                seller_id.clone(),
                entry_type,
                position.locked,
                order.currency,
                status,
            )
            .for_order(order.id)
            .with_metadata("actor", actor_id)
            .with_metadata("reason", reason)
        };
        let debit = paired(EntryType::EscrowReleaseDebit, EntryStatus::Locked);
        let credit = paired(EntryType::EscrowReleaseCredit, EntryStatus::Available);
        shares.push(ReleasedShare {
            seller_id: seller_id.clone(),
            amount: position.locked,
            debit_entry_id: debit.id,
            credit_entry_id: credit.id,
        });
        entries.push(debit);
        entries.push(credit);
    }
    (entries, shares)
}

/// Takes each seller's escrow for a refunded order back out of whichever
/// status it currently sits in. Sellers with nothing left are skipped.
fn seller_reversals(order: &Order, positions: &Positions, reason: &str) -> Vec<LedgerEntry> {
    positions
        .iter()
        .filter_map(|(seller_id, position)| {
            let (amount, status) = if position.available > 0 {
                (position.available, EntryStatus::Available)
            } else if position.locked > 0 {
                (position.locked, EntryStatus::Locked)
            } else {
                return None;
            };
            Some(
                LedgerEntry::new(
                    format!("seller_reversal_{}_{}", order.id.simple(), seller_id),
                    seller_id.clone(),
                    EntryType::SellerReversal,
                    amount,
                    order.currency,
                    status,
                )
                .for_order(order.id)
                .with_metadata("reason", reason),
            )
        })
        .collect()
}
