use crate::application::audit::AuditTrail;
use crate::application::escrow::{
    self, EscrowService, ForceReleaseOutcome, RefundOutcome, ReleaseOutcome, SellerShare,
    WalletRefundOutcome,
};
use crate::application::payout::{PayoutOrchestrator, PayoutOutcome};
use crate::application::wallet::{self, ChargeReceipt, FundingOutcome, WalletService};
use crate::config::SettlementConfig;
use crate::domain::dispute::{Dispute, DisputeStatus};
use crate::domain::gateway::PaymentIntent;
use crate::domain::ledger::{EntryId, Role, StatusRollup, SubjectId};
use crate::domain::money::{Currency, MinorUnits};
use crate::domain::order::Order;
use crate::domain::payout::PayoutStatus;
use crate::domain::ports::{AtomicUnit, AuditSinkRef, GatewayRef, StoreRef};
use crate::domain::seller::SellerAccount;
use crate::error::{Result, SettlementError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// `{ "success": bool, ...fields }` as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Response<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuyerBalance {
    pub buyer_id: SubjectId,
    pub currency: Currency,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SellerBalance {
    pub seller_id: SubjectId,
    pub balances: BTreeMap<Currency, StatusRollup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualPayout {
    pub order_id: String,
    pub payouts: Vec<PayoutOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedOrder {
    pub order: Order,
    pub entry_ids: Vec<EntryId>,
}

/// One line of the end-of-run balance report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceRow {
    pub subject_id: SubjectId,
    pub role: Role,
    pub currency: Currency,
    pub rollup: StatusRollup,
}

/// The entry point for every settlement operation.
///
/// `SettlementEngine` wires the wallet, escrow and payout services over one
/// store and one gateway. Each operation is request-scoped; nothing is
/// serialized across calls beyond what a single storage unit guarantees.
#[derive(Clone)]
pub struct SettlementEngine {
    store: StoreRef,
    wallet: WalletService,
    escrow: EscrowService,
    config: Arc<SettlementConfig>,
}

impl SettlementEngine {
    pub fn new(
        store: StoreRef,
        gateway: GatewayRef,
        audit: Option<AuditSinkRef>,
        config: SettlementConfig,
    ) -> Self {
        let config = Arc::new(config);
        let wallet = WalletService::new(store.clone(), gateway.clone(), config.clone());
        let payouts = PayoutOrchestrator::new(store.clone(), gateway.clone(), config.clone());
        let escrow = EscrowService::new(
            store.clone(),
            gateway,
            payouts,
            wallet.clone(),
            AuditTrail::new(audit),
            config.clone(),
        );
        Self {
            store,
            wallet,
            escrow,
            config,
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub async fn release_escrow(&self, order_ref: &str, actor_id: &str) -> Result<Response<ReleaseOutcome>> {
        self.escrow.release(order_ref, actor_id).await.map(Response::ok)
    }

    pub async fn refund_escrow(
        &self,
        order_ref: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<Response<RefundOutcome>> {
        self.escrow.refund(order_ref, actor_id, reason).await.map(Response::ok)
    }

    pub async fn refund_to_wallet(
        &self,
        order_ref: &str,
        actor_id: &str,
        justification: &str,
    ) -> Result<Response<WalletRefundOutcome>> {
        self.escrow
            .refund_to_wallet(order_ref, actor_id, justification)
            .await
            .map(Response::ok)
    }

    pub async fn force_release(
        &self,
        order_ref: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<Response<ForceReleaseOutcome>> {
        self.escrow
            .force_release(order_ref, actor_id, reason)
            .await
            .map(Response::ok)
    }

    /// Administrative payout trigger for every seller share of a held order.
    /// A declined transfer is reported with `success: false` and a `FAILED`
    /// payout, not as an error.
    #[instrument(skip(self))]
    pub async fn execute_manual_payout(
        &self,
        order_ref: &str,
        currency: Currency,
    ) -> Result<Response<ManualPayout>> {
        let order = self.store.resolve_order(order_ref).await?;
        if order.currency != currency {
            return Err(SettlementError::ValidationError(format!(
                "Order {} is in {}, not {currency}",
                order.external_id, order.currency
            )));
        }
        let payouts = self.escrow.pay_out(&order).await?;
        Ok(Response {
            success: payouts.iter().all(|p| p.status == PayoutStatus::Completed),
            data: ManualPayout {
                order_id: order.external_id,
                payouts,
            },
        })
    }

    pub async fn fund_wallet(
        &self,
        buyer_id: &SubjectId,
        amount: MinorUnits,
        currency: Currency,
    ) -> Result<Response<PaymentIntent>> {
        self.wallet
            .create_funding_intent(buyer_id, amount, currency)
            .await
            .map(Response::ok)
    }

    pub async fn confirm_funding(&self, intent_id: &str) -> Result<Response<FundingOutcome>> {
        self.wallet.confirm_funding(intent_id).await.map(Response::ok)
    }

    pub async fn get_buyer_balance(
        &self,
        buyer_id: &SubjectId,
        currency: Currency,
    ) -> Result<Response<BuyerBalance>> {
        let balance = self.wallet.get_balance(buyer_id, currency).await?;
        Ok(Response::ok(BuyerBalance {
            buyer_id: buyer_id.clone(),
            currency,
            balance,
        }))
    }

    pub async fn get_seller_balance(&self, seller_id: &SubjectId) -> Result<Response<SellerBalance>> {
        let balances = self.escrow.seller_balance(seller_id).await?;
        Ok(Response::ok(SellerBalance {
            seller_id: seller_id.clone(),
            balances,
        }))
    }

    pub async fn charge_buyer(
        &self,
        buyer_id: &SubjectId,
        amount: MinorUnits,
        currency: Currency,
        description: &str,
    ) -> Result<Response<ChargeReceipt>> {
        self.wallet
            .charge_buyer(buyer_id, amount, currency, description)
            .await
            .map(Response::ok)
    }

    pub async fn register_seller(&self, seller: SellerAccount) -> Result<Response<SellerAccount>> {
        self.store
            .commit(AtomicUnit::new().seller(seller.clone()))
            .await?;
        info!(seller = %seller.seller_id, status = ?seller.risk_status, "seller registered");
        Ok(Response::ok(seller))
    }

    /// Records a paid order and puts its funds in escrow, in one unit.
    ///
    /// Card-paid orders (with a payment reference) are captured. Orders without
    /// one are paid from the buyer's wallet; the balance is checked before the
    /// unit is built and re-checked after it commits.
    #[instrument(skip(self, order, shares), fields(order = %order.external_id))]
    pub async fn place_order(&self, order: Order, shares: &[SellerShare]) -> Result<Response<PlacedOrder>> {
        self.config.ensure_supported(order.currency)?;
        let total = MinorUnits::new(order.total_amount)?;
        if self
            .store
            .find_order_by_external_id(&order.external_id)
            .await?
            .is_some()
        {
            return Err(SettlementError::ValidationError(format!(
                "Order {} already exists",
                order.external_id
            )));
        }
        let shares = escrow::allocate_shares(&order, shares)?;

        let entries = match &order.payment_intent_id {
            Some(intent_id) => escrow::capture_entries(&order, &shares, intent_id),
            None => {
                let plan = self
                    .wallet
                    .prepare_charge(
                        &order.buyer_id,
                        total,
                        order.currency,
                        &format!("order {}", order.external_id),
                    )
                    .await?;
                let locks = shares.iter().map(|share| {
                    wallet::escrow_lock_entry(&order, &share.seller_id, share.amount)
                        .with_metadata("source", "wallet")
                });
                std::iter::once(plan.debit_entry()).chain(locks).collect()
            }
        };

        let unit = entries
            .into_iter()
            .fold(AtomicUnit::new().order(order.clone()), AtomicUnit::entry);
        let entry_ids = self.store.commit(unit).await?;
        if order.payment_intent_id.is_none() {
            self.wallet
                .assert_invariants(&order.buyer_id, order.currency)
                .await?;
        }
        info!(order = %order.external_id, sellers = shares.len(), "order placed in escrow");
        Ok(Response::ok(PlacedOrder { order, entry_ids }))
    }

    /// Opens a dispute against an order. `amount` defaults to the order total.
    pub async fn open_dispute(
        &self,
        order_ref: &str,
        amount: Option<i64>,
        reason: &str,
    ) -> Result<Response<Dispute>> {
        let order = self.store.resolve_order(order_ref).await?;
        order.ensure_held()?;
        if let Some(existing) = self.store.find_dispute_by_order(order.id).await?
            && existing.status == DisputeStatus::Open
        {
            return Err(SettlementError::ValidationError(format!(
                "Order {} already has an open dispute",
                order.external_id
            )));
        }
        let dispute = Dispute::open(order.id, amount.unwrap_or(order.total_amount), reason);
        self.store
            .commit(AtomicUnit::new().dispute(dispute.clone()))
            .await?;
        info!(order = %order.external_id, dispute = %dispute.id, "dispute opened");
        Ok(Response::ok(dispute))
    }

    /// Per-subject, per-currency balance rollup over the whole ledger.
    pub async fn report(&self) -> Result<Vec<BalanceRow>> {
        let mut rows = Vec::new();
        for (subject_id, role) in self.store.subjects().await? {
            let rollups = self.store.aggregate_by_status(&subject_id, role).await?;
            for (currency, rollup) in rollups {
                rows.push(BalanceRow {
                    subject_id: subject_id.clone(),
                    role,
                    currency,
                    rollup,
                });
            }
        }
        Ok(rows)
    }
}
