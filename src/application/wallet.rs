//! Buyer wallets: funding through the payment gateway, spending against the
//! ledger, and the non-negative balance invariant.
//!
//! Charges are optimistic. The balance check and the debit are separate steps
//! and nothing serializes two charges against the same wallet, so a lost race
//! surfaces as an `InvariantViolation` from the post-write check.

use crate::config::SettlementConfig;
use crate::domain::gateway::{ConfirmationStatus, PaymentConfirmation, PaymentIntent};
use crate::domain::ledger::{
    BUYER_WALLET_TYPES, EntryId, EntryStatus, EntryType, LedgerEntry, Role, SubjectId,
};
use crate::domain::money::{Currency, MinorUnits};
use crate::domain::order::Order;
use crate::domain::ports::{GatewayRef, StoreRef};
use crate::error::{Result, SettlementError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// A charge that passed the balance check but has not been written yet.
#[derive(Debug, Clone)]
pub struct ChargePlan {
    pub buyer_id: SubjectId,
    pub amount: MinorUnits,
    pub currency: Currency,
    pub description: String,
    pub observed_balance: i64,
}

impl ChargePlan {
    /// The purchase debit this plan writes.
    pub fn debit_entry(&self) -> LedgerEntry {
        LedgerEntry::new(
            format!("wallet_debit_{}", Uuid::new_v4().simple()),
            self.buyer_id.clone(),
            EntryType::WalletDebitPurchase,
            self.amount.value(),
            self.currency,
            EntryStatus::Available,
        )
        .with_metadata("description", &self.description)
    }
}

/// One seller's escrow lock for a paid order.
pub fn escrow_lock_entry(order: &Order, seller_id: &SubjectId, amount: i64) -> LedgerEntry {
    LedgerEntry::new(
        format!("escrow_lock_{}_{}", order.id.simple(), seller_id),
        seller_id.clone(),
        EntryType::EscrowLock,
        amount,
        order.currency,
        EntryStatus::Locked,
    )
    .for_order(order.id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeReceipt {
    pub entry_id: EntryId,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundingOutcome {
    pub buyer_id: SubjectId,
    pub currency: Currency,
    pub balance: i64,
    pub already_processed: bool,
    pub entry_id: Option<EntryId>,
}

#[derive(Clone)]
pub struct WalletService {
    store: StoreRef,
    gateway: GatewayRef,
    config: Arc<SettlementConfig>,
}

impl WalletService {
    pub fn new(store: StoreRef, gateway: GatewayRef, config: Arc<SettlementConfig>) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub async fn get_balance(&self, buyer_id: &SubjectId, currency: Currency) -> Result<i64> {
        self.store
            .balance(buyer_id, Role::Buyer, currency, BUYER_WALLET_TYPES)
            .await
    }

    /// Post-condition check after wallet writes. Returns the checked balance.
    pub async fn assert_invariants(&self, buyer_id: &SubjectId, currency: Currency) -> Result<i64> {
        let balance = self.get_balance(buyer_id, currency).await?;
        if balance < 0 {
            error!(buyer = %buyer_id, %currency, balance, "wallet balance went negative");
            return Err(SettlementError::InvariantViolation(format!(
                "negative balance {balance} {currency} for buyer {buyer_id}"
            )));
        }
        Ok(balance)
    }

    pub async fn charge_buyer(
        &self,
        buyer_id: &SubjectId,
        amount: MinorUnits,
        currency: Currency,
        description: &str,
    ) -> Result<ChargeReceipt> {
        let plan = self
            .prepare_charge(buyer_id, amount, currency, description)
            .await?;
        self.apply_charge(plan).await
    }

    /// Reads the balance and checks it covers the charge. Nothing is written.
    pub async fn prepare_charge(
        &self,
        buyer_id: &SubjectId,
        amount: MinorUnits,
        currency: Currency,
        description: &str,
    ) -> Result<ChargePlan> {
        self.config.ensure_supported(currency)?;
        let balance = self.get_balance(buyer_id, currency).await?;
        if balance < amount.value() {
            return Err(SettlementError::InsufficientFunds {
                available: balance,
                required: amount.value(),
            });
        }
        Ok(ChargePlan {
            buyer_id: buyer_id.clone(),
            amount,
            currency,
            description: description.to_string(),
            observed_balance: balance,
        })
    }

    /// Writes the debit for a prepared charge, then re-checks the invariant.
    #[instrument(skip(self, plan), fields(buyer = %plan.buyer_id, amount = plan.amount.value()))]
    pub async fn apply_charge(&self, plan: ChargePlan) -> Result<ChargeReceipt> {
        let entry_id = self.store.append(plan.debit_entry()).await?;
        let balance = self.assert_invariants(&plan.buyer_id, plan.currency).await?;
        info!(balance, "wallet charged");
        Ok(ChargeReceipt { entry_id, balance })
    }

    /// Mirrors a wallet-funded purchase into the seller's escrow.
    pub async fn lock_funds_for_seller(
        &self,
        seller_id: &SubjectId,
        amount: MinorUnits,
        currency: Currency,
        order: &Order,
    ) -> Result<EntryId> {
        self.config.ensure_supported(currency)?;
        if currency != order.currency {
            return Err(SettlementError::ValidationError(format!(
                "Order {} is in {}, not {currency}",
                order.external_id, order.currency
            )));
        }
        let entry = escrow_lock_entry(order, seller_id, amount.value()).with_metadata("source", "wallet");
        self.store.append(entry).await
    }

    /// Starts a top-up. The buyer pays the returned intent client-side.
    pub async fn create_funding_intent(
        &self,
        buyer_id: &SubjectId,
        amount: MinorUnits,
        currency: Currency,
    ) -> Result<PaymentIntent> {
        self.config.ensure_supported(currency)?;
        let metadata = BTreeMap::from([
            (
                PaymentConfirmation::BUYER_KEY.to_string(),
                buyer_id.to_string(),
            ),
            (
                PaymentConfirmation::PURPOSE_KEY.to_string(),
                PaymentConfirmation::WALLET_FUNDING.to_string(),
            ),
        ]);
        let intent = self
            .gateway
            .create_payment_intent(amount, currency, metadata)
            .await?;
        info!(buyer = %buyer_id, intent = %intent.intent_id, "funding intent created");
        Ok(intent)
    }

    /// Looks the confirmation up at the gateway and credits the wallet.
    pub async fn confirm_funding(&self, intent_id: &str) -> Result<FundingOutcome> {
        let confirmation = self.gateway.retrieve_payment_confirmation(intent_id).await?;
        self.process_funding_success(&confirmation).await
    }

    /// Credits a confirmed funding payment exactly once.
    ///
    /// Safe to call for every delivery of the same confirmation: a credit
    /// already keyed to the payment reference short-circuits with
    /// `already_processed = true` and writes nothing.
    #[instrument(skip(self, confirmation), fields(intent = %confirmation.intent_id))]
    pub async fn process_funding_success(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> Result<FundingOutcome> {
        if confirmation.status != ConfirmationStatus::Succeeded {
            return Err(SettlementError::ValidationError(format!(
                "Payment {} is {:?}, not succeeded",
                confirmation.intent_id, confirmation.status
            )));
        }
        self.config.ensure_supported(confirmation.currency)?;
        let amount = MinorUnits::new(confirmation.amount)?;
        let buyer_id = confirmation
            .metadata
            .get(PaymentConfirmation::BUYER_KEY)
            .ok_or_else(|| {
                SettlementError::ValidationError(format!(
                    "Payment {} is not tagged with a buyer",
                    confirmation.intent_id
                ))
            })
            .and_then(|id| SubjectId::new(id.as_str()))?;

        if self
            .store
            .find_by_payment_intent(&confirmation.intent_id, EntryType::WalletCreditPlaceholder)
            .await?
            .is_some()
        {
            return self.already_processed(buyer_id, confirmation.currency).await;
        }

        let entry = LedgerEntry::new(
            format!("wallet_funding_{}", confirmation.intent_id),
            buyer_id.clone(),
            EntryType::WalletCreditPlaceholder,
            amount.value(),
            confirmation.currency,
            EntryStatus::Available,
        )
        .with_payment_intent(&confirmation.intent_id);

        let entry_id = match self.store.append(entry).await {
            Ok(id) => id,
            // A concurrent delivery won the write.
            Err(SettlementError::DuplicateExternalId(_)) => {
                return self.already_processed(buyer_id, confirmation.currency).await;
            }
            Err(e) => return Err(e),
        };
        let balance = self
            .assert_invariants(&buyer_id, confirmation.currency)
            .await?;
        info!(buyer = %buyer_id, balance, "wallet funded");
        Ok(FundingOutcome {
            buyer_id,
            currency: confirmation.currency,
            balance,
            already_processed: false,
            entry_id: Some(entry_id),
        })
    }

    async fn already_processed(
        &self,
        buyer_id: SubjectId,
        currency: Currency,
    ) -> Result<FundingOutcome> {
        let balance = self.get_balance(&buyer_id, currency).await?;
        info!(buyer = %buyer_id, balance, "funding confirmation already processed");
        Ok(FundingOutcome {
            buyer_id,
            currency,
            balance,
            already_processed: true,
            entry_id: None,
        })
    }
}
