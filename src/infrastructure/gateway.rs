use crate::config::SandboxGatewayConfig;
use crate::domain::gateway::{
    ConfirmationStatus, PaymentConfirmation, PaymentIntent, RefundReceipt, Transfer,
    TransferRequest,
};
use crate::domain::money::{Currency, MinorUnits};
use crate::domain::ports::PaymentGateway;
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CapturedPayment {
    amount: i64,
    refunded: i64,
    currency: Currency,
}

#[derive(Default)]
struct SandboxState {
    transfers: HashMap<String, (Transfer, TransferRequest)>,
    transfer_calls: usize,
    scripted_failures: VecDeque<String>,
    payments: HashMap<String, CapturedPayment>,
    intents: HashMap<String, PaymentConfirmation>,
}

/// In-process stand-in for the payment processor.
///
/// It honours idempotency keys the way a real processor does: replaying a
/// transfer key returns the original transfer instead of moving money twice.
#[derive(Clone)]
pub struct SandboxGateway {
    config: SandboxGatewayConfig,
    state: Arc<Mutex<SandboxState>>,
}

impl SandboxGateway {
    pub fn new(config: SandboxGatewayConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SandboxState::default())),
        }
    }

    /// Registers a captured card payment so it can later be refunded.
    pub async fn record_captured_payment(&self, reference: &str, amount: i64, currency: Currency) {
        let mut state = self.state.lock().await;
        state.payments.insert(
            reference.to_string(),
            CapturedPayment {
                amount,
                refunded: 0,
                currency,
            },
        );
    }

    /// The next `count` transfer calls with a new key fail with `reason`.
    pub async fn fail_next_transfers(&self, count: usize, reason: &str) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state.scripted_failures.push_back(reason.to_string());
        }
    }

    /// Marks an intent as paid, as the processor's webhook would.
    pub async fn confirm_intent(&self, intent_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| SettlementError::GatewayError(format!("No such intent: {intent_id}")))?;
        intent.status = ConfirmationStatus::Succeeded;
        Ok(())
    }

    pub async fn transfer_calls(&self) -> usize {
        self.state.lock().await.transfer_calls
    }

    pub async fn transfers(&self) -> Vec<TransferRequest> {
        let state = self.state.lock().await;
        state.transfers.values().map(|(_, req)| req.clone()).collect()
    }
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new(SandboxGatewayConfig::default())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_transfer(&self, request: TransferRequest) -> Result<Transfer> {
        let mut state = self.state.lock().await;
        state.transfer_calls += 1;

        if let Some((transfer, _)) = state.transfers.get(&request.idempotency_key) {
            debug!(key = %request.idempotency_key, "replayed transfer key");
            return Ok(transfer.clone());
        }
        if let Some(reason) = state.scripted_failures.pop_front() {
            return Err(SettlementError::GatewayError(reason));
        }
        if self.config.declined_destinations.contains(&request.destination) {
            return Err(SettlementError::GatewayError(format!(
                "Destination {} declined the transfer",
                request.destination
            )));
        }
        if request.amount <= 0 {
            return Err(SettlementError::GatewayError(
                "Transfer amount must be positive".to_string(),
            ));
        }

        let transfer = Transfer {
            transfer_id: format!("tr_{}", Uuid::new_v4().simple()),
        };
        state.transfers.insert(
            request.idempotency_key.clone(),
            (transfer.clone(), request),
        );
        Ok(transfer)
    }

    async fn refund(
        &self,
        payment_reference: &str,
        amount: Option<i64>,
        reason: &str,
    ) -> Result<RefundReceipt> {
        let mut state = self.state.lock().await;
        let payment = state.payments.get_mut(payment_reference).ok_or_else(|| {
            SettlementError::GatewayError(format!("No such payment: {payment_reference}"))
        })?;
        let remaining = payment.amount - payment.refunded;
        let amount = amount.unwrap_or(remaining);
        if amount <= 0 || amount > remaining {
            return Err(SettlementError::GatewayError(format!(
                "Refund of {amount} exceeds refundable {remaining}"
            )));
        }
        payment.refunded += amount;
        debug!(reference = payment_reference, amount, reason, "sandbox refund");
        Ok(RefundReceipt {
            refund_id: format!("re_{}", Uuid::new_v4().simple()),
            amount,
            currency: payment.currency,
        })
    }

    async fn create_payment_intent(
        &self,
        amount: MinorUnits,
        currency: Currency,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent> {
        let intent_id = format!("pi_{}", Uuid::new_v4().simple());
        let status = if self.config.auto_confirm_intents {
            ConfirmationStatus::Succeeded
        } else {
            ConfirmationStatus::RequiresPayment
        };
        let mut state = self.state.lock().await;
        state.intents.insert(
            intent_id.clone(),
            PaymentConfirmation {
                intent_id: intent_id.clone(),
                status,
                amount: amount.value(),
                currency,
                metadata,
            },
        );
        Ok(PaymentIntent {
            client_secret: format!("{intent_id}_secret_{}", Uuid::new_v4().simple()),
            intent_id,
        })
    }

    async fn retrieve_payment_confirmation(&self, intent_id: &str) -> Result<PaymentConfirmation> {
        let state = self.state.lock().await;
        state
            .intents
            .get(intent_id)
            .cloned()
            .ok_or_else(|| SettlementError::GatewayError(format!("No such intent: {intent_id}")))
    }
}
