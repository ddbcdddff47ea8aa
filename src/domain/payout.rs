use crate::domain::ledger::{EntryId, SubjectId};
use crate::domain::money::Currency;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PayoutStatus {
    /// A payout in one of these states blocks any new attempt for its order.
    pub fn blocks_new_attempt(&self) -> bool {
        !matches!(self, PayoutStatus::Failed)
    }
}

/// Persisted record of a payout attempt. It is the source of truth for the
/// saga, so a crash between phases can be picked up from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub payout_id: Uuid,
    pub order_id: Uuid,
    pub seller_id: SubjectId,
    pub amount: i64,
    pub currency: Currency,
    pub status: PayoutStatus,
    pub idempotency_key: String,
    pub attempt: u32,
    pub ledger_reservation_id: Option<EntryId>,
    pub gateway_transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn new_attempt_key(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

impl Payout {
    pub fn start(
        order_id: Uuid,
        seller_id: SubjectId,
        amount: i64,
        currency: Currency,
        key_prefix: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            payout_id: Uuid::new_v4(),
            order_id,
            seller_id,
            amount,
            currency,
            status: PayoutStatus::Processing,
            idempotency_key: new_attempt_key(key_prefix),
            attempt: 1,
            ledger_reservation_id: None,
            gateway_transfer_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reuses a failed record for a new attempt. Amount, currency and order
    /// linkage stay as they were; only the attempt key changes.
    pub fn retry(&mut self, key_prefix: &str) -> Result<()> {
        if self.status != PayoutStatus::Failed {
            return Err(SettlementError::PayoutAlreadyActiveOrDone {
                order_id: self.order_id.to_string(),
                status: self.status,
            });
        }
        self.status = PayoutStatus::Processing;
        self.idempotency_key = new_attempt_key(key_prefix);
        self.attempt += 1;
        self.failure_reason = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Key sent to the gateway for this attempt. Stable across replays of the
    /// same attempt, distinct across attempts.
    pub fn transfer_key(&self, transfer_prefix: &str) -> String {
        format!("{transfer_prefix}{}", self.idempotency_key)
    }

    pub fn complete(&mut self, transfer_id: &str) -> Result<()> {
        self.ensure_processing()?;
        self.status = PayoutStatus::Completed;
        self.gateway_transfer_id = Some(transfer_id.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<()> {
        self.ensure_processing()?;
        self.status = PayoutStatus::Failed;
        self.failure_reason = Some(reason.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_processing(&self) -> Result<()> {
        if self.status == PayoutStatus::Processing {
            Ok(())
        } else {
            Err(SettlementError::InvariantViolation(format!(
                "payout {} finalized from {:?}",
                self.payout_id, self.status
            )))
        }
    }
}
