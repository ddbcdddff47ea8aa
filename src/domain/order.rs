use crate::domain::ledger::SubjectId;
use crate::domain::money::Currency;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EligibilityStatus {
    Pending,
    OnHold,
    EligibleForPayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Paid,
    Refunded,
}

/// The slice of an order this crate reads and mutates. Everything else about
/// orders lives with the checkout system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub external_id: String,
    pub buyer_id: SubjectId,
    pub seller_id: SubjectId,
    pub total_amount: i64,
    pub currency: Currency,
    pub payment_intent_id: Option<String>,
    pub status: OrderStatus,
    pub escrow_status: EscrowStatus,
    pub eligibility_status: EligibilityStatus,
    pub released_at: Option<DateTime<Utc>>,
    pub released_by: Option<String>,
    pub eligibility_override: Option<EligibilityOverride>,
}

/// Audit trail of an administrative force release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityOverride {
    pub actor: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        external_id: impl Into<String>,
        buyer_id: SubjectId,
        seller_id: SubjectId,
        total_amount: i64,
        currency: Currency,
        payment_intent_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            buyer_id,
            seller_id,
            total_amount,
            currency,
            payment_intent_id,
            status: OrderStatus::Paid,
            escrow_status: EscrowStatus::Held,
            eligibility_status: EligibilityStatus::Pending,
            released_at: None,
            released_by: None,
            eligibility_override: None,
        }
    }

    /// Every escrow transition starts from `Held`.
    pub fn ensure_held(&self) -> Result<()> {
        if self.escrow_status == EscrowStatus::Held {
            Ok(())
        } else {
            Err(SettlementError::InvalidEscrowStatus {
                order_id: self.external_id.clone(),
                status: self.escrow_status,
            })
        }
    }

    pub fn mark_released(&mut self, actor: &str, at: DateTime<Utc>) -> Result<()> {
        self.ensure_held()?;
        self.escrow_status = EscrowStatus::Released;
        self.released_at = Some(at);
        self.released_by = Some(actor.to_string());
        Ok(())
    }

    pub fn mark_refunded(&mut self) -> Result<()> {
        self.ensure_held()?;
        self.escrow_status = EscrowStatus::Refunded;
        self.status = OrderStatus::Refunded;
        Ok(())
    }

    pub fn mark_eligible(&mut self, actor: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        if self.eligibility_status == EligibilityStatus::EligibleForPayout {
            return Err(SettlementError::AlreadyEligible {
                order_id: self.external_id.clone(),
                status: self.eligibility_status,
            });
        }
        self.eligibility_status = EligibilityStatus::EligibleForPayout;
        self.eligibility_override = Some(EligibilityOverride {
            actor: actor.to_string(),
            reason: reason.to_string(),
            at,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new(
            "ord_1",
            SubjectId::new("buyer_1").unwrap(),
            SubjectId::new("seller_1").unwrap(),
            2500,
            Currency::Usd,
            Some("pi_1".to_string()),
        )
    }

    #[test]
    fn test_release_only_from_held() {
        let mut order = order();
        order.mark_released("admin", Utc::now()).unwrap();
        assert_eq!(order.escrow_status, EscrowStatus::Released);
        assert_eq!(order.released_by.as_deref(), Some("admin"));

        assert!(matches!(
            order.mark_refunded(),
            Err(SettlementError::InvalidEscrowStatus {
                status: EscrowStatus::Released,
                ..
            })
        ));
    }

    #[test]
    fn test_refund_sets_both_statuses() {
        let mut order = order();
        order.mark_refunded().unwrap();
        assert_eq!(order.escrow_status, EscrowStatus::Refunded);
        assert_eq!(order.status, OrderStatus::Refunded);
    }

    #[test]
    fn test_mark_eligible_is_guarded() {
        let mut order = order();
        order.mark_eligible("admin", "manual", Utc::now()).unwrap();
        assert_eq!(order.eligibility_status, EligibilityStatus::EligibleForPayout);
        assert!(matches!(
            order.mark_eligible("admin", "again", Utc::now()),
            Err(SettlementError::AlreadyEligible { .. })
        ));
    }
}
