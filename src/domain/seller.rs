use crate::domain::ledger::SubjectId;
use crate::error::{Result, SettlementError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Active,
    UnderReview,
    Suspended,
}

impl FromStr for RiskStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(RiskStatus::Active),
            "UNDER_REVIEW" => Ok(RiskStatus::UnderReview),
            "SUSPENDED" => Ok(RiskStatus::Suspended),
            other => Err(SettlementError::ValidationError(format!(
                "Unknown risk status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerAccount {
    pub seller_id: SubjectId,
    pub risk_status: RiskStatus,
    /// Connected account at the payment gateway that receives transfers.
    pub payout_destination: String,
}

impl SellerAccount {
    pub fn new(seller_id: SubjectId, payout_destination: impl Into<String>) -> Self {
        Self {
            seller_id,
            risk_status: RiskStatus::Active,
            payout_destination: payout_destination.into(),
        }
    }

    pub fn with_risk_status(mut self, status: RiskStatus) -> Self {
        self.risk_status = status;
        self
    }

    /// Force release bypasses time holds, so only fully active sellers qualify.
    pub fn ensure_force_releasable(&self) -> Result<()> {
        if self.risk_status == RiskStatus::Active {
            Ok(())
        } else {
            Err(SettlementError::SellerStatusBlocked {
                seller_id: self.seller_id.to_string(),
                status: self.risk_status,
            })
        }
    }
}
