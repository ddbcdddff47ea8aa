use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DisputeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: String,
    pub actor: String,
    pub justification: String,
    pub resolved_at: DateTime<Utc>,
}

/// Related to its order by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: DisputeStatus,
    pub amount: i64,
    pub reason: String,
    pub resolution: Option<Resolution>,
    pub opened_at: DateTime<Utc>,
}

impl Dispute {
    pub fn open(order_id: Uuid, amount: i64, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            status: DisputeStatus::Open,
            amount,
            reason: reason.into(),
            resolution: None,
            opened_at: Utc::now(),
        }
    }

    pub fn close(&mut self, outcome: &str, actor: &str, justification: &str) -> Result<()> {
        if self.status != DisputeStatus::Open {
            return Err(SettlementError::NoOpenDispute {
                order_id: self.order_id.to_string(),
                status: Some(self.status),
            });
        }
        self.status = DisputeStatus::Closed;
        self.resolution = Some(Resolution {
            outcome: outcome.to_string(),
            actor: actor.to_string(),
            justification: justification.to_string(),
            resolved_at: Utc::now(),
        });
        Ok(())
    }
}
