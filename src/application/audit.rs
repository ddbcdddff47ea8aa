use crate::domain::ports::{AuditEvent, AuditOutcome, AuditSinkRef};
use chrono::Utc;
use std::time::Duration;
use tracing::warn;

const AUDIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Best-effort audit trail. Recording never fails the caller: sink errors and
/// slow sinks are logged and dropped.
#[derive(Clone, Default)]
pub struct AuditTrail {
    sink: Option<AuditSinkRef>,
}

impl AuditTrail {
    pub fn new(sink: Option<AuditSinkRef>) -> Self {
        Self { sink }
    }

    pub async fn record(
        &self,
        action: &str,
        order_id: &str,
        actor: &str,
        outcome: AuditOutcome,
        detail: impl Into<String>,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };
        let event = AuditEvent {
            action: action.to_string(),
            order_id: order_id.to_string(),
            actor: actor.to_string(),
            outcome,
            detail: detail.into(),
            at: Utc::now(),
        };
        match tokio::time::timeout(AUDIT_TIMEOUT, sink.record(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(action, order_id, error = %e, "audit sink rejected event"),
            Err(_) => warn!(action, order_id, "audit sink timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::AuditSink;
    use crate::error::{Result, SettlementError};
    use crate::infrastructure::in_memory::InMemoryAuditSink;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _event: AuditEvent) -> Result<()> {
            Err(SettlementError::internal("audit table unavailable"))
        }
    }

    #[tokio::test]
    async fn test_broken_sink_is_swallowed() {
        let trail = AuditTrail::new(Some(Arc::new(BrokenSink)));
        trail
            .record("refund", "ord_1", "admin", AuditOutcome::Failed, "boom")
            .await;
    }

    #[tokio::test]
    async fn test_events_reach_sink() {
        let sink = InMemoryAuditSink::new();
        let trail = AuditTrail::new(Some(Arc::new(sink.clone())));
        trail
            .record("refund", "ord_1", "admin", AuditOutcome::Succeeded, "re_1")
            .await;
        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Succeeded);
    }
}
