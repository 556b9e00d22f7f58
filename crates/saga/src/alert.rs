//! Operator alerts for sagas that need manual intervention.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

/// Raised whenever a saga settles into `FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub saga_id: SagaId,
    pub definition_name: String,
    pub step_name: String,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

impl OperatorAlert {
    pub fn new(
        saga_id: SagaId,
        definition_name: impl Into<String>,
        step_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            saga_id,
            definition_name: definition_name.into(),
            step_name: step_name.into(),
            reason: reason.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Destination for operator alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: OperatorAlert);
}

/// Logs alerts at error level and counts them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: OperatorAlert) {
        metrics::counter!("saga_operator_alerts_total").increment(1);
        tracing::error!(
            saga_id = %alert.saga_id,
            definition = %alert.definition_name,
            step = %alert.step_name,
            reason = %alert.reason,
            "saga needs operator intervention"
        );
    }
}

/// In-memory alert sink for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAlertSink {
    alerts: Arc<Mutex<Vec<OperatorAlert>>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every alert raised so far, oldest first.
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn raise(&self, alert: OperatorAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}
