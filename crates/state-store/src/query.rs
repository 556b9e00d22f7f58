use chrono::{DateTime, Utc};

use crate::{SagaInstance, SagaStatus};

/// Builder for constructing saga instance queries.
///
/// Allows filtering instances by status, definition name and last update time.
/// Results are ordered by creation time (oldest first).
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    /// Filter by status (any of these statuses).
    pub statuses: Option<Vec<SagaStatus>>,

    /// Filter by definition name.
    pub definition_name: Option<String>,

    /// Filter by instances last updated strictly before this timestamp.
    pub updated_before: Option<DateTime<Utc>>,

    /// Filter by whether an operator alert is still owed.
    pub alert_pending: Option<bool>,

    /// Maximum number of instances to return.
    pub limit: Option<usize>,

    /// Number of instances to skip.
    pub offset: Option<usize>,
}

impl InstanceQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for instances that are not yet terminal.
    pub fn in_flight() -> Self {
        Self {
            statuses: Some(SagaStatus::IN_FLIGHT.to_vec()),
            ..Default::default()
        }
    }

    /// Filters by a single status.
    pub fn status(mut self, status: SagaStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Filters by any of the given statuses.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = SagaStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Filters by definition name.
    pub fn definition_name(mut self, name: impl Into<String>) -> Self {
        self.definition_name = Some(name.into());
        self
    }

    /// Filters by last update time.
    pub fn updated_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.updated_before = Some(timestamp);
        self
    }

    /// Selects `Failed` instances whose operator alert was never delivered.
    pub fn undelivered_alerts() -> Self {
        Self::new().status(SagaStatus::Failed).alert_pending(true)
    }

    /// Filters by the alert-pending flag.
    pub fn alert_pending(mut self, pending: bool) -> Self {
        self.alert_pending = Some(pending);
        self
    }

    /// Sets the maximum number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the number of results to skip.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the instance passes every filter (ignores limit/offset).
    pub fn matches(&self, instance: &SagaInstance) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&instance.status)
        {
            return false;
        }
        if let Some(ref name) = self.definition_name
            && &instance.definition_name != name
        {
            return false;
        }
        if let Some(before) = self.updated_before
            && instance.updated_at >= before
        {
            return false;
        }
        if let Some(pending) = self.alert_pending
            && instance.alert_pending != pending
        {
            return false;
        }
        true
    }
}
