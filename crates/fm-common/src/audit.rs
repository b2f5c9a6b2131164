//! Audit logging for fabric management actions.
//!
//! Actions that change what a client can observe (pinning or releasing an
//! image, clearing running counters, splicing a history composite into the
//! ring) or that reject operator configuration are recorded as structured
//! audit events. Records serialize to JSON for ingestion by log collectors.
//!
//! # Record content
//!
//! - Timestamp (UTC, microsecond precision)
//! - Source component (`"PaFreezeFrame"`, `"SmQos"`, ...)
//! - Action performed and its outcome
//! - Object identifier and type (image id, port, virtual fabric)
//! - Free-form JSON details and error text for failures
//!
//! # Severity mapping
//!
//! | Outcome | Level |
//! |---------|-------|
//! | Success | INFO |
//! | InProgress | DEBUG |
//! | Failure | WARN |
//!
//! All audit events use the `"audit"` tracing target so they can be routed
//! separately from operational logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Freeze-frame create, release, move
    FreezeFrame,
    /// Running counter clears
    CounterClear,
    /// Short-term history composites spliced into the image ring
    HistoryIntegration,
    /// QoS map computation and rejection
    QosConfiguration,
    /// Engine startup and shutdown
    SystemLifecycle,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::FreezeFrame => write!(f, "FREEZE_FRAME"),
            AuditCategory::CounterClear => write!(f, "COUNTER_CLEAR"),
            AuditCategory::HistoryIntegration => write!(f, "HISTORY_INTEGRATION"),
            AuditCategory::QosConfiguration => write!(f, "QOS_CONFIGURATION"),
            AuditCategory::SystemLifecycle => write!(f, "SYSTEM_LIFECYCLE"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Action completed successfully
    Success,
    /// Action failed
    Failure,
    /// Action is in progress
    InProgress,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
        }
    }
}

/// Structured audit record.
///
/// Built with [`AuditRecord::new`] and the `with_*` builders, then emitted
/// through [`audit_log!`](crate::audit_log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// UTC timestamp with microsecond precision
    pub timestamp: DateTime<Utc>,

    /// Event category for filtering and analysis
    pub category: AuditCategory,

    /// Component generating the event
    pub source: String,

    /// Action performed
    pub action: String,

    /// Outcome of the action
    pub outcome: AuditOutcome,

    /// Object identifier affected by the action.
    /// Examples: image id (0x0100000000000007), "lid 3 port 1", VF name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    /// Object type for classification.
    /// Examples: "freeze_frame", "composite", "port_counters", "sc2vl_map"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,

    /// Additional context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Error message if outcome is failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Create a new audit record with the current timestamp.
    ///
    /// The outcome defaults to InProgress until explicitly set.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Set the error message and mark outcome as Failure.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    /// Convert to a JSON string for logging.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] at a level chosen by its outcome.
///
/// # Usage
/// ```ignore
/// let record = AuditRecord::new(AuditCategory::FreezeFrame, "PaFreezeFrame", "create")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id(format!("{:#018x}", id))
///     .with_object_type("freeze_frame");
/// audit_log!(record);
/// ```
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress => {
                tracing::debug!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_record_creation() {
        let record = AuditRecord::new(AuditCategory::FreezeFrame, "PaFreezeFrame", "create")
            .with_outcome(AuditOutcome::Success)
            .with_object_id("0x0100000000000007")
            .with_object_type("freeze_frame");

        assert_eq!(record.category, AuditCategory::FreezeFrame);
        assert_eq!(record.source, "PaFreezeFrame");
        assert_eq!(record.action, "create");
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.object_id, Some("0x0100000000000007".to_string()));
        assert_eq!(record.object_type, Some("freeze_frame".to_string()));
    }

    #[test]
    fn test_audit_record_with_error() {
        let record = AuditRecord::new(AuditCategory::QosConfiguration, "SmQos", "fixed_map")
            .with_error("Oversubscribed VLs");

        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error, Some("Oversubscribed VLs".to_string()));
    }

    #[test]
    fn test_audit_record_json_serialization() {
        let record = AuditRecord::new(AuditCategory::CounterClear, "PaAccess", "clear_port_stats")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "lid": 3,
                "port": 255
            }));

        let json = record.to_json();
        assert!(json.contains("COUNTER_CLEAR"));
        assert!(json.contains("PaAccess"));
        assert!(json.contains("clear_port_stats"));
        assert!(json.contains("\"port\":255"));
        assert!(!json.contains("object_id"));
    }

    #[test]
    fn test_audit_category_display() {
        assert_eq!(AuditCategory::FreezeFrame.to_string(), "FREEZE_FRAME");
        assert_eq!(
            AuditCategory::HistoryIntegration.to_string(),
            "HISTORY_INTEGRATION"
        );
    }

    #[test]
    fn test_audit_outcome_display() {
        assert_eq!(AuditOutcome::Success.to_string(), "success");
        assert_eq!(AuditOutcome::InProgress.to_string(), "in_progress");
        assert_eq!(AuditOutcome::Failure.to_string(), "failure");
    }

    #[test]
    fn test_audit_log_macro_expands() {
        audit_log!(AuditRecord::new(
            AuditCategory::SystemLifecycle,
            "PaAccess",
            "start"
        )
        .with_outcome(AuditOutcome::Success));
    }
}
