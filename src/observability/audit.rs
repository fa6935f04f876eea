use std::time::Duration;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::protocol::{Dialect, Usage};

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Completed => "completed",
            AuditOutcome::Cancelled => "cancelled",
            AuditOutcome::Failed => "failed",
        }
    }
}

/// One generation's usage, handed to the [`AuditSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub request_id: Uuid,
    pub feature_name: Option<String>,
    pub model: String,
    pub dialect: Dialect,
    pub usage: Usage,
    pub outcome: AuditOutcome,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl AuditRecord {
    #[must_use]
    pub fn new(model: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            feature_name: None,
            model: model.into(),
            dialect,
            usage: Usage::default(),
            outcome: AuditOutcome::Completed,
            duration: Duration::ZERO,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn serialize_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Receiver of finished-generation records. Persistence is the host's job.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Default sink: one `info!` line per generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            request_id = %record.request_id,
            feature = record.feature_name.as_deref().unwrap_or("-"),
            model = %record.model,
            dialect = %record.dialect,
            input_tokens = record.usage.input_tokens.unwrap_or(0),
            output_tokens = record.usage.output_tokens.unwrap_or(0),
            cached_tokens = record.usage.cached_tokens.unwrap_or(0),
            outcome = record.outcome.as_str(),
            duration_ms = record.duration.as_millis(),
            "generation finished"
        );
    }
}
