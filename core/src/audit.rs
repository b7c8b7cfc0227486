//! Audit trail
//!
//! One record per terminal brokering outcome that can be attributed to a
//! verified caller. Records never carry the credential secret; there is no
//! field for it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use crate::policy::{DenyReason, Permission};

/// Default capacity of [`MemoryAuditSink`]
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Issued {
        scope: String,
        permission: Permission,
        account_id: u64,
        account_name: String,
        expiry: DateTime<Utc>,
        pipeline_id: String,
        job_id: String,
    },
    Denied {
        scope: String,
        permission: Permission,
        reason: DenyReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub caller_project: String,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit records
///
/// Writes are best-effort from the broker's point of view: a failing sink is
/// logged and the request still completes.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Emits each record as a structured event on the `audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        match &record.outcome {
            AuditOutcome::Issued {
                scope,
                permission,
                account_id,
                account_name,
                expiry,
                pipeline_id,
                job_id,
            } => tracing::info!(
                target: "audit",
                status = "issued",
                caller_project = %record.caller_project,
                scope = %scope,
                permission = %permission,
                account_id,
                account_name = %account_name,
                expiry = %expiry.to_rfc3339(),
                pipeline_id = %pipeline_id,
                job_id = %job_id,
                "credential issued"
            ),
            AuditOutcome::Denied {
                scope,
                permission,
                reason,
            } => tracing::info!(
                target: "audit",
                status = "denied",
                caller_project = %record.caller_project,
                scope = %scope,
                permission = %permission,
                reason = %reason,
                "credential denied"
            ),
        }
        Ok(())
    }
}

/// Bounded in-memory ring of the most recent records
pub struct MemoryAuditSink {
    records: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    /// Up to `n` most recent records, newest first
    pub fn recent(&self, n: usize) -> Vec<AuditRecord> {
        self.records.lock().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }
}

/// Forwards every record to each inner sink
///
/// Succeeds if at least one sink accepted the record.
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut last_error = None;
        let mut delivered = 0usize;
        for sink in &self.sinks {
            match sink.record(record).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "audit sink rejected record");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }
}
