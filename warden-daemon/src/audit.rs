//! Audit trail for privileged actions.
//!
//! Every attempt at a privileged action (role changes, restarts) produces
//! exactly one [`AuditEntry`], emitted synchronously to every configured
//! sink before the action's result is returned. Sinks are append-only;
//! reading the trail back is left to whatever consumes the sink.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::AuditConfig;
use crate::errors::{DaemonError, Result};
use crate::users::UserId;

pub const ACTION_RESTART: &str = "restart";
pub const ACTION_ROLE_ASSIGN: &str = "role.assign";
pub const ACTION_ROLE_REMOVE: &str = "role.remove";
pub const ACTION_ROLE_SEED: &str = "role.seed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Authorized, but the action itself failed
    Failure { reason: String },
    /// Refused before anything was attempted
    Denied { reason: String },
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure { .. } => "failure",
            AuditOutcome::Denied { .. } => "denied",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            AuditOutcome::Success => None,
            AuditOutcome::Failure { reason } | AuditOutcome::Denied { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Absent when the credential did not identify a user
    pub actor: Option<UserId>,
    pub action: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
}

impl AuditEntry {
    pub fn new(
        actor: Option<UserId>,
        action: impl Into<String>,
        target: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            actor,
            action: action.into(),
            target: target.into(),
            timestamp: Utc::now(),
            outcome,
        }
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()>;
}

/// Emits entries as structured tracing events on the `warden::audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let actor = entry
            .actor
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &entry.outcome {
            AuditOutcome::Success => info!(
                target: "warden::audit",
                actor = %actor,
                action = %entry.action,
                target_name = %entry.target,
                outcome = "success",
                "audit"
            ),
            outcome => warn!(
                target: "warden::audit",
                actor = %actor,
                action = %entry.action,
                target_name = %entry.target,
                outcome = outcome.as_str(),
                reason = outcome.reason().unwrap_or_default(),
                "audit"
            ),
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file, flushing after each entry.
pub struct JsonlAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()
    }
}

/// Keeps entries in memory. Used by tests and embedders.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Fans each entry out to every sink.
///
/// A sink failure is logged and does not affect the audited action or the
/// other sinks.
#[derive(Default, Clone)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build the sinks named in the config.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        let mut log = Self::new();
        if config.tracing {
            log = log.with_sink(Arc::new(TracingAuditSink));
        }
        if let Some(path) = &config.path {
            let sink = JsonlAuditSink::open(path).map_err(|source| DaemonError::AuditLog {
                path: path.clone(),
                source,
            })?;
            log = log.with_sink(Arc::new(sink));
        }
        if log.sinks.is_empty() {
            warn!("No audit sinks configured; privileged actions will not be recorded");
        }
        Ok(log)
    }

    pub fn record(&self, entry: AuditEntry) {
        for sink in &self.sinks {
            if let Err(e) = sink.write(&entry) {
                error!(
                    "Failed to write audit entry ({} {}) to {} sink: {}",
                    entry.action,
                    entry.target,
                    sink.name(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests;
