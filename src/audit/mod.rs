//! Append-only audit trail.
//!
//! Every attempted operation produces one JSON line, including rejected
//! ones. Entries are hash-chained: each line records the SHA-256 of its
//! predecessor in `prevHash` and its own in `hash`, so any edit, deletion or
//! reordering of earlier lines is detectable with [`verify_chain`].
//!
//! # Example
//!
//! ```
//! use psguard::audit::{AuditConfig, AuditEntry, AuditLogger};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = AuditConfig {
//!     enabled: true,
//!     path: Some(dir.path().join("audit.jsonl")),
//!     actor: Some("ci".to_string()),
//! };
//!
//! let logger = AuditLogger::open(&config).unwrap();
//! logger.log(AuditEntry::new("validate_command").with_command("Get-Date"));
//! drop(logger);
//!
//! let summary = psguard::audit::verify_chain(&dir.path().join("audit.jsonl")).unwrap();
//! // startup, the logged entry, shutdown
//! assert_eq!(summary.entries, 3);
//! ```

mod chain;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::GuardError;
use crate::executor::ExecutionResult;
use crate::validator::ValidationOutcome;

pub use chain::{verify_chain, ChainError, ChainSummary, GENESIS_HASH};

/// Operation kind recorded when a log file is opened.
pub const STARTUP: &str = "startup";
/// Operation kind recorded when a logger is dropped.
pub const SHUTDOWN: &str = "shutdown";

/// Configuration for audit logging, read from the `[audit]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// When false, every logger call is a no-op.
    pub enabled: bool,
    /// Log file. Defaults to `audit.jsonl` in the platform data directory.
    pub path: Option<PathBuf>,
    /// Actor recorded in every entry. Defaults to the current user.
    pub actor: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            actor: None,
        }
    }
}

impl AuditConfig {
    /// A configuration that never touches the filesystem.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// The configured log path, or the platform default.
    #[must_use]
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(crate::types::config::default_audit_path)
    }

    /// The configured actor, or the current user name.
    #[must_use]
    pub fn resolved_actor(&self) -> String {
        self.actor
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Errors raised while opening an audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("no audit log path configured and no platform data directory available")]
    NoPath,

    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Position in the chain, assigned when written.
    pub sequence: u64,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
    pub operation_kind: String,
    pub command_or_script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_overrides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_outcome: Option<ValidationOutcome>,
    pub duration_millis: u64,
    pub success: bool,
    /// 0 on success.
    pub error_code: i32,
    /// `"None"` on success.
    pub error_type: String,
    pub actor: String,
    pub prev_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl AuditEntry {
    /// Creates a successful entry for `operation_kind`, timestamped now.
    #[must_use]
    pub fn new(operation_kind: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            operation_kind: operation_kind.into(),
            command_or_script: String::new(),
            working_directory: None,
            environment_overrides: BTreeMap::new(),
            execution_result: None,
            validation_outcome: None,
            duration_millis: 0,
            success: true,
            error_code: 0,
            error_type: "None".to_string(),
            actor: String::new(),
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    #[must_use]
    pub fn with_command(mut self, command_or_script: impl Into<String>) -> Self {
        self.command_or_script = command_or_script.into();
        self
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_environment(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.environment_overrides = overrides;
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: ValidationOutcome) -> Self {
        self.validation_outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: ExecutionResult) -> Self {
        self.execution_result = Some(result);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_millis = duration.as_millis() as u64;
        self
    }

    /// Marks the entry failed with the error's code and kind.
    ///
    /// A rejecting outcome or partial result carried by the error is copied
    /// into the entry unless one was already recorded.
    #[must_use]
    pub fn with_error(mut self, err: &GuardError) -> Self {
        self.success = false;
        self.error_code = err.code();
        self.error_type = err.kind().to_string();
        if self.validation_outcome.is_none() {
            self.validation_outcome = err.outcome().cloned();
        }
        if self.execution_result.is_none() {
            self.execution_result = err.result().cloned();
        }
        self
    }

    /// Computes the SHA-256 of this entry with `hash` left out.
    pub(crate) fn compute_hash(&self) -> Result<String, serde_json::Error> {
        use sha2::{Digest, Sha256};

        let mut unsealed = self.clone();
        unsealed.hash.clear();
        let bytes = serde_json::to_vec(&unsealed)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// The open log file and chain position.
#[derive(Debug)]
struct AuditSink {
    path: PathBuf,
    file: File,
    next_sequence: u64,
    last_hash: String,
}

impl AuditSink {
    /// Seals `entry` into the chain and appends it with a synchronous flush.
    fn append(&mut self, mut entry: AuditEntry) -> io::Result<()> {
        entry.sequence = self.next_sequence;
        entry.prev_hash.clone_from(&self.last_hash);
        entry.hash = entry.compute_hash().map_err(io::Error::other)?;

        let mut line = serde_json::to_vec(&entry).map_err(io::Error::other)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.file.sync_data()?;

        self.next_sequence += 1;
        self.last_hash = entry.hash;
        Ok(())
    }
}

/// Reads the chain position from the last line of an existing log.
fn resume_point(path: &Path) -> io::Result<(u64, String)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok((0, GENESIS_HASH.to_string()))
        }
        Err(e) => return Err(e),
    };

    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }

    let Some(last) = last else {
        return Ok((0, GENESIS_HASH.to_string()));
    };
    match serde_json::from_str::<AuditEntry>(&last) {
        Ok(entry) => Ok((entry.sequence + 1, entry.hash)),
        Err(e) => {
            // The new segment will not verify against the damaged tail.
            warn!(
                path = %path.display(),
                error = %e,
                "last audit entry is unreadable; starting a new chain segment"
            );
            Ok((0, GENESIS_HASH.to_string()))
        }
    }
}

/// Process-wide audit logger.
///
/// All writes go through one mutex around one file handle. The lock is held
/// only while a single entry is written and flushed.
#[derive(Debug)]
pub struct AuditLogger {
    actor: String,
    sink: Option<Mutex<AuditSink>>,
}

impl AuditLogger {
    /// A logger that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            actor: String::new(),
            sink: None,
        }
    }

    /// Opens the configured log for appending and writes a startup entry.
    ///
    /// Returns a disabled logger when logging is turned off.
    ///
    /// # Errors
    ///
    /// Returns an error if no path can be determined or the file cannot be
    /// opened.
    pub fn open(config: &AuditConfig) -> Result<Self, AuditError> {
        if !config.enabled {
            debug!("audit logging disabled");
            return Ok(Self::disabled());
        }
        let path = config.resolved_path().ok_or(AuditError::NoPath)?;
        let open_err = |source| AuditError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let (next_sequence, last_hash) = resume_point(&path).map_err(open_err)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        let logger = Self {
            actor: config.resolved_actor(),
            sink: Some(Mutex::new(AuditSink {
                path: path.clone(),
                file,
                next_sequence,
                last_hash,
            })),
        };
        info!(path = %path.display(), sequence = next_sequence, "audit log opened");
        logger.log(AuditEntry::new(STARTUP));
        Ok(logger)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// The actor stamped on every entry.
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// The log file path, when enabled.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.sink.as_ref().map(|sink| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .path
                .clone()
        })
    }

    /// Appends an entry.
    ///
    /// Write failures are reported through `tracing` and otherwise ignored;
    /// they never reach the caller.
    pub fn log(&self, mut entry: AuditEntry) {
        let Some(sink) = &self.sink else {
            return;
        };
        entry.actor.clone_from(&self.actor);
        let kind = entry.operation_kind.clone();

        let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = sink.append(entry) {
            error!(
                path = %sink.path.display(),
                operation = %kind,
                error = %e,
                "failed to write audit entry"
            );
        }
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if self.sink.is_some() {
            self.log(AuditEntry::new(SHUTDOWN));
        }
    }
}
