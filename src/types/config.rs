//! Configuration for psguard.
//!
//! Configuration is read once at startup from a TOML file. Every section and
//! every key is optional; a missing file yields the defaults.
//!
//! ```toml
//! [policy]
//! extra_allowed_commands = ["terraform"]
//! blocked_patterns = ['(?i)\bInvoke-WebRequest\b']
//! default_timeout_seconds = 20
//!
//! [execution]
//! root = "/srv/workspace"
//!
//! [audit]
//! path = "/var/log/psguard/audit.jsonl"
//! ```

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditConfig;
use crate::policy::{PolicyError, PolicySettings, SecurityPolicy};
use crate::shell::Interpreter;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "psguard", "psguard")
}

/// Returns the default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Returns the default audit log path.
#[must_use]
pub fn default_audit_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("audit.jsonl"))
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),
}

/// The `[execution]` section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Working-directory jail. Defaults to the current directory.
    pub root: Option<PathBuf>,
    pub interpreter: Interpreter,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub policy: PolicySettings,
    pub execution: ExecutionSettings,
    pub audit: AuditConfig,
}

impl GuardConfig {
    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Loads configuration from `path`.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads from `path`, or from [`default_config_path`] when `None`.
    ///
    /// # Errors
    ///
    /// See [`GuardConfig::load`].
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Compiles the security policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy settings are inconsistent or a
    /// pattern does not compile.
    pub fn build_policy(&self) -> Result<SecurityPolicy, ConfigError> {
        Ok(SecurityPolicy::from_settings(&self.policy)?)
    }

    /// The working-directory root, defaulting to the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no root is configured and the current directory
    /// cannot be determined.
    pub fn root(&self) -> std::io::Result<PathBuf> {
        match &self.execution.root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir(),
        }
    }

    /// The interpreter, with `-ExecutionPolicy Bypass` added when the policy
    /// allows execution-policy overrides.
    pub fn interpreter(&self) -> Interpreter {
        let interpreter = self.execution.interpreter.clone();
        if self.policy.allow_execution_policy_override {
            interpreter.with_execution_policy_bypass()
        } else {
            interpreter
        }
    }
}
