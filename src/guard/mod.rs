//! Working-directory jail and environment override screening.
//!
//! Both checks run before any process is spawned and report rejections as
//! [`ValidationOutcome`]s, so a guard failure is handled exactly like a
//! validator failure.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::validator::{Rule, ValidationOutcome};

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env name regex should compile"));

/// Variables a caller may never override, compared case-insensitively.
///
/// Covers the search path, interpreter pointers, profile and system
/// locations, identity and domain variables, and loader injection.
const SENSITIVE_ENV_VARS: &[&str] = &[
    // Search path and interpreter pointers
    "PATH",
    "PATHEXT",
    "COMSPEC",
    "SHELL",
    "PSMODULEPATH",
    "PSEXECUTIONPOLICYPREFERENCE",
    "POWERSHELL_DISTRIBUTION_CHANNEL",
    // System locations
    "SYSTEMROOT",
    "SYSTEMDRIVE",
    "WINDIR",
    "PROGRAMFILES",
    "PROGRAMFILES(X86)",
    "PROGRAMDATA",
    "COMMONPROGRAMFILES",
    "TEMP",
    "TMP",
    // Profiles
    "ALLUSERSPROFILE",
    "APPDATA",
    "LOCALAPPDATA",
    "USERPROFILE",
    "HOME",
    "HOMEDRIVE",
    "HOMEPATH",
    // Identity and domain
    "USERNAME",
    "USER",
    "LOGNAME",
    "USERDOMAIN",
    "USERDNSDOMAIN",
    "LOGONSERVER",
    "COMPUTERNAME",
    // Loader injection
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
];

/// Returns `true` if `name` is a variable callers may not override.
#[must_use]
pub fn is_sensitive_env_var(name: &str) -> bool {
    SENSITIVE_ENV_VARS
        .iter()
        .any(|sensitive| sensitive.eq_ignore_ascii_case(name))
}

/// Screens environment override names. Values are never inspected.
#[must_use]
pub fn validate_environment(overrides: &BTreeMap<String, String>) -> ValidationOutcome {
    for name in overrides.keys() {
        if !ENV_NAME.is_match(name) {
            return ValidationOutcome::reject(
                Rule::InvalidEnvVarName,
                format!("environment variable name '{name}' is not a valid identifier"),
            );
        }
        if is_sensitive_env_var(name) {
            warn!(variable = %name, "Security: override of sensitive environment variable rejected");
            return ValidationOutcome::reject(
                Rule::DangerousEnvVar,
                format!("overriding environment variable '{name}' is not allowed"),
            );
        }
    }
    ValidationOutcome::pass()
}

/// Returns `true` if any `/`- or `\`-separated segment is `..`.
fn has_parent_segment(raw: &str) -> bool {
    raw.split(['/', '\\']).any(|segment| segment == "..")
}

/// Confines working directories to a root.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
    canonical_root: PathBuf,
}

impl PathGuard {
    /// Creates a guard rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be canonicalized.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let canonical_root = root.canonicalize()?;
        Ok(Self {
            root,
            canonical_root,
        })
    }

    /// The canonical root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.canonical_root
    }

    /// Resolves a requested working directory inside the root.
    ///
    /// `None` resolves to the root itself. Relative paths are joined onto
    /// the root. The result is canonical, exists and is a directory.
    ///
    /// # Errors
    ///
    /// Returns the rejecting outcome: `path_traversal` for parent segments,
    /// `path_restriction` for paths outside the root, `path_not_found` or
    /// `not_a_directory` otherwise.
    pub fn resolve(&self, requested: Option<&str>) -> Result<PathBuf, ValidationOutcome> {
        let Some(raw) = requested.filter(|r| !r.trim().is_empty()) else {
            return Ok(self.canonical_root.clone());
        };

        if has_parent_segment(raw) {
            warn!(path = %raw, "Security: path traversal attempt - parent segment rejected");
            return Err(ValidationOutcome::reject(
                Rule::PathTraversal,
                format!("working directory '{raw}' contains a parent-directory segment"),
            ));
        }

        let requested_path = Path::new(raw);
        let joined = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.canonical_root.join(requested_path)
        };

        if joined.components().any(|c| c == Component::ParentDir)
            || !(joined.starts_with(&self.canonical_root) || joined.starts_with(&self.root))
        {
            return Err(self.restriction(raw));
        }

        let canonical = joined.canonicalize().map_err(|e| {
            ValidationOutcome::reject(
                Rule::PathNotFound,
                format!("working directory '{raw}' cannot be resolved: {e}"),
            )
        })?;

        // Symlinks inside the root may still point elsewhere.
        if !canonical.starts_with(&self.canonical_root) {
            return Err(self.restriction(raw));
        }

        if !canonical.is_dir() {
            return Err(ValidationOutcome::reject(
                Rule::NotADirectory,
                format!("working directory '{raw}' is not a directory"),
            ));
        }

        Ok(canonical)
    }

    fn restriction(&self, raw: &str) -> ValidationOutcome {
        warn!(
            path = %raw,
            root = %self.canonical_root.display(),
            "Security: working directory escapes configured root"
        );
        ValidationOutcome::reject(
            Rule::PathRestriction,
            format!(
                "working directory '{}' is outside {}",
                raw,
                self.canonical_root.display()
            ),
        )
    }
}
