//! Command and script validation.
//!
//! Validators are pure: they read the [`SecurityPolicy`](crate::policy::SecurityPolicy)
//! and the input text, and never touch the file system or spawn processes.
//! Every call produces a [`ValidationOutcome`] naming the policy clause that
//! fired, so rejections are deterministic to test and precise to audit.

pub mod command;
pub mod script;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use command::{extract_base_command, BaseCommandError, CommandValidator};
pub use script::{split_statements, ScriptValidator, Statement, StatementKind};

/// The policy clause responsible for a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Input exceeds the configured length ceiling.
    MaxLength,
    /// Input is not valid UTF-8.
    Encoding,
    /// Input contains characters the sanitizer would strip.
    CharacterValidation,
    /// Input is empty after trimming.
    EmptyInput,
    /// A statement-scope rule table entry matched.
    BlockedPattern,
    /// A composite rule matched the whole script.
    DangerousConstructs,
    /// No base command could be extracted.
    BaseCommand,
    /// The base command is neither allow-listed nor a safe intrinsic.
    AllowedCommands,
    /// Shell composition syntax was used without shell access.
    ShellAccess,
    /// The working directory contains a parent-directory segment.
    PathTraversal,
    /// The working directory resolves outside the configured root.
    PathRestriction,
    /// The working directory does not exist.
    PathNotFound,
    /// The working directory is not a directory.
    NotADirectory,
    /// An environment override name is malformed.
    InvalidEnvVarName,
    /// An environment override targets a security-sensitive variable.
    DangerousEnvVar,
}

impl Rule {
    /// Returns the stable snake_case name of the rule.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxLength => "max_length",
            Self::Encoding => "encoding",
            Self::CharacterValidation => "character_validation",
            Self::EmptyInput => "empty_input",
            Self::BlockedPattern => "blocked_pattern",
            Self::DangerousConstructs => "dangerous_constructs",
            Self::BaseCommand => "base_command",
            Self::AllowedCommands => "allowed_commands",
            Self::ShellAccess => "shell_access",
            Self::PathTraversal => "path_traversal",
            Self::PathRestriction => "path_restriction",
            Self::PathNotFound => "path_not_found",
            Self::NotADirectory => "not_a_directory",
            Self::InvalidEnvVarName => "invalid_env_var_name",
            Self::DangerousEnvVar => "dangerous_env_var",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a validator or guard call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    /// Whether the input passed every check.
    pub valid: bool,
    /// Human-readable reason for a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The rule that fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,
    /// The exact pattern that matched, for pattern rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// 1-based script line, for script rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl ValidationOutcome {
    /// An outcome that permits the input.
    #[must_use]
    pub fn pass() -> Self {
        Self {
            valid: true,
            reason: None,
            rule: None,
            pattern: None,
            line: None,
        }
    }

    /// An outcome that rejects the input under `rule`.
    #[must_use]
    pub fn reject(rule: Rule, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            rule: Some(rule),
            pattern: None,
            line: None,
        }
    }

    /// Attaches the matching pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Attaches a 1-based script line number.
    #[must_use]
    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    /// Returns `true` if the input passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
