//! Security policy for guarded execution.
//!
//! The policy is built once at startup from [`PolicySettings`] and is
//! read-only afterwards. Every validator, guard and the executor borrow it;
//! nothing mutates it, so concurrent readers need no locking.
//!
//! Building the policy is the only place patterns are compiled. A pattern
//! that fails to compile, or inconsistent timeout ceilings, abort startup
//! instead of leaving a partially loaded policy in place.

pub mod rules;

use std::borrow::Cow;
use std::collections::HashSet;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rules::{DEFAULT_ALLOWED_COMMANDS, DEFAULT_RULES, EXECUTION_POLICY_RULES, SAFE_INTRINSICS};

/// Errors raised while building a policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A rule pattern did not compile.
    #[error("invalid pattern for rule '{name}': {source}")]
    InvalidPattern {
        /// Rule name.
        name: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// A default timeout exceeds its ceiling.
    #[error("{mode} default timeout {default}s exceeds maximum {max}s")]
    TimeoutOrder {
        /// Which mode the ceilings belong to.
        mode: ExecutionMode,
        /// Configured default in seconds.
        default: u64,
        /// Configured maximum in seconds.
        max: u64,
    },

    /// A limit that must be positive is zero.
    #[error("policy limit '{0}' must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Whether a request carries a single command or a multi-line script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One command line.
    Command,
    /// A multi-line script.
    Script,
}

impl ExecutionMode {
    /// Returns the operation name used for this mode.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Command => "execute_command",
            Self::Script => "execute_script",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Command => "command",
            Self::Script => "script",
        })
    }
}

/// Where a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Single commands and each script statement.
    Statement,
    /// Whole scripts, with `.` matching newlines. Also single commands.
    Composite,
}

/// Uncompiled rule table entry.
#[derive(Debug, Clone)]
pub struct RuleDef {
    /// Stable rule name.
    pub name: Cow<'static, str>,
    /// Regular expression, matched case-insensitively.
    pub pattern: Cow<'static, str>,
    /// Why the construct is rejected.
    pub rationale: Cow<'static, str>,
    /// Where the rule applies.
    pub scope: RuleScope,
}

impl RuleDef {
    pub(crate) const fn builtin(
        name: &'static str,
        pattern: &'static str,
        rationale: &'static str,
        scope: RuleScope,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            pattern: Cow::Borrowed(pattern),
            rationale: Cow::Borrowed(rationale),
            scope,
        }
    }

    /// Creates a rule from configuration.
    #[must_use]
    pub fn custom(name: impl Into<String>, pattern: impl Into<String>, scope: RuleScope) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            pattern: Cow::Owned(pattern.into()),
            rationale: Cow::Borrowed("configured blocked pattern"),
            scope,
        }
    }
}

/// A compiled rule table entry.
#[derive(Debug, Clone)]
pub struct PatternRule {
    def: RuleDef,
    regex: Regex,
}

impl PatternRule {
    /// Rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Source pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.def.pattern
    }

    /// Rationale for the rule.
    #[must_use]
    pub fn rationale(&self) -> &str {
        &self.def.rationale
    }

    /// Where the rule applies.
    #[must_use]
    pub fn scope(&self) -> RuleScope {
        self.def.scope
    }

    /// Returns `true` if the rule matches `text`.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Ordered rule table. Evaluation stops at the first match.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<PatternRule>,
}

impl RuleTable {
    /// Compiles rule definitions in order.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] for the first pattern that
    /// does not compile.
    pub fn compile<I>(defs: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = RuleDef>,
    {
        let rules = defs
            .into_iter()
            .map(|def| {
                let regex = RegexBuilder::new(&def.pattern)
                    .case_insensitive(true)
                    .multi_line(true)
                    .dot_matches_new_line(def.scope == RuleScope::Composite)
                    .build()
                    .map_err(|source| PolicyError::InvalidPattern {
                        name: def.name.to_string(),
                        source,
                    })?;
                Ok(PatternRule { def, regex })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;
        Ok(Self { rules })
    }

    /// Returns the first rule within `scopes` that matches `text`.
    #[must_use]
    pub fn first_match(&self, text: &str, scopes: &[RuleScope]) -> Option<&PatternRule> {
        self.rules
            .iter()
            .filter(|rule| scopes.contains(&rule.scope()))
            .find(|rule| rule.is_match(text))
    }

    /// Iterates over the rules in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &PatternRule> {
        self.rules.iter()
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if the table has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Policy configuration as read from the `[policy]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Replaces the built-in allow-list when set.
    pub allowed_commands: Option<Vec<String>>,
    /// Appended to the allow-list.
    pub extra_allowed_commands: Vec<String>,
    /// Appended after the built-in rules, in order.
    pub blocked_patterns: Vec<String>,
    pub max_command_length: usize,
    pub max_script_length: usize,
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub script_default_timeout_seconds: u64,
    pub script_max_timeout_seconds: u64,
    pub allow_shell_access_by_default: bool,
    pub allow_execution_policy_override: bool,
    /// Cap on captured bytes per output stream.
    pub max_output_bytes: usize,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            allowed_commands: None,
            extra_allowed_commands: Vec::new(),
            blocked_patterns: Vec::new(),
            max_command_length: 8 * 1024,
            max_script_length: 1024 * 1024,
            default_timeout_seconds: 30,
            max_timeout_seconds: 300,
            script_default_timeout_seconds: 60,
            script_max_timeout_seconds: 600,
            allow_shell_access_by_default: false,
            allow_execution_policy_override: false,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// The compiled, immutable security policy.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    allowed_commands: HashSet<String>,
    rules: RuleTable,
    max_command_length: usize,
    max_script_length: usize,
    default_timeout: Duration,
    max_timeout: Duration,
    script_default_timeout: Duration,
    script_max_timeout: Duration,
    allow_shell_access_by_default: bool,
    allow_execution_policy_override: bool,
    max_output_bytes: usize,
}

impl SecurityPolicy {
    /// Builds a policy from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern does not compile, a default timeout
    /// exceeds its maximum, or a length limit is zero.
    pub fn from_settings(settings: &PolicySettings) -> Result<Self, PolicyError> {
        if settings.max_command_length == 0 {
            return Err(PolicyError::ZeroLimit("max_command_length"));
        }
        if settings.max_script_length == 0 {
            return Err(PolicyError::ZeroLimit("max_script_length"));
        }
        if settings.default_timeout_seconds == 0 || settings.script_default_timeout_seconds == 0 {
            return Err(PolicyError::ZeroLimit("default_timeout_seconds"));
        }
        if settings.default_timeout_seconds > settings.max_timeout_seconds {
            return Err(PolicyError::TimeoutOrder {
                mode: ExecutionMode::Command,
                default: settings.default_timeout_seconds,
                max: settings.max_timeout_seconds,
            });
        }
        if settings.script_default_timeout_seconds > settings.script_max_timeout_seconds {
            return Err(PolicyError::TimeoutOrder {
                mode: ExecutionMode::Script,
                default: settings.script_default_timeout_seconds,
                max: settings.script_max_timeout_seconds,
            });
        }

        let mut defs: Vec<RuleDef> = DEFAULT_RULES.to_vec();
        if !settings.allow_execution_policy_override {
            defs.extend_from_slice(EXECUTION_POLICY_RULES);
        }
        defs.extend(
            settings
                .blocked_patterns
                .iter()
                .enumerate()
                .map(|(idx, pattern)| {
                    RuleDef::custom(format!("custom-{}", idx + 1), pattern, RuleScope::Statement)
                }),
        );
        let rules = RuleTable::compile(defs)?;

        let mut allowed_commands: HashSet<String> = match &settings.allowed_commands {
            Some(list) => list.iter().cloned().collect(),
            None => DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        };
        allowed_commands.extend(settings.extra_allowed_commands.iter().cloned());

        Ok(Self {
            allowed_commands,
            rules,
            max_command_length: settings.max_command_length,
            max_script_length: settings.max_script_length,
            default_timeout: Duration::from_secs(settings.default_timeout_seconds),
            max_timeout: Duration::from_secs(settings.max_timeout_seconds),
            script_default_timeout: Duration::from_secs(settings.script_default_timeout_seconds),
            script_max_timeout: Duration::from_secs(settings.script_max_timeout_seconds),
            allow_shell_access_by_default: settings.allow_shell_access_by_default,
            allow_execution_policy_override: settings.allow_execution_policy_override,
            max_output_bytes: settings.max_output_bytes,
        })
    }

    /// Returns the ordered rule table.
    #[must_use]
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Returns the configured allow-list, excluding intrinsics.
    #[must_use]
    pub fn allowed_commands(&self) -> &HashSet<String> {
        &self.allowed_commands
    }

    /// Returns `true` if `base` is allow-listed or a safe intrinsic.
    ///
    /// Matching is case-sensitive.
    #[must_use]
    pub fn permits_base_command(&self, base: &str) -> bool {
        self.allowed_commands.contains(base) || SAFE_INTRINSICS.contains(&base)
    }

    #[must_use]
    pub fn max_command_length(&self) -> usize {
        self.max_command_length
    }

    #[must_use]
    pub fn max_script_length(&self) -> usize {
        self.max_script_length
    }

    #[must_use]
    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    #[must_use]
    pub fn allow_shell_access_by_default(&self) -> bool {
        self.allow_shell_access_by_default
    }

    #[must_use]
    pub fn allow_execution_policy_override(&self) -> bool {
        self.allow_execution_policy_override
    }

    /// Returns `true` if shell composition is permitted for a call.
    #[must_use]
    pub fn shell_access_permitted(&self, per_call: bool) -> bool {
        per_call || self.allow_shell_access_by_default
    }

    /// Returns the `(default, max)` timeouts for `mode`.
    #[must_use]
    pub fn timeouts(&self, mode: ExecutionMode) -> (Duration, Duration) {
        match mode {
            ExecutionMode::Command => (self.default_timeout, self.max_timeout),
            ExecutionMode::Script => (self.script_default_timeout, self.script_max_timeout),
        }
    }

    /// Resolves a requested timeout in seconds to the effective deadline.
    ///
    /// Missing, non-finite or non-positive requests use the mode default;
    /// everything else is clamped to the mode maximum.
    #[must_use]
    pub fn effective_timeout(&self, mode: ExecutionMode, requested_secs: Option<f64>) -> Duration {
        let (default, max) = self.timeouts(mode);
        match requested_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                if secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
            _ => default,
        }
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        // Built-in rules are covered by `test_default_policy_compiles`.
        Self::from_settings(&PolicySettings::default()).expect("built-in policy must compile")
    }
}
