//! Single command-line validation.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{Rule, ValidationOutcome};
use crate::policy::{RuleScope, SecurityPolicy};
use crate::sanitize;

/// Shell composition syntax: pipelines, redirection, separators,
/// subexpressions and script blocks.
static SHELL_SYNTAX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\(|@\(|[|;&<>{}]").expect("shell syntax regex should compile"));

/// A leading token followed by an assignment operator.
static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s=]+\s*([+\-*/%]|\?\?)?=([^=]|$)").expect("assignment regex should compile")
});

/// Characters that end a base command token.
const TOKEN_TERMINATORS: &[char] = &['|', ';', '&', '(', ')', '{', '}', '<', '>'];

/// Why no base command could be extracted from a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseCommandError {
    /// The line is empty after trimming.
    Empty,
    /// The line continues a pipeline from a previous line.
    PipelineContinuation,
    /// The line starts with a variable reference.
    VariableReference,
    /// The line starts with a parameter.
    BareParameter,
    /// The line assigns to its first token.
    Assignment,
}

impl fmt::Display for BaseCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "no command found",
            Self::PipelineContinuation => "line is a pipeline continuation",
            Self::VariableReference => "line starts with a variable reference",
            Self::BareParameter => "line starts with a bare parameter",
            Self::Assignment => "line contains an assignment",
        })
    }
}

/// Extracts the base command of a line.
///
/// Leading separators and the call operator are discarded. Pipeline
/// continuations, variable references, bare parameters and assignments are
/// not base commands and are reported as errors.
///
/// ```
/// use psguard::validator::{extract_base_command, BaseCommandError};
///
/// assert_eq!(extract_base_command("Get-ChildItem -Path ."), Ok("Get-ChildItem"));
/// assert_eq!(extract_base_command("& git status"), Ok("git"));
/// assert_eq!(extract_base_command("$x = 1"), Err(BaseCommandError::VariableReference));
/// ```
pub fn extract_base_command(line: &str) -> Result<&str, BaseCommandError> {
    let trimmed = line.trim();
    if trimmed.starts_with('|') {
        return Err(BaseCommandError::PipelineContinuation);
    }
    let rest = trimmed.trim_start_matches(|c: char| c == ';' || c == '&' || c.is_whitespace());
    if rest.is_empty() {
        return Err(BaseCommandError::Empty);
    }
    if rest.starts_with('$') {
        return Err(BaseCommandError::VariableReference);
    }
    if rest.starts_with('-') {
        return Err(BaseCommandError::BareParameter);
    }
    if ASSIGNMENT.is_match(rest) {
        return Err(BaseCommandError::Assignment);
    }
    let end = rest
        .find(|c: char| c.is_whitespace() || TOKEN_TERMINATORS.contains(&c))
        .unwrap_or(rest.len());
    match &rest[..end] {
        "" => Err(BaseCommandError::Empty),
        token => Ok(token),
    }
}

/// Names the kind of shell composition in a matched fragment.
fn describe_shell_syntax(fragment: &str) -> &'static str {
    match fragment {
        "|" => "pipeline",
        "<" | ">" => "redirection",
        ";" | "&" => "command separator",
        "$(" | "@(" => "subexpression",
        _ => "script block",
    }
}

/// Validates single command lines against a policy.
#[derive(Debug, Clone, Copy)]
pub struct CommandValidator<'a> {
    policy: &'a SecurityPolicy,
}

impl<'a> CommandValidator<'a> {
    #[must_use]
    pub fn new(policy: &'a SecurityPolicy) -> Self {
        Self { policy }
    }

    /// Validates one command line.
    ///
    /// `allow_shell_access` is the per-call flag; the policy default is
    /// consulted as well.
    #[must_use]
    pub fn validate(&self, command: &str, allow_shell_access: bool) -> ValidationOutcome {
        if command.len() > self.policy.max_command_length() {
            return self.too_long(command.len());
        }
        if !sanitize::is_clean(command) {
            return ValidationOutcome::reject(
                Rule::CharacterValidation,
                "command contains control or non-ASCII characters",
            );
        }
        if command.trim().is_empty() {
            return ValidationOutcome::reject(Rule::EmptyInput, "command is empty");
        }
        // The interpreter runs every line of a command argument.
        if command.trim().contains(|c| c == '\n' || c == '\r') {
            return ValidationOutcome::reject(
                Rule::CharacterValidation,
                "command spans multiple lines; submit multi-line input as a script",
            );
        }

        let outcome = self.check_statement(
            command,
            &[RuleScope::Statement, RuleScope::Composite],
        );
        if !outcome.is_valid() {
            return outcome;
        }

        if !self.policy.shell_access_permitted(allow_shell_access) {
            if let Some(found) = SHELL_SYNTAX.find(command) {
                return ValidationOutcome::reject(
                    Rule::ShellAccess,
                    format!(
                        "{} syntax '{}' requires shell access",
                        describe_shell_syntax(found.as_str()),
                        found.as_str()
                    ),
                );
            }
        }

        ValidationOutcome::pass()
    }

    /// Runs the blocked-pattern and allow-list checks on one statement.
    ///
    /// Only rules within `scopes` are consulted.
    #[must_use]
    pub(crate) fn check_statement(&self, statement: &str, scopes: &[RuleScope]) -> ValidationOutcome {
        let outcome = self.check_patterns(statement, scopes);
        if !outcome.is_valid() {
            return outcome;
        }

        let base = match extract_base_command(statement) {
            Ok(base) => base,
            Err(e) => {
                return ValidationOutcome::reject(
                    Rule::BaseCommand,
                    format!("cannot determine base command: {e}"),
                )
            }
        };
        if !self.policy.permits_base_command(base) {
            debug!(base_command = %base, "base command not in allow-list");
            return ValidationOutcome::reject(
                Rule::AllowedCommands,
                format!("base command '{base}' is not allowed"),
            );
        }
        ValidationOutcome::pass()
    }

    /// Runs only the blocked-pattern check.
    #[must_use]
    pub(crate) fn check_patterns(&self, text: &str, scopes: &[RuleScope]) -> ValidationOutcome {
        match self.policy.rules().first_match(text, scopes) {
            Some(rule) => ValidationOutcome::reject(
                Rule::BlockedPattern,
                format!("matches blocked rule '{}': {}", rule.name(), rule.rationale()),
            )
            .with_pattern(rule.pattern()),
            None => ValidationOutcome::pass(),
        }
    }

    fn too_long(&self, len: usize) -> ValidationOutcome {
        ValidationOutcome::reject(
            Rule::MaxLength,
            format!(
                "command length {} exceeds maximum {}",
                len,
                self.policy.max_command_length()
            ),
        )
    }
}
