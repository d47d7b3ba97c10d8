//! Multi-line script validation.
//!
//! A script is checked in three passes: length and character set, a
//! whole-script scan against composite rules, then each logical statement
//! in order. Control-flow and assignment statements skip the allow-list but
//! are still matched against statement rules, and the commands inside the
//! inline blocks of a control-flow statement (`try { ... } catch { ... }`)
//! are checked like any other statement. Anything that is neither
//! recognized control flow nor a permitted base command is rejected.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};

use super::command::CommandValidator;
use super::{Rule, ValidationOutcome};
use crate::policy::{RuleScope, SecurityPolicy};
use crate::sanitize;

/// Statement forms that do not name an externally executed command.
static CONTROL_FLOW: Lazy<RegexSet> = Lazy::new(|| {
    RegexSetBuilder::new([
        // Conditionals, loops, exception handling.
        r"^(if|elseif|else|switch|foreach|for|while|do|until|try|catch|finally|trap)(\s|\(|\{|$)",
        r"^\}\s*(elseif|else|catch|finally|while|until)(\s|\(|\{|$)",
        // Declarations.
        r"^(function|filter|workflow|class|enum)\s+[\w-]+",
        r"^param\s*\(",
        r"^(begin|process|end|dynamicparam)\s*(\{|$)",
        r"^\[(CmdletBinding|Parameter|Validate\w*|Alias|OutputType|AllowNull\w*)\b",
        // Switch clauses.
        r#"^('[^']*'|"[^"]*"|-?\d+|default)\s*\{"#,
        r"^\[[\w.\[\]]+\]\s*\$[\w:]+\s*(=.*)?,?\s*\)?\s*$",
        // Variable assignment and increments.
        r"^(\[[\w.\[\]]+\]\s*)?\$[\w:]+(\.\w+|\[[^\]]*\])*\s*([+\-*/%]|\?\?)?=([^=]|$)",
        r"^\$[\w:]+(\+\+|--)\s*$",
        // Punctuation-only lines closing blocks or parameter lists.
        r"^[\s{}()\[\],;]+$",
    ])
    .case_insensitive(true)
    .build()
    .expect("control flow regexes should compile")
});

/// Control-flow statements whose `{ ... }` blocks hold commands.
static BLOCK_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"^(\}\s*)?(if|elseif|else|switch|foreach|for|while|do|until|try|catch|finally|trap|function|filter|workflow|class|enum|begin|process|end|dynamicparam)(\s|\(|\{|$)|^('[^']*'|"[^"]*"|-?\d+|default)\s*\{"#,
    )
    .case_insensitive(true)
    .build()
    .expect("block statement regex should compile")
});

/// Deepest nesting of inline blocks checked before a statement is rejected.
const MAX_BLOCK_DEPTH: usize = 32;

/// Scans one line for a trailing comment.
///
/// Returns the byte offset where the comment starts (the line length if
/// there is none) and the quote still open at that offset.
fn scan_line(line: &str) -> (usize, Option<char>) {
    let mut quote = None;
    let mut prev: Option<char> = None;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '#' if prev.map_or(true, |p| p.is_whitespace() || matches!(p, ';' | '|' | '(' | '{')) => {
                    return (i, None)
                }
                _ => {}
            },
        }
        prev = Some(c);
    }
    (line.len(), quote)
}

/// Returns the quote of a here-string opened at the end of `line`.
///
/// `@"` and `@'` open a here-string only as the last code on the line, in
/// operand position, and outside quoted strings and comments.
fn here_string_opener(line: &str) -> Option<char> {
    let (end, _) = scan_line(line);
    let code = line[..end].trim_end();
    let quote = code.chars().last().filter(|c| matches!(c, '"' | '\''))?;
    let before = code[..code.len() - 1].strip_suffix('@')?;
    if scan_line(before).1.is_some() {
        return None;
    }
    match before.chars().last() {
        None => Some(quote),
        Some(c) if c.is_whitespace() || matches!(c, '=' | '(' | ',') => Some(quote),
        Some(_) => None,
    }
}

/// Splits `text` at `;` outside quotes, parentheses and braces.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '{' | '(' => depth += 1,
                '}' | ')' => depth = depth.saturating_sub(1),
                ';' if depth == 0 => {
                    parts.push(&text[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&text[start..]);
    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// Returns the contents of the outermost `{ ... }` blocks in `text`.
///
/// Hashtable literals (`@{`) and braced variable names (`${`) are not
/// blocks. A block left open at the end of the text runs to the end.
fn inline_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut quote = None;
    let mut depth = 0usize;
    let mut literal = false;
    let mut start = 0;
    let mut prev: Option<char> = None;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '{' => {
                    if depth == 0 {
                        literal = matches!(prev, Some('@' | '$'));
                        start = i + 1;
                    }
                    depth += 1;
                }
                '}' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 && !literal {
                        blocks.push(&text[start..i]);
                    }
                }
                _ => {}
            },
        }
        prev = Some(c);
    }
    if depth > 0 && !literal {
        blocks.push(&text[start..]);
    }
    blocks
}

/// How a statement is treated by the allow-list check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Control flow, declaration or assignment.
    ControlFlow,
    /// A line naming a command.
    Command,
}

/// One logical statement of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based line where the statement starts.
    pub line: usize,
    /// Statement text with continuations joined.
    pub text: String,
    pub kind: StatementKind,
}

/// Classifies a trimmed statement.
#[must_use]
pub fn classify(text: &str) -> StatementKind {
    if CONTROL_FLOW.is_match(text.trim()) {
        StatementKind::ControlFlow
    } else {
        StatementKind::Command
    }
}

/// Splits a script into logical statements.
///
/// Blank lines, `#` comments, `<# … #>` block comments and here-string
/// bodies are skipped. Lines ending in a backtick are joined with the next
/// line and reported at the first physical line.
#[must_use]
pub fn split_statements(script: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    let mut in_block_comment = false;
    let mut here_string: Option<char> = None;

    for (idx, raw) in script.lines().enumerate() {
        let number = idx + 1;
        let mut line = raw.trim();

        if let Some(quote) = here_string {
            let terminator = format!("{quote}@");
            let Some(rest) = line.strip_prefix(terminator.as_str()) else {
                continue;
            };
            here_string = None;
            line = rest.trim();
        }

        if in_block_comment {
            match line.find("#>") {
                Some(end) => {
                    in_block_comment = false;
                    line = line[end + 2..].trim();
                }
                None => continue,
            }
        }

        if pending.is_none() {
            if let Some(body) = line.strip_prefix("<#") {
                match body.find("#>") {
                    Some(end) => line = body[end + 2..].trim(),
                    None => {
                        in_block_comment = true;
                        continue;
                    }
                }
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
        }

        if let Some(quote) = here_string_opener(line) {
            here_string = Some(quote);
        }

        let (content, continues) = match line.strip_suffix('`') {
            Some(head) => (head.trim_end(), true),
            None => (line, false),
        };

        let (start, mut text) = pending.take().unwrap_or((number, String::new()));
        if !text.is_empty() && !content.is_empty() {
            text.push(' ');
        }
        text.push_str(content);

        if continues && here_string.is_none() {
            pending = Some((start, text));
        } else if !text.is_empty() {
            let kind = classify(&text);
            statements.push(Statement {
                line: start,
                text,
                kind,
            });
        }
    }

    if let Some((line, text)) = pending {
        if !text.is_empty() {
            let kind = classify(&text);
            statements.push(Statement { line, text, kind });
        }
    }

    statements
}

/// Validates multi-line scripts against a policy.
#[derive(Debug, Clone, Copy)]
pub struct ScriptValidator<'a> {
    policy: &'a SecurityPolicy,
    commands: CommandValidator<'a>,
}

impl<'a> ScriptValidator<'a> {
    #[must_use]
    pub fn new(policy: &'a SecurityPolicy) -> Self {
        Self {
            policy,
            commands: CommandValidator::new(policy),
        }
    }

    /// Validates raw bytes, rejecting invalid UTF-8 before anything else.
    #[must_use]
    pub fn validate_bytes(&self, raw: &[u8]) -> ValidationOutcome {
        if raw.len() > self.policy.max_script_length() {
            return self.too_long(raw.len());
        }
        match std::str::from_utf8(raw) {
            Ok(text) => self.validate(text),
            Err(e) => ValidationOutcome::reject(
                Rule::Encoding,
                format!("invalid UTF-8 at byte offset {}", e.valid_up_to()),
            ),
        }
    }

    /// Validates a whole script.
    #[must_use]
    pub fn validate(&self, script: &str) -> ValidationOutcome {
        if script.len() > self.policy.max_script_length() {
            return self.too_long(script.len());
        }
        if let Some((line, c)) = sanitize::first_disallowed(script) {
            return ValidationOutcome::reject(
                Rule::CharacterValidation,
                format!("disallowed character U+{:04X}", c as u32),
            )
            .at_line(line);
        }

        if let Some(rule) = self
            .policy
            .rules()
            .first_match(script, &[RuleScope::Composite])
        {
            return ValidationOutcome::reject(
                Rule::DangerousConstructs,
                format!(
                    "script contains dangerous construct '{}': {}",
                    rule.name(),
                    rule.rationale()
                ),
            )
            .with_pattern(rule.pattern());
        }

        let statements = split_statements(script);
        if statements.is_empty() {
            return ValidationOutcome::reject(Rule::EmptyInput, "script has no statements");
        }

        for statement in &statements {
            let outcome = self
                .commands
                .check_patterns(&statement.text, &[RuleScope::Statement]);
            let outcome = if outcome.is_valid() {
                self.check_segments(&statement.text, 0)
            } else {
                outcome
            };
            if !outcome.is_valid() {
                return outcome.at_line(statement.line);
            }
        }

        ValidationOutcome::pass()
    }

    /// Checks each `;`-separated segment of a statement.
    ///
    /// Command segments go through the allow-list. Control-flow segments
    /// that open blocks have each block checked the same way.
    fn check_segments(&self, text: &str, depth: usize) -> ValidationOutcome {
        if depth > MAX_BLOCK_DEPTH {
            return ValidationOutcome::reject(
                Rule::BaseCommand,
                format!("inline blocks nested deeper than {MAX_BLOCK_DEPTH} levels"),
            );
        }
        for segment in split_top_level(text) {
            let outcome = match classify(segment) {
                StatementKind::Command => self
                    .commands
                    .check_statement(segment, &[RuleScope::Statement]),
                StatementKind::ControlFlow if BLOCK_STATEMENT.is_match(segment) => {
                    inline_blocks(segment)
                        .into_iter()
                        .map(|block| self.check_segments(block, depth + 1))
                        .find(|outcome| !outcome.is_valid())
                        .unwrap_or_else(ValidationOutcome::pass)
                }
                StatementKind::ControlFlow => ValidationOutcome::pass(),
            };
            if !outcome.is_valid() {
                return outcome;
            }
        }
        ValidationOutcome::pass()
    }

    fn too_long(&self, len: usize) -> ValidationOutcome {
        ValidationOutcome::reject(
            Rule::MaxLength,
            format!(
                "script length {} exceeds maximum {}",
                len,
                self.policy.max_script_length()
            ),
        )
    }
}
