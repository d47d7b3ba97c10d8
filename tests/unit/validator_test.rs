//! Unit tests for command and script validation.
//!
//! These tests exercise the validators through the public API only, using
//! the default policy unless a test needs something else.

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use psguard::policy::{PolicySettings, RuleScope, SecurityPolicy};
use psguard::validator::{
    split_statements, CommandValidator, Rule, ScriptValidator, StatementKind, ValidationOutcome,
};

fn check_command(command: &str) -> ValidationOutcome {
    let policy = SecurityPolicy::default();
    CommandValidator::new(&policy).validate(command, false)
}

fn check_script(script: &str) -> ValidationOutcome {
    let policy = SecurityPolicy::default();
    ScriptValidator::new(&policy).validate(script)
}

// ============================================================================
// Command validation
// ============================================================================

#[test]
fn test_listed_command_with_wildcard_filter_passes() {
    let outcome = check_command("Get-ChildItem -Path . -Filter *.go");
    assert!(outcome.is_valid(), "{outcome:?}");
}

#[test]
fn test_forced_root_delete_reports_exact_pattern() {
    let policy = SecurityPolicy::default();
    let command = r"Remove-Item -Recurse -Force C:\";
    let outcome = CommandValidator::new(&policy).validate(command, false);
    let expected = policy
        .rules()
        .first_match(command, &[RuleScope::Statement, RuleScope::Composite])
        .unwrap();

    assert_eq!(outcome.rule, Some(Rule::BlockedPattern));
    assert_eq!(outcome.pattern.as_deref(), Some(expected.pattern()));
}

#[test]
fn test_blocked_pattern_ignores_case() {
    assert_eq!(
        check_command("git log; SHUTDOWN /s").rule,
        Some(Rule::BlockedPattern)
    );
}

#[test]
fn test_call_operator_needs_shell_access() {
    let policy = SecurityPolicy::default();
    let validator = CommandValidator::new(&policy);
    assert_eq!(
        validator.validate("& git status", false).rule,
        Some(Rule::ShellAccess)
    );
    assert!(validator.validate("& git status", true).is_valid());
}

#[test]
fn test_redirection_requires_shell_access() {
    let outcome = check_command("git log > history.txt");
    assert_eq!(outcome.rule, Some(Rule::ShellAccess));
    assert!(outcome.reason.unwrap().contains("redirection"));
}

#[test]
fn test_subexpression_requires_shell_access() {
    assert_eq!(
        check_command("Write-Output $(Get-Date)").rule,
        Some(Rule::ShellAccess)
    );
}

#[test]
fn test_custom_pattern_blocks_listed_command() {
    let policy = SecurityPolicy::from_settings(&PolicySettings {
        blocked_patterns: vec![r"\bgit\s+push\b".to_string()],
        ..PolicySettings::default()
    })
    .unwrap();
    let outcome = CommandValidator::new(&policy).validate("git push origin main", false);
    assert_eq!(outcome.rule, Some(Rule::BlockedPattern));
    assert_eq!(outcome.pattern.as_deref(), Some(r"\bgit\s+push\b"));
}

#[test]
fn test_multi_line_command_rejected_with_or_without_shell_access() {
    let policy = SecurityPolicy::from_settings(&PolicySettings {
        allowed_commands: Some(vec!["echo".to_string()]),
        ..PolicySettings::default()
    })
    .unwrap();
    let validator = CommandValidator::new(&policy);

    assert_eq!(
        validator.validate("echo hi; touch pwned", false).rule,
        Some(Rule::ShellAccess)
    );
    assert_eq!(
        validator.validate("echo hi\ntouch pwned", false).rule,
        Some(Rule::CharacterValidation)
    );
    assert_eq!(
        validator.validate("echo hi\r\ntouch pwned", true).rule,
        Some(Rule::CharacterValidation)
    );
}

#[test]
fn test_empty_command_rejected() {
    assert_eq!(check_command("   ").rule, Some(Rule::EmptyInput));
}

// ============================================================================
// Script validation
// ============================================================================

#[test]
fn test_invoke_expression_anywhere_is_dangerous_construct() {
    let script = "Write-Output start\nif ($ok) {\n    Invoke-Expression $userInput\n}\n";
    let outcome = check_script(script);
    assert_eq!(outcome.rule, Some(Rule::DangerousConstructs));
    assert_eq!(outcome.line, None);
}

#[test]
fn test_dangerous_construct_precedes_unlisted_first_line() {
    // Line 1 alone would fail the allow-list.
    let outcome = check_script("Invoke-Unlisted\niex $payload\n");
    assert_eq!(outcome.rule, Some(Rule::DangerousConstructs));
}

#[test]
fn test_control_flow_with_suspicious_words_passes() {
    let script = "\
foreach ($name in @('format', 'del')) {
    if ($name -eq 'format') {
        Write-Output $name
    } else {
        Write-Output skipped
    }
}
";
    let outcome = check_script(script);
    assert!(outcome.is_valid(), "{outcome:?}");
}

#[test]
fn test_commented_here_string_opener_hides_nothing() {
    let script = "Get-Date # @\"\nInvoke-Unlisted now\n\"@\n";
    let outcome = check_script(script);
    assert_eq!(outcome.rule, Some(Rule::AllowedCommands));
    assert_eq!(outcome.line, Some(2));
}

#[test]
fn test_try_block_body_is_allow_listed() {
    let outcome = check_script("try { Invoke-Unlisted now } catch { }\n");
    assert_eq!(outcome.rule, Some(Rule::AllowedCommands));
    assert_eq!(outcome.line, Some(1));
}

#[test]
fn test_inline_blocks_of_allowed_commands_pass() {
    let script = "\
foreach ($f in Get-ChildItem) { Write-Output $f.Name }
try { Get-Date } catch { Write-Warning 'no date' } finally { Write-Output done }
";
    let outcome = check_script(script);
    assert!(outcome.is_valid(), "{outcome:?}");
}

#[test]
fn test_blocked_statement_reports_line() {
    let outcome = check_script("Get-Date\nWrite-Output ok\nRestart-Computer\n");
    assert_eq!(outcome.rule, Some(Rule::BlockedPattern));
    assert_eq!(outcome.line, Some(3));
}

#[test]
fn test_execution_policy_change_blocked_by_default() {
    let outcome = check_script("Set-ExecutionPolicy Unrestricted -Scope Process\n");
    assert_eq!(outcome.rule, Some(Rule::DangerousConstructs));
}

#[test]
fn test_script_length_limit() {
    let policy = SecurityPolicy::from_settings(&PolicySettings {
        max_script_length: 16,
        ..PolicySettings::default()
    })
    .unwrap();
    let outcome = ScriptValidator::new(&policy).validate("Write-Output 'this is too long'\n");
    assert_eq!(outcome.rule, Some(Rule::MaxLength));
}

#[test]
fn test_statement_count_includes_control_flow() {
    let statements = split_statements("$x = 1\nif ($x) {\n  Write-Output $x\n}\n");
    let kinds: Vec<StatementKind> = statements.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StatementKind::ControlFlow,
            StatementKind::ControlFlow,
            StatementKind::Command,
            StatementKind::ControlFlow,
        ]
    );
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_unlisted_base_command_rejected(
        base in "Zq[a-z]{2,10}",
        args in prop::collection::vec("[0-9]{1,6}", 0..4),
    ) {
        let command = std::iter::once(base).chain(args).collect::<Vec<_>>().join(" ");
        prop_assert_eq!(check_command(&command).rule, Some(Rule::AllowedCommands));
    }

    #[test]
    fn prop_blocked_fragment_always_reported(
        fragment in prop::sample::select(vec![
            "Stop-Computer",
            "Invoke-Expression $x",
            "sudo ls",
            "bcdedit /set",
            "Set-MpPreference -DisableRealtimeMonitoring 1",
        ]),
        prefix in "[0-9]{0,6}",
    ) {
        let policy = SecurityPolicy::default();
        let command = format!("Get-ChildItem {prefix} {fragment}");
        let outcome = CommandValidator::new(&policy).validate(&command, true);
        let expected = policy
            .rules()
            .first_match(&command, &[RuleScope::Statement, RuleScope::Composite])
            .map(|r| r.pattern().to_string());
        prop_assert_eq!(outcome.rule, Some(Rule::BlockedPattern));
        prop_assert_eq!(outcome.pattern, expected);
    }

    #[test]
    fn prop_multi_line_command_never_valid(
        first in prop::sample::select(vec!["Get-Date", "git status", "echo hi"]),
        second in "[a-z]{1,10}( [a-z0-9]{1,6}){0,2}",
        separator in prop::sample::select(vec!["\n", "\r\n", "\r"]),
        allow_shell in any::<bool>(),
    ) {
        let policy = SecurityPolicy::default();
        let command = format!("{first}{separator}{second}");
        let outcome = CommandValidator::new(&policy).validate(&command, allow_shell);
        prop_assert!(!outcome.is_valid());
    }

    #[test]
    fn prop_control_flow_bodies_checked(
        head in prop::sample::select(vec![
            "if ($x)",
            "elseif ($y)",
            "foreach ($f in $files)",
            "while ($true)",
            "try",
            "function Invoke-Local",
        ]),
        base in "Zq[a-z]{2,10}",
        before in prop::sample::select(vec!["", "Get-Date; ", "Write-Output ok; "]),
    ) {
        let script = format!("{head} {{ {before}{base} now }}\n");
        let outcome = check_script(&script);
        prop_assert_eq!(outcome.rule, Some(Rule::AllowedCommands));
        prop_assert_eq!(outcome.line, Some(1));
    }

    #[test]
    fn prop_comment_never_opens_here_string(
        quote in prop::sample::select(vec!["\"", "'"]),
        base in "Zq[a-z]{2,10}",
    ) {
        let script = format!("Get-Date # @{quote}\n{base} now\n{quote}@\n");
        let outcome = check_script(&script);
        prop_assert_eq!(outcome.rule, Some(Rule::AllowedCommands));
        prop_assert_eq!(outcome.line, Some(2));
    }

    #[test]
    fn prop_assignments_never_hit_allow_list(
        name in "[a-z]{1,8}",
        value in "[A-Za-z][A-Za-z-]{0,12}",
    ) {
        let script = format!("${name} = {value}\nWrite-Output ${name}\n");
        prop_assert_ne!(check_script(&script).rule, Some(Rule::AllowedCommands));
    }
}
