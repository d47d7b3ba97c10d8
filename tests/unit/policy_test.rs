//! Unit tests for policy construction and the rule table.

use std::time::Duration;

use pretty_assertions::assert_eq;
use psguard::policy::{
    ExecutionMode, PolicyError, PolicySettings, RuleDef, RuleScope, RuleTable, SecurityPolicy,
};

// ============================================================================
// Rule table
// ============================================================================

#[test]
fn test_first_match_follows_table_order() {
    let table = RuleTable::compile([
        RuleDef::custom("first", r"\bdanger\b", RuleScope::Statement),
        RuleDef::custom("second", r"\bdanger\w*", RuleScope::Statement),
    ])
    .unwrap();
    let hit = table
        .first_match("danger zone", &[RuleScope::Statement])
        .unwrap();
    assert_eq!(hit.name(), "first");
    assert_eq!(hit.pattern(), r"\bdanger\b");
}

#[test]
fn test_first_match_respects_scope() {
    let table = RuleTable::compile([RuleDef::custom("c", r"secret", RuleScope::Composite)]).unwrap();
    assert!(table
        .first_match("secret", &[RuleScope::Statement])
        .is_none());
    assert!(table
        .first_match("secret", &[RuleScope::Composite])
        .is_some());
}

#[test]
fn test_rules_are_case_insensitive() {
    let policy = SecurityPolicy::default();
    let hit = policy
        .rules()
        .first_match("STOP-COMPUTER -Force", &[RuleScope::Statement])
        .unwrap();
    assert_eq!(hit.name(), "system-power");
}

#[test]
fn test_composite_rules_span_lines() {
    let policy = SecurityPolicy::default();
    let script = "$a = [Reflection.Assembly]::LoadFile($p)\n$a.GetType('T')";
    let hit = policy
        .rules()
        .first_match(script, &[RuleScope::Composite])
        .unwrap();
    assert_eq!(hit.name(), "assembly-load");
}

// ============================================================================
// Settings
// ============================================================================

#[test]
fn test_custom_patterns_follow_builtins() {
    let policy = SecurityPolicy::from_settings(&PolicySettings {
        blocked_patterns: vec![r"\bterraform\s+destroy\b".to_string()],
        ..PolicySettings::default()
    })
    .unwrap();
    let last = policy.rules().iter().last().unwrap();
    assert_eq!(last.name(), "custom-1");
    assert_eq!(last.scope(), RuleScope::Statement);
}

#[test]
fn test_allowed_commands_replace_and_extend() {
    let policy = SecurityPolicy::from_settings(&PolicySettings {
        allowed_commands: Some(vec!["git".to_string()]),
        extra_allowed_commands: vec!["terraform".to_string()],
        ..PolicySettings::default()
    })
    .unwrap();
    assert!(policy.permits_base_command("git"));
    assert!(policy.permits_base_command("terraform"));
    assert!(!policy.permits_base_command("cargo"));
    // Intrinsics survive a replaced allow-list.
    assert!(policy.permits_base_command("Write-Output"));
}

#[test]
fn test_zero_length_limit_rejected() {
    let err = SecurityPolicy::from_settings(&PolicySettings {
        max_script_length: 0,
        ..PolicySettings::default()
    })
    .unwrap_err();
    assert!(matches!(err, PolicyError::ZeroLimit("max_script_length")));
}

#[test]
fn test_script_timeouts_are_separate() {
    let policy = SecurityPolicy::default();
    assert_eq!(
        policy.timeouts(ExecutionMode::Command),
        (Duration::from_secs(30), Duration::from_secs(300))
    );
    assert_eq!(
        policy.timeouts(ExecutionMode::Script),
        (Duration::from_secs(60), Duration::from_secs(600))
    );
}

#[test]
fn test_execution_policy_override_drops_rules() {
    let relaxed = SecurityPolicy::from_settings(&PolicySettings {
        allow_execution_policy_override: true,
        ..PolicySettings::default()
    })
    .unwrap();
    assert!(relaxed
        .rules()
        .first_match("Set-ExecutionPolicy Bypass", &[RuleScope::Composite])
        .is_none());
    assert!(SecurityPolicy::default()
        .rules()
        .first_match("Set-ExecutionPolicy Bypass", &[RuleScope::Composite])
        .is_some());
}
