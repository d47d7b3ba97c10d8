//! End-to-end tests for the guarded execution pipeline.
//!
//! Each test drives [`GuardService::handle`] with an operation request and
//! checks both the returned value and the audit trail.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use psguard::error::GuardError;
use psguard::policy::{ExecutionMode, PolicySettings};
use psguard::service::{ExecuteParams, GuardService, OperationRequest, OperationResponse};
use psguard::shell::Interpreter;
use psguard::validator::Rule;
use serde_json::json;

use crate::common::{pwsh_available, sh_settings, TestContext};

async fn call(service: &GuardService, name: &str, params: serde_json::Value) -> Result<OperationResponse, GuardError> {
    service.handle(OperationRequest::new(name, params)).await
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_listed_command_runs_and_lists_files() {
    if !pwsh_available() {
        eprintln!("skipping: pwsh not available");
        return;
    }
    let ctx = TestContext::new();
    ctx.create_file("main.go", "package main\n");
    ctx.create_file("README.md", "# readme\n");
    let service = ctx.pwsh_service();

    let response = call(
        &service,
        "execute_command",
        json!({"command": "Get-ChildItem -Path . -Filter *.go"}),
    )
    .await
    .unwrap();

    let OperationResponse::Execution(result) = response else {
        panic!("expected an execution result");
    };
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("main.go"), "{}", result.stdout);
    assert!(!result.stdout.contains("README.md"));
}

#[tokio::test]
async fn test_blocked_command_is_rejected_and_audited() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = call(
        &service,
        "execute_command",
        json!({"command": r"Remove-Item -Recurse -Force C:\"}),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), -32001);
    assert_eq!(err.outcome().unwrap().rule, Some(Rule::BlockedPattern));
    assert!(err.outcome().unwrap().pattern.is_some());
    assert!(!err.spawned_process());

    let entries = ctx.operation_entries();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry["operationKind"], "execute_command");
    assert_eq!(entry["success"], false);
    assert_eq!(entry["errorCode"], -32001);
    assert_eq!(entry["validationOutcome"]["rule"], "blocked_pattern");
    assert!(entry.get("executionResult").is_none());
}

#[tokio::test]
async fn test_script_with_invoke_expression_is_dangerous() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = call(
        &service,
        "execute_script",
        json!({"script": "echo start\n$cmd = $args[0]\nInvoke-Expression $userInput\n"}),
    )
    .await
    .unwrap_err();

    let outcome = err.outcome().unwrap();
    assert_eq!(outcome.rule, Some(Rule::DangerousConstructs));
    assert_eq!(outcome.line, None);
    assert_eq!(ctx.operation_entries()[0]["errorType"], "SecurityViolation");
}

#[cfg(unix)]
#[tokio::test]
async fn test_sleeping_command_times_out() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = call(
        &service,
        "execute_command",
        json!({"command": "sleep 5", "timeout": 1}),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "Timeout");
    let result = err.result().unwrap();
    assert!(result.timed_out);
    assert!(result.duration_millis >= 1000, "{}", result.duration_millis);
    assert!(result.duration_millis < 2500, "{}", result.duration_millis);

    let entry = &ctx.operation_entries()[0];
    assert_eq!(entry["errorType"], "Timeout");
    assert_eq!(entry["errorCode"], -32002);
    assert_eq!(entry["executionResult"]["timedOut"], true);
}

#[tokio::test]
async fn test_path_override_rejected_before_spawn() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = call(
        &service,
        "execute_command",
        json!({"command": "echo hi", "environment_vars": {"PATH": "/evil"}}),
    )
    .await
    .unwrap_err();

    assert_eq!(err.outcome().unwrap().rule, Some(Rule::DangerousEnvVar));
    assert!(!err.spawned_process());
    let entry = &ctx.operation_entries()[0];
    assert_eq!(entry["environmentOverrides"]["PATH"], "/evil");
    assert!(entry.get("executionResult").is_none());
}

// ============================================================================
// Pipeline behavior
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_successful_command_audited_with_result() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let response = call(&service, "execute_command", json!({"command": "echo hello"}))
        .await
        .unwrap();
    let OperationResponse::Execution(result) = response else {
        panic!("expected an execution result");
    };
    assert_eq!(result.stdout, "hello\n");

    let entry = &ctx.operation_entries()[0];
    assert_eq!(entry["success"], true);
    assert_eq!(entry["errorCode"], 0);
    assert_eq!(entry["errorType"], "None");
    assert_eq!(entry["actor"], "integration");
    assert_eq!(entry["executionResult"]["stdout"], "hello\n");
    assert_eq!(entry["validationOutcome"]["valid"], true);
    assert_eq!(
        entry["workingDirectory"],
        service.path_guard().root().display().to_string()
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_non_zero_exit_is_execution_error_with_output() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = call(
        &service,
        "execute_command",
        json!({"command": "ls does-not-exist"}),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "ExecutionError");
    let result = err.result().unwrap();
    assert_ne!(result.exit_code, 0);
    assert!(!result.stderr.is_empty());
    assert_eq!(ctx.operation_entries()[0]["errorCode"], -32003);
}

#[cfg(unix)]
#[tokio::test]
async fn test_script_reports_statement_count() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let response = call(
        &service,
        "execute_script",
        json!({"script": "# greeting\necho one\n\necho two\n"}),
    )
    .await
    .unwrap();
    let OperationResponse::Execution(result) = response else {
        panic!("expected an execution result");
    };
    assert_eq!(result.lines_executed, Some(2));
    assert_eq!(result.stdout, "one\ntwo\n");
}

#[tokio::test]
async fn test_working_directory_escape_rejected() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = call(
        &service,
        "execute_command",
        json!({"command": "ls", "working_directory": "sub/../.."}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.outcome().unwrap().rule, Some(Rule::PathTraversal));
}

#[tokio::test]
async fn test_pipeline_needs_shell_access_flag() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = call(&service, "execute_command", json!({"command": "ls | sort"}))
        .await
        .unwrap_err();
    assert_eq!(err.outcome().unwrap().rule, Some(Rule::ShellAccess));

    #[cfg(unix)]
    {
        let response = call(
            &service,
            "execute_command",
            json!({"command": "printf 'b\\na\\n' | sort", "allow_shell_access": true}),
        )
        .await
        .unwrap();
        let OperationResponse::Execution(result) = response else {
            panic!("expected an execution result");
        };
        assert_eq!(result.stdout, "a\nb\n");
    }
}

#[tokio::test]
async fn test_validate_operation_never_spawns() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();
    let marker = ctx.path().join("created");

    let response = call(
        &service,
        "validate_command",
        json!({"command": format!("touch {}", marker.display())}),
    )
    .await
    .unwrap();
    let OperationResponse::Validation(outcome) = response else {
        panic!("expected a validation outcome");
    };
    assert_eq!(outcome.rule, Some(Rule::AllowedCommands));
    assert!(!marker.exists());

    let ok = service
        .validate(
            ExecutionMode::Command,
            &ExecuteParams {
                command: Some("echo fine".to_string()),
                ..ExecuteParams::default()
            },
        )
        .unwrap();
    assert!(ok.is_valid());

    let kinds: Vec<_> = ctx
        .operation_entries()
        .iter()
        .map(|e| (e["operationKind"].clone(), e["success"].clone()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (json!("validate_command"), json!(false)),
            (json!("validate_command"), json!(true)),
        ]
    );
}

#[tokio::test]
async fn test_request_shape_errors() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let both = call(
        &service,
        "execute_command",
        json!({"command": "echo a", "script": "echo b"}),
    )
    .await
    .unwrap_err();
    assert_eq!(both.kind(), "InvalidParams");

    let missing = call(&service, "execute_script", json!({})).await.unwrap_err();
    assert_eq!(missing.code(), -32602);

    let unknown = call(&service, "create_file", json!({"path": "x"}))
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), "MethodNotFound");

    let kinds: Vec<_> = ctx
        .operation_entries()
        .iter()
        .map(|e| e["errorType"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(kinds, vec!["InvalidParams", "InvalidParams", "MethodNotFound"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_timeout_clamped_to_policy_maximum() {
    let ctx = TestContext::new();
    let service = ctx.service_with(
        Interpreter::posix_sh(),
        PolicySettings {
            default_timeout_seconds: 1,
            max_timeout_seconds: 1,
            ..sh_settings()
        },
    );

    let err = call(
        &service,
        "execute_command",
        json!({"command": "sleep 5", "timeout": 600}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "Timeout");
    assert!(err.result().unwrap().duration_millis < 2500);
}

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_calls_share_one_audit_chain() {
    let ctx = TestContext::new();
    let service = Arc::new(ctx.sh_service());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let command = if i % 2 == 0 { "echo even" } else { "Invoke-Unlisted" };
                let _ = call(&service, "execute_command", json!({"command": command})).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(ctx.operation_entries().len(), 8);
    let summary = psguard::audit::verify_chain(&ctx.audit_path()).unwrap();
    // startup plus eight operations; shutdown follows when the service drops
    assert_eq!(summary.entries, 9);
}

#[test]
fn test_undecodable_script_is_audited_as_encoding() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let err = service
        .decode_script("execute_script", b"echo ok\necho \xff\n".to_vec())
        .unwrap_err();
    assert_eq!(err.outcome().unwrap().rule, Some(Rule::Encoding));
    assert!(!err.spawned_process());

    let entries = ctx.operation_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["operationKind"], "execute_script");
    assert_eq!(entries[0]["errorCode"], -32001);
    assert_eq!(entries[0]["validationOutcome"]["rule"], "encoding");
}

#[test]
fn test_decodable_script_passes_through_unaudited() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();

    let script = service
        .decode_script("validate_script", b"echo ok\n".to_vec())
        .unwrap();
    assert_eq!(script, "echo ok\n");
    assert!(ctx.operation_entries().is_empty());
}

#[tokio::test]
async fn test_multi_line_command_never_spawns() {
    let ctx = TestContext::new();
    let service = ctx.sh_service();
    let marker = ctx.path().join("pwned");

    let err = call(
        &service,
        "execute_command",
        json!({
            "command": format!("echo hi\ntouch {}", marker.display()),
            "allow_shell_access": true,
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.outcome().unwrap().rule, Some(Rule::CharacterValidation));
    assert!(!err.spawned_process());
    assert!(!marker.exists());
    assert_eq!(ctx.operation_entries()[0]["errorCode"], -32001);
}
