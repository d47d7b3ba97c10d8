//! Integration tests for bounded subprocess execution.
//!
//! Uses `sh` so the tests run wherever a POSIX shell exists.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use psguard::executor::{ExecutionRequest, Executor};
use psguard::policy::ExecutionMode;
use psguard::shell::Interpreter;

use crate::common::TestContext;

fn request(ctx: &TestContext, mode: ExecutionMode, text: &str, timeout: Duration) -> ExecutionRequest {
    ExecutionRequest {
        command_or_script: text.to_string(),
        mode,
        timeout,
        working_directory: ctx.path(),
        environment_overrides: BTreeMap::new(),
        allow_shell_access: true,
    }
}

fn sh_executor(ctx: &TestContext) -> Executor {
    // Script files land in the workspace so tests can observe cleanup.
    Executor::new(Interpreter::posix_sh(), 1024 * 1024).with_temp_dir(ctx.path())
}

fn leftover_scripts(ctx: &TestContext) -> Vec<String> {
    std::fs::read_dir(ctx.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("psguard-"))
        .collect()
}

#[tokio::test]
async fn test_timeout_kills_and_keeps_partial_output() {
    let ctx = TestContext::new();
    let executor = sh_executor(&ctx);
    let started = Instant::now();
    let result = executor
        .run(&request(
            &ctx,
            ExecutionMode::Command,
            "echo before; sleep 5; echo after",
            Duration::from_secs(1),
        ))
        .await
        .unwrap();

    assert!(result.timed_out);
    assert!(!result.succeeded());
    assert_eq!(result.stdout.trim(), "before");
    assert!(result.duration_millis >= 1000, "{}", result.duration_millis);
    assert!(result.duration_millis < 3000, "{}", result.duration_millis);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_fast_command_is_not_timed_out() {
    let ctx = TestContext::new();
    let result = sh_executor(&ctx)
        .run(&request(
            &ctx,
            ExecutionMode::Command,
            "true",
            Duration::from_secs(5),
        ))
        .await
        .unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, 0);
    assert!(result.duration_millis < 5000);
}

#[tokio::test]
async fn test_script_file_removed_after_success() {
    let ctx = TestContext::new();
    let result = sh_executor(&ctx)
        .run(&request(
            &ctx,
            ExecutionMode::Script,
            "echo one\necho two\n",
            Duration::from_secs(5),
        ))
        .await
        .unwrap();
    assert_eq!(result.stdout, "one\ntwo\n");
    assert!(leftover_scripts(&ctx).is_empty());
}

#[tokio::test]
async fn test_script_file_removed_after_timeout() {
    let ctx = TestContext::new();
    let result = sh_executor(&ctx)
        .run(&request(
            &ctx,
            ExecutionMode::Script,
            "sleep 5\n",
            Duration::from_millis(300),
        ))
        .await
        .unwrap();
    assert!(result.timed_out);
    assert!(leftover_scripts(&ctx).is_empty());
}

#[tokio::test]
async fn test_environment_is_merged_not_replaced() {
    let ctx = TestContext::new();
    let mut req = request(
        &ctx,
        ExecutionMode::Command,
        "echo \"$BUILD_MODE:$HOME\"",
        Duration::from_secs(5),
    );
    req.environment_overrides
        .insert("BUILD_MODE".to_string(), "release".to_string());
    let result = sh_executor(&ctx).run(&req).await.unwrap();

    let line = result.stdout.trim();
    assert!(line.starts_with("release:"), "{line}");
    if std::env::var("HOME").is_ok_and(|h| !h.is_empty()) {
        assert!(line.len() > "release:".len(), "inherited HOME missing: {line}");
    }
}

#[tokio::test]
async fn test_runs_in_working_directory() {
    let ctx = TestContext::new();
    ctx.create_file("sub/marker.txt", "x");
    let mut req = request(&ctx, ExecutionMode::Command, "ls", Duration::from_secs(5));
    req.working_directory = ctx.path().join("sub");
    let result = sh_executor(&ctx).run(&req).await.unwrap();
    assert_eq!(result.stdout.trim(), "marker.txt");
}

#[tokio::test]
async fn test_large_output_is_capped_without_blocking() {
    let ctx = TestContext::new();
    let executor = Executor::new(Interpreter::posix_sh(), 1000);
    let result = executor
        .run(&request(
            &ctx,
            ExecutionMode::Command,
            "i=0; while [ $i -lt 5000 ]; do echo line-$i; i=$((i+1)); done",
            Duration::from_secs(20),
        ))
        .await
        .unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.len(), 1000);
    assert!(result.stdout_truncated);
    assert!(!result.stderr_truncated);
}
