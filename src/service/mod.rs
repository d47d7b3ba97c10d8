//! Operation dispatch for guarded execution.
//!
//! [`GuardService`] is the single entry point a host integration calls. It
//! accepts an already-deserialized operation (a name plus a parameter map),
//! runs the pre-spawn checks, executes when they pass, audits the attempt
//! whatever the result, and hands back a structured result or error.
//!
//! Supported operations:
//!
//! | name | effect |
//! |---|---|
//! | `execute_command` | validate and run one command line |
//! | `execute_script` | validate and run a multi-line script |
//! | `validate_command` | run the command checks only |
//! | `validate_script` | run the script checks only |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditLogger};
use crate::error::{GuardError, GuardResult};
use crate::executor::{ExecutionRequest, ExecutionResult, Executor};
use crate::guard::{validate_environment, PathGuard};
use crate::policy::{ExecutionMode, SecurityPolicy};
use crate::types::config::GuardConfig;
use crate::validator::{split_statements, CommandValidator, ScriptValidator, ValidationOutcome};

/// An operation as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl OperationRequest {
    #[must_use]
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            params,
        }
    }
}

/// What a successful operation returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OperationResponse {
    Execution(ExecutionResult),
    Validation(ValidationOutcome),
}

/// Parameters shared by every operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecuteParams {
    pub command: Option<String>,
    pub script: Option<String>,
    /// Seconds. Missing or non-positive selects the mode default.
    pub timeout: Option<f64>,
    pub working_directory: Option<String>,
    pub environment_vars: BTreeMap<String, String>,
    pub allow_shell_access: bool,
}

impl ExecuteParams {
    /// Parses a parameter map.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidParams`] if a field has the wrong type.
    pub fn from_map(params: &Map<String, Value>) -> GuardResult<Self> {
        serde_json::from_value(Value::Object(params.clone()))
            .map_err(|e| GuardError::invalid_params(format!("invalid parameters: {e}")))
    }

    /// Returns the command or script text for `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidParams`] unless exactly the field that
    /// matches `mode` is present.
    pub fn payload(&self, mode: ExecutionMode) -> GuardResult<&str> {
        match (mode, &self.command, &self.script) {
            (_, Some(_), Some(_)) => Err(GuardError::invalid_params(
                "'command' and 'script' are mutually exclusive",
            )),
            (ExecutionMode::Command, Some(command), None) => Ok(command.as_str()),
            (ExecutionMode::Script, None, Some(script)) => Ok(script.as_str()),
            (ExecutionMode::Command, None, _) => Err(GuardError::invalid_params(
                "missing required parameter 'command'",
            )),
            (ExecutionMode::Script, _, None) => Err(GuardError::invalid_params(
                "missing required parameter 'script'",
            )),
        }
    }
}

/// The operations this service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Execute(ExecutionMode),
    Validate(ExecutionMode),
}

impl Operation {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "execute_command" => Some(Self::Execute(ExecutionMode::Command)),
            "execute_script" => Some(Self::Execute(ExecutionMode::Script)),
            "validate_command" => Some(Self::Validate(ExecutionMode::Command)),
            "validate_script" => Some(Self::Validate(ExecutionMode::Script)),
            _ => None,
        }
    }
}

/// Validates, executes and audits operations.
///
/// All state is read-only except the audit logger, which serializes its own
/// writes, so one service can be shared across concurrent callers.
#[derive(Debug, Clone)]
pub struct GuardService {
    policy: Arc<SecurityPolicy>,
    path_guard: PathGuard,
    executor: Executor,
    audit: Arc<AuditLogger>,
}

impl GuardService {
    #[must_use]
    pub fn new(
        policy: SecurityPolicy,
        path_guard: PathGuard,
        executor: Executor,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            path_guard,
            executor,
            audit,
        }
    }

    /// Builds the service from configuration.
    ///
    /// # Errors
    ///
    /// Fails if the policy does not compile, the root does not exist, or the
    /// audit log cannot be opened.
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let policy = config.build_policy().context("Failed to build security policy")?;
        let root = config
            .root()
            .context("Failed to determine working-directory root")?;
        let path_guard = PathGuard::new(&root)
            .with_context(|| format!("Invalid working-directory root {}", root.display()))?;
        let executor = Executor::new(config.interpreter(), policy.max_output_bytes());
        let audit = AuditLogger::open(&config.audit).context("Failed to open audit log")?;
        Ok(Self::new(policy, path_guard, executor, Arc::new(audit)))
    }

    #[must_use]
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    #[must_use]
    pub fn path_guard(&self) -> &PathGuard {
        &self.path_guard
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Handles one operation and audits it.
    ///
    /// # Errors
    ///
    /// Returns the [`GuardError`] for the failure class: unknown operation,
    /// malformed parameters, security rejection, timeout or execution
    /// failure.
    pub async fn handle(&self, request: OperationRequest) -> GuardResult<OperationResponse> {
        let Some(operation) = Operation::parse(&request.name) else {
            let err = GuardError::unknown_operation(&request.name);
            self.audit.log(AuditEntry::new(&request.name).with_error(&err));
            return Err(err);
        };
        let params = match ExecuteParams::from_map(&request.params) {
            Ok(params) => params,
            Err(err) => {
                self.audit.log(AuditEntry::new(&request.name).with_error(&err));
                return Err(err);
            }
        };
        match operation {
            Operation::Execute(mode) => self
                .execute(mode, &params)
                .await
                .map(OperationResponse::Execution),
            Operation::Validate(mode) => self
                .validate(mode, &params)
                .map(OperationResponse::Validation),
        }
    }

    /// Decodes a script read as raw bytes from a file or stdin.
    ///
    /// Bytes that are not UTF-8 are rejected with an `encoding` outcome
    /// and the attempt is audited under `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::SecurityViolation`] if `raw` is not UTF-8.
    pub fn decode_script(&self, operation: &str, raw: Vec<u8>) -> GuardResult<String> {
        String::from_utf8(raw).map_err(|e| {
            let outcome = ScriptValidator::new(&self.policy).validate_bytes(e.as_bytes());
            let err = GuardError::security_violation(self.rejected(ExecutionMode::Script, outcome));
            self.audit.log(
                AuditEntry::new(operation)
                    .with_command(String::from_utf8_lossy(e.as_bytes()))
                    .with_error(&err),
            );
            err
        })
    }

    /// Runs the pre-spawn checks without executing.
    ///
    /// A rejection is a successful call returning an invalid outcome; it is
    /// still audited as a security violation.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidParams`] for malformed parameters.
    pub fn validate(
        &self,
        mode: ExecutionMode,
        params: &ExecuteParams,
    ) -> GuardResult<ValidationOutcome> {
        let started = Instant::now();
        let kind = match mode {
            ExecutionMode::Command => "validate_command",
            ExecutionMode::Script => "validate_script",
        };
        let entry = self.base_entry(kind, params);
        let payload = match params.payload(mode) {
            Ok(payload) => payload,
            Err(err) => {
                self.audit.log(entry.with_error(&err));
                return Err(err);
            }
        };

        let (outcome, entry) = match self.admit(mode, payload, params) {
            Ok(request) => {
                let dir = request.working_directory.display().to_string();
                (ValidationOutcome::pass(), entry.with_working_directory(dir))
            }
            Err(outcome) => {
                let err = GuardError::security_violation(outcome.clone());
                (outcome, entry.with_error(&err))
            }
        };
        self.audit.log(
            entry
                .with_outcome(outcome.clone())
                .with_duration(started.elapsed()),
        );
        Ok(outcome)
    }

    /// Validates and runs a command or script.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::SecurityViolation`] without spawning when a
    /// check fails, [`GuardError::Timeout`] with partial output when the
    /// deadline passes, and [`GuardError::ExecutionFailed`] when the process
    /// cannot start or exits non-zero.
    pub async fn execute(
        &self,
        mode: ExecutionMode,
        params: &ExecuteParams,
    ) -> GuardResult<ExecutionResult> {
        let started = Instant::now();
        let entry = self.base_entry(mode.operation(), params);
        let payload = match params.payload(mode) {
            Ok(payload) => payload,
            Err(err) => {
                self.audit.log(entry.with_error(&err));
                return Err(err);
            }
        };

        let request = match self.admit(mode, payload, params) {
            Ok(request) => request,
            Err(outcome) => {
                let err = GuardError::security_violation(outcome);
                self.audit
                    .log(entry.with_error(&err).with_duration(started.elapsed()));
                return Err(err);
            }
        };
        let entry = entry
            .with_working_directory(request.working_directory.display().to_string())
            .with_outcome(ValidationOutcome::pass());

        let outcome = self.run(&request).await;
        let entry = entry.with_duration(started.elapsed());
        match &outcome {
            Ok(result) => self.audit.log(entry.with_result(result.clone())),
            Err(err) => self.audit.log(entry.with_error(err)),
        }
        outcome
    }

    /// Runs the validator, environment guard and path guard, in that order.
    fn admit(
        &self,
        mode: ExecutionMode,
        payload: &str,
        params: &ExecuteParams,
    ) -> Result<ExecutionRequest, ValidationOutcome> {
        let outcome = match mode {
            ExecutionMode::Command => {
                CommandValidator::new(&self.policy).validate(payload, params.allow_shell_access)
            }
            ExecutionMode::Script => ScriptValidator::new(&self.policy).validate(payload),
        };
        let outcome = if outcome.is_valid() {
            validate_environment(&params.environment_vars)
        } else {
            outcome
        };
        if !outcome.is_valid() {
            return Err(self.rejected(mode, outcome));
        }

        let working_directory: PathBuf = self
            .path_guard
            .resolve(params.working_directory.as_deref())
            .map_err(|outcome| self.rejected(mode, outcome))?;

        Ok(ExecutionRequest {
            command_or_script: payload.to_string(),
            mode,
            timeout: self.policy.effective_timeout(mode, params.timeout),
            working_directory,
            environment_overrides: params.environment_vars.clone(),
            allow_shell_access: params.allow_shell_access,
        })
    }

    fn rejected(&self, mode: ExecutionMode, outcome: ValidationOutcome) -> ValidationOutcome {
        warn!(
            mode = %mode,
            rule = %outcome.rule.map(|r| r.as_str()).unwrap_or("unknown"),
            pattern = outcome.pattern.as_deref().unwrap_or(""),
            line = outcome.line.unwrap_or(0),
            reason = outcome.reason.as_deref().unwrap_or(""),
            "Security violation: request rejected before execution"
        );
        outcome
    }

    async fn run(&self, request: &ExecutionRequest) -> GuardResult<ExecutionResult> {
        let mut result = self.executor.run(request).await?;
        if request.mode == ExecutionMode::Script {
            result.lines_executed = Some(split_statements(&request.command_or_script).len());
        }
        info!(
            mode = %request.mode,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_millis,
            "execution finished"
        );

        if result.timed_out {
            return Err(GuardError::timeout(
                request.timeout.as_millis() as u64,
                result,
            ));
        }
        if result.exit_code != 0 {
            return Err(GuardError::execution_failed(
                format!("process exited with code {}", result.exit_code),
                Some(result),
            ));
        }
        Ok(result)
    }

    fn base_entry(&self, kind: &str, params: &ExecuteParams) -> AuditEntry {
        let text = params
            .command
            .as_deref()
            .or(params.script.as_deref())
            .unwrap_or_default();
        let entry = AuditEntry::new(kind)
            .with_command(text)
            .with_environment(params.environment_vars.clone());
        match &params.working_directory {
            Some(dir) => entry.with_working_directory(dir.clone()),
            None => entry,
        }
    }
}
