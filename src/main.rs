//! psguard - guarded PowerShell command and script execution

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use psguard::audit::verify_chain;
use psguard::error::GuardError;
use psguard::policy::ExecutionMode;
use psguard::service::{ExecuteParams, GuardService, OperationRequest};
use psguard::types::GuardConfig;

#[derive(Parser, Debug)]
#[command(name = "psguard")]
#[command(about = "Validate and run PowerShell commands and scripts under a security policy")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file
    #[arg(long, global = true, env = "PSGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Working-directory root (overrides the configuration)
    #[arg(long, global = true, env = "PSGUARD_ROOT")]
    root: Option<PathBuf>,

    /// Disable audit logging
    #[arg(long, global = true)]
    no_audit: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate and run a single command line
    Command {
        /// The command line
        #[arg(value_name = "COMMAND")]
        command: String,

        #[command(flatten)]
        run: RunArgs,

        /// Permit pipelines, redirection and separators
        #[arg(long)]
        allow_shell: bool,
    },

    /// Validate and run a script file ("-" reads stdin)
    Script {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Validate without running
    Check {
        /// The command line
        #[arg(value_name = "COMMAND", required_unless_present = "script")]
        command: Option<String>,

        /// Check a script file instead
        #[arg(long, value_name = "FILE", conflicts_with = "command")]
        script: Option<PathBuf>,

        /// Permit pipelines, redirection and separators
        #[arg(long)]
        allow_shell: bool,
    },

    /// Read one JSON operation {"name", "params"} from stdin
    Request,

    /// Verify the audit log hash chain
    VerifyAudit {
        /// Audit log (defaults to the configured path)
        path: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Timeout in seconds (clamped to the policy maximum)
    #[arg(long)]
    timeout: Option<f64>,

    /// Working directory, relative to the root
    #[arg(long, value_name = "DIR")]
    cwd: Option<String>,

    /// Environment override, repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

impl RunArgs {
    fn into_params(self) -> ExecuteParams {
        ExecuteParams {
            timeout: self.timeout,
            working_directory: self.cwd,
            environment_vars: self.env.into_iter().collect::<BTreeMap<_, _>>(),
            ..ExecuteParams::default()
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    // stdout carries results; diagnostics go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = GuardConfig::load_or_default(args.config.as_deref())?;
    if let Some(root) = args.root {
        config.execution.root = Some(root);
    }
    if args.no_audit {
        config.audit.enabled = false;
    }

    if let Command::VerifyAudit { path } = args.command {
        return verify_audit(path, &config);
    }

    let service = GuardService::from_config(&config)?;
    let outcome = match args.command {
        Command::Command {
            command,
            run,
            allow_shell,
        } => {
            let params = ExecuteParams {
                command: Some(command),
                allow_shell_access: allow_shell,
                ..run.into_params()
            };
            service
                .execute(ExecutionMode::Command, &params)
                .await
                .map(|r| print_json(&r))
        }
        Command::Script { file, run } => {
            match service.decode_script(ExecutionMode::Script.operation(), read_script(&file)?) {
                Ok(script) => {
                    let params = ExecuteParams {
                        script: Some(script),
                        ..run.into_params()
                    };
                    service
                        .execute(ExecutionMode::Script, &params)
                        .await
                        .map(|r| print_json(&r))
                }
                Err(err) => Err(err),
            }
        }
        Command::Check {
            command,
            script,
            allow_shell,
        } => {
            let request = match script {
                Some(file) => service
                    .decode_script("validate_script", read_script(&file)?)
                    .map(|script| {
                        (
                            ExecutionMode::Script,
                            ExecuteParams {
                                script: Some(script),
                                ..ExecuteParams::default()
                            },
                        )
                    }),
                None => Ok((
                    ExecutionMode::Command,
                    ExecuteParams {
                        command,
                        allow_shell_access: allow_shell,
                        ..ExecuteParams::default()
                    },
                )),
            };
            match request.and_then(|(mode, params)| service.validate(mode, &params)) {
                Ok(outcome) => {
                    print_json(&outcome);
                    if !outcome.is_valid() {
                        return Ok(ExitCode::FAILURE);
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        Command::Request => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read request from stdin")?;
            match serde_json::from_str::<OperationRequest>(&input) {
                Ok(request) => service.handle(request).await.map(|r| print_json(&r)),
                Err(e) => Err(GuardError::invalid_params(format!("malformed request: {e}"))),
            }
        }
        Command::VerifyAudit { .. } => unreachable!("handled before the service is built"),
    };

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            print_json(&json!({ "error": err.to_response() }));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!(error = %e, "failed to serialize output"),
    }
}

/// Reads script bytes; decoding is left to the service so it is audited.
fn read_script(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .context("Failed to read script from stdin")?;
        Ok(bytes)
    } else {
        std::fs::read(path).with_context(|| format!("Failed to read script {}", path.display()))
    }
}

fn verify_audit(path: Option<PathBuf>, config: &GuardConfig) -> Result<ExitCode> {
    let path = path
        .or_else(|| config.audit.resolved_path())
        .context("No audit log path configured")?;
    match verify_chain(&path) {
        Ok(summary) => {
            print_json(&json!({
                "path": path.display().to_string(),
                "entries": summary.entries,
                "lastHash": summary.last_hash,
                "intact": true,
            }));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&json!({
                "path": path.display().to_string(),
                "intact": false,
                "error": e.to_string(),
            }));
            Ok(ExitCode::FAILURE)
        }
    }
}
