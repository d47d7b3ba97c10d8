//! Interpreter invocation.
//!
//! An [`Interpreter`] describes how to hand a command line or a script file
//! to the target shell. The default is PowerShell 7 (`pwsh`) without
//! profiles or interactive prompts.
//!
//! # Examples
//!
//! ```
//! use psguard::policy::ExecutionMode;
//! use psguard::shell::Interpreter;
//!
//! let pwsh = Interpreter::default();
//! assert_eq!(pwsh.program, "pwsh");
//! assert_eq!(
//!     pwsh.arguments(ExecutionMode::Command, "Get-Date"),
//!     vec!["-NoProfile", "-NonInteractive", "-Command", "Get-Date"],
//! );
//! ```

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::policy::ExecutionMode;

/// How to invoke the target interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[must_use]
pub struct Interpreter {
    /// The interpreter executable (e.g., "pwsh").
    pub program: String,
    /// Arguments placed before an inline command.
    pub command_args: Vec<String>,
    /// Arguments placed before a script file path.
    pub script_args: Vec<String>,
    /// Extension for temporary script files, without the dot.
    pub script_extension: String,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::powershell()
    }
}

impl Interpreter {
    /// PowerShell 7 with profiles and prompts disabled.
    pub fn powershell() -> Self {
        Self {
            program: "pwsh".to_string(),
            command_args: vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
            ],
            script_args: vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-File".to_string(),
            ],
            script_extension: "ps1".to_string(),
        }
    }

    /// POSIX `sh`, used where PowerShell is unavailable.
    pub fn posix_sh() -> Self {
        Self {
            program: "sh".to_string(),
            command_args: vec!["-c".to_string()],
            script_args: Vec::new(),
            script_extension: "sh".to_string(),
        }
    }

    /// Returns `true` if the program is a PowerShell host.
    #[must_use]
    pub fn is_powershell(&self) -> bool {
        let name = std::path::Path::new(&self.program)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        name == "pwsh" || name == "powershell"
    }

    /// Passes `-ExecutionPolicy Bypass` ahead of script file paths.
    ///
    /// Has no effect on interpreters other than PowerShell.
    pub fn with_execution_policy_bypass(mut self) -> Self {
        if self.is_powershell()
            && !self
                .script_args
                .iter()
                .any(|a| a.eq_ignore_ascii_case("-ExecutionPolicy"))
        {
            let at = self
                .script_args
                .iter()
                .position(|a| a.eq_ignore_ascii_case("-File"))
                .unwrap_or(self.script_args.len());
            self.script_args
                .splice(at..at, ["-ExecutionPolicy".to_string(), "Bypass".to_string()]);
        }
        self
    }

    /// Returns the full argument list for a payload.
    ///
    /// In command mode the payload is the command line; in script mode it
    /// is the path of the materialized script file.
    #[must_use]
    pub fn arguments(&self, mode: ExecutionMode, payload: &str) -> Vec<String> {
        let prefix = match mode {
            ExecutionMode::Command => &self.command_args,
            ExecutionMode::Script => &self.script_args,
        };
        prefix
            .iter()
            .cloned()
            .chain(std::iter::once(payload.to_string()))
            .collect()
    }

    /// Creates a `Command` for a payload, ready for further configuration.
    #[must_use]
    pub fn build_command(&self, mode: ExecutionMode, payload: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.arguments(mode, payload));
        cmd
    }
}
