//! psguard - guarded PowerShell command and script execution
//!
//! Untrusted command lines and scripts pass through a fixed pipeline before
//! anything runs:
//!
//! 1. [`validator`] checks length, characters, the ordered rule table and the
//!    base-command allow-list.
//! 2. [`guard`] screens environment overrides and confines the working
//!    directory to the configured root.
//! 3. [`executor`] runs the interpreter under a deadline and captures its
//!    output.
//! 4. [`audit`] appends a hash-chained record of the attempt, whatever the
//!    outcome.
//!
//! [`service::GuardService`] wires the stages together.
//!
//! # Limitations
//!
//! Validation is lexical. It matches patterns and extracts base commands
//! without parsing PowerShell, so obfuscated or string-assembled
//! invocations can evade it. It provides no OS-level isolation.

pub mod audit;
pub mod error;
pub mod executor;
pub mod guard;
pub mod policy;
pub mod sanitize;
pub mod service;
pub mod shell;
pub mod types;
pub mod validator;

pub use error::{GuardError, GuardResult};
pub use policy::SecurityPolicy;
pub use service::GuardService;
pub use types::GuardConfig;
