//! ATL Sandbox - isolated execution of untrusted code
//!
//! Runs a snapshot of machine-generated code and tests in an ephemeral,
//! resource-capped environment and reports raw facts back:
//! - Exit status, bounded stdout/stderr, wall time
//! - Whether the run was killed, and why (timeout or resource ceiling)
//! - Test counts when the runner printed a recognizable summary
//!
//! # Example
//!
//! ```rust,ignore
//! use atl_sandbox::{EngineConfig, ProcessBackend, SandboxEngine, SandboxRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), atl_sandbox::SandboxError> {
//! let engine = SandboxEngine::new(
//!     Arc::new(ProcessBackend::bubblewrap()),
//!     EngineConfig::default(),
//! );
//! let request = SandboxRequest::default().with_command("echo hello");
//! let result = engine.execute(request).await?;
//! println!("{}", result.headline());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

mod capture;
pub mod engine;
pub mod error;
pub mod isolation;
pub mod summary;
pub mod types;
mod workspace;

pub use engine::{EngineHealth, SandboxEngine, SandboxRunner};
pub use error::SandboxError;
pub use isolation::{
    shell_quote, Confinement, ContainerBackend, ProcessBackend, RunSpec, SandboxBackend,
};
pub use summary::TestSummary;
pub use types::{
    CapturedOutput, EngineConfig, FileMap, KillReason, ResourceLimits, SandboxRequest,
    SandboxResult,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
