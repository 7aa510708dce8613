//! ATL Core - change-request pipeline
//!
//! Turns a natural-language change request into reviewed, sandbox-validated
//! code awaiting human sign-off:
//! - Drives each task through spec, implement, test, sandbox and review
//! - Bounds the review/implement revision loop
//! - Persists every transition and publishes it to per-task observers
//! - Publishes approved changes through a pluggable service
//!
//! # Example
//!
//! ```rust,ignore
//! use atl_core::{CreateTask, Orchestrator, PipelineConfig};
//!
//! # async fn example(executor: std::sync::Arc<dyn atl_core::StageExecutor>,
//! #                  sandbox: std::sync::Arc<dyn atl_sandbox::SandboxRunner>)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::builder(executor, sandbox)
//!     .config(PipelineConfig::new().with_max_iterations(3))
//!     .build()?;
//!
//! let id = orchestrator.create_task(CreateTask::new("Add a slugify helper")).await?;
//! let status = orchestrator.run_until_checkpoint(&id).await?;
//! println!("{id} is {status}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod record;
pub mod stage;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod worker_pool;

pub use config::PipelineConfig;
pub use error::{
    ConfigError, ExecutorError, OrchestratorError, PublishError, RetrievalError, StoreError,
};
pub use events::{ArtifactKind, EventBus, EventKind, Subscription, TaskEvent};
pub use orchestrator::{CreateTask, Orchestrator, OrchestratorBuilder};
pub use record::TaskRecord;
pub use stage::{
    ExternalRef, PublishRequest, PublishService, RetrievalService, Snippet, StageArtifact,
    StageContext, StageExecutor, StageKind,
};
pub use store::{FileTaskStore, InMemoryTaskStore, TaskStore};
pub use types::{
    Agent, AgentMessage, FileMap, PublishTarget, RepoContext, ReviewDecision, ReviewVerdict,
    SpecArtifact, Subtask, TaskId, TaskStatus,
};
pub use worker_pool::{PoolStats, WorkerPool};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving pipelines
    pub use crate::{
        CreateTask, Orchestrator, PipelineConfig, StageArtifact, StageContext, StageExecutor,
        StageKind, TaskId, TaskRecord, TaskStatus,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
