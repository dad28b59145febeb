//! relay-ci: a small, declarative CI/CD pipeline runner.
//!
//! An [`Event`] selects pipelines through their trigger rules, each selected
//! pipeline is turned into a validated [`JobGraph`], and the [`Engine`] runs
//! the graph's jobs in parallel, gating every job on the outcome of its
//! dependencies before deploying or notifying through the configured targets.

pub mod artifacts;
pub mod conf;
pub mod error;
pub mod event;
pub mod executor;
pub mod gating;
pub mod graph;
pub mod notifications;
pub mod run;
pub mod scheduler;
pub mod secrets;
pub mod summary;
pub mod trigger;
pub mod utils;
pub mod watch;

pub use conf::{Env, JobDefinition, PipelineDefinition, RunCondition, RunnerConfig, Step};
pub use error::{ConfigError, DeploymentError, GraphError, SecretError};
pub use event::{Event, EventKind};
pub use graph::JobGraph;
pub use run::{JobRun, JobStatus, PipelineRun, RunStatus};
pub use scheduler::{Engine, EventOutcome};
pub use secrets::SecretStore;
pub use trigger::Pipeline;
