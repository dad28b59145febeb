/// Defines what makes for a valid configuration
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::EventKind;
use crate::notifications::Target;
use crate::trigger::Pipeline;


/// Environment variables, by name
pub type Env = HashMap<String, String>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// Represents an entire pipeline file
pub struct PipelineDefinition {
    /// Unique pipeline name
    pub name: String,
    #[serde(default, rename = "on")]
    /// Which events start this pipeline. No rule means it never triggers.
    pub triggers: Vec<TriggerRule>,
    #[serde(default)]
    /// Environment shared by every job. Extended by jobs' and steps' envs
    pub env: Env,
    /// Jobs, in declaration order
    pub jobs: Vec<JobDefinition>,
    #[serde(default)]
    /// Deployment and notification targets, referenced by jobs' `actions`
    pub targets: BTreeMap<String, Target>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// Represents a trigger rule. Serializes to:
/// ```yaml
/// event: push
/// branches: [main, "release/*"]  # globs. Empty means any branch
/// ```
pub struct TriggerRule {
    pub event: EventKind,
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// Represents a Job. Serializes to:
/// ```yaml
/// name: deploy
/// depends_on: [build]
/// if: { upstream: success, branches: [main] }  # or `success` (default), or `always`
/// image: node:20     # optional, steps run on the host otherwise
/// env:
///   NODE_ENV: production
/// secrets:
///   - NPM_TOKEN      # resolved at execution time, injected as env and redacted from logs
/// steps:
///   - run: npm run build
/// artifacts: ["dist/**"]
/// actions: [vercel-frontend]
/// ```
pub struct JobDefinition {
    /// The job's name
    pub name: String,
    #[serde(default)]
    /// Jobs which must reach a terminal status before this one is gated
    pub depends_on: Vec<String>,
    #[serde(default)]
    /// Steps, executed in order
    pub steps: Vec<Step>,
    #[serde(default, rename = "if")]
    pub condition: RunCondition,
    #[serde(default)]
    pub env: Env,
    #[serde(default)]
    /// Secret names to expose to the steps
    pub secrets: Vec<String>,
    /// An optional docker image to run the steps in
    pub image: Option<String>,
    #[serde(default)]
    /// Globs, relative to the workspace, collected when the job succeeds
    pub artifacts: Vec<String>,
    #[serde(default)]
    /// Target names invoked once the job succeeds
    pub actions: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// a [job](JobDefinition) step. Serializes to the following:
/// ```yaml
/// name: audit              # Optional, defaults to the step's position
/// run: npm audit --audit-level=high
/// continue_on_failure: true
/// timeout: 300             # seconds
/// ```
pub struct Step {
    pub name: Option<String>,
    /// A shell command, run with `sh -c`
    pub run: String,
    #[serde(default)]
    pub env: Env,
    #[serde(default)]
    /// Report a failure without failing the job
    pub continue_on_failure: bool,
    pub timeout: Option<u64>,
}

impl Step {
    /// The step's name, or its 1-based position when it has none
    pub fn display_name(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| (index + 1).to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(try_from = "RawRunCondition", into = "RawRunCondition")]
/// When a job runs, once all its dependencies are terminal
pub enum RunCondition {
    #[default]
    /// Only if every dependency succeeded
    Success,
    /// Whatever happened upstream. Used by notification jobs
    Always,
    Custom(Predicate),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawRunCondition {
    Keyword(String),
    Custom(Predicate),
}

impl TryFrom<RawRunCondition> for RunCondition {
    type Error = String;

    fn try_from(raw: RawRunCondition) -> Result<Self, Self::Error> {
        match raw {
            RawRunCondition::Keyword(k) => match k.as_str() {
                "success" => Ok(RunCondition::Success),
                "always" => Ok(RunCondition::Always),
                other => Err(format!(
                    "unknown run condition \"{}\", expected success, always or a predicate",
                    other
                )),
            },
            RawRunCondition::Custom(p) => Ok(RunCondition::Custom(p)),
        }
    }
}

impl From<RunCondition> for RawRunCondition {
    fn from(c: RunCondition) -> Self {
        match c {
            RunCondition::Success => RawRunCondition::Keyword("success".to_string()),
            RunCondition::Always => RawRunCondition::Keyword("always".to_string()),
            RunCondition::Custom(p) => RawRunCondition::Custom(p),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
/// A custom run condition. Every part must hold for the job to run.
pub struct Predicate {
    #[serde(default)]
    pub upstream: UpstreamRequirement,
    #[serde(default)]
    /// Branch globs. Empty means any branch
    pub branches: Vec<String>,
    #[serde(default)]
    /// Event kinds. Empty means any event
    pub events: Vec<EventKind>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamRequirement {
    #[default]
    /// Every dependency succeeded
    Success,
    /// At least one dependency failed or was cancelled
    Failure,
    /// Any terminal outcome
    Any,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// The runner's own configuration, usually `relay-ci.toml`
pub struct RunnerConfig {
    #[serde(default = "default_pipelines_dir")]
    /// Directory holding one pipeline per `.yml`/`.yaml` file
    pub pipelines_dir: PathBuf,
    #[serde(default = "default_max_concurrency")]
    /// How many jobs may run at once, across all pipelines
    pub max_concurrency: usize,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_watch_interval")]
    /// Seconds between two polls in watch mode
    pub watch_interval: u64,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A repository polled in watch mode
pub struct RepositoryConfig {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    /// Branch globs to watch. Empty means every branch
    pub branches: Vec<String>,
    /// Where to persist the last seen heads
    pub state_file: Option<PathBuf>,
}

fn default_pipelines_dir() -> PathBuf {
    PathBuf::from(".relay-ci")
}

fn default_max_concurrency() -> usize {
    4
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_watch_interval() -> u64 {
    60
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            pipelines_dir: default_pipelines_dir(),
            max_concurrency: default_max_concurrency(),
            artifacts_dir: default_artifacts_dir(),
            watch_interval: default_watch_interval(),
            repositories: vec![],
        }
    }
}

impl RunnerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&s).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// The `.yml` and `.yaml` files of `dir`, sorted
pub fn pipeline_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for ext in ["yml", "yaml"] {
        let pattern = dir.join(format!("*.{}", ext));
        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => files.extend(paths.filter_map(|p| p.ok())),
            Err(e) => error!("{}", ConfigError::from(e)),
        }
    }
    files.sort();
    files
}

/// Reads and validates a single pipeline file
pub fn load_pipeline(path: &Path) -> Result<Pipeline, ConfigError> {
    let s = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let definition: PipelineDefinition =
        serde_yaml::from_str(&s).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
    Pipeline::compile(definition)
}

/// Loads every pipeline file in `dir`. A file that fails to load is logged and
/// left out; it never prevents the others from loading.
pub fn load_pipelines(dir: &Path) -> Vec<Pipeline> {
    let mut pipelines = Vec::new();
    for file in pipeline_files(dir) {
        debug!("loading pipeline file {}", file.display());
        match load_pipeline(&file) {
            Ok(p) => {
                info!("Loaded pipeline \"{}\" from {}", p.name(), file.display());
                pipelines.push(p);
            }
            Err(e) => error!("Excluding {}: {}", file.display(), e),
        }
    }
    pipelines
}
