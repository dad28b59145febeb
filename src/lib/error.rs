//! Error types, one enum per failure scope.
//!
//! Configuration errors exclude a single pipeline file, graph errors abort a
//! single pipeline run, and deployment errors are recorded on the job run that
//! triggered them. Step failures are not errors at all: they become job
//! statuses.

use std::path::PathBuf;

use thiserror::Error;

#[cfg(test)]
mod tests {
    use crate::error::{DeploymentError, GraphError, SecretError};

    #[test]
    fn cycle_names_every_job() {
        let e = GraphError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(e.to_string(), "cyclic dependency between jobs: a -> b -> a");
    }

    #[test]
    fn deployment_error_from_missing_secret() {
        let e: DeploymentError = SecretError::Missing {
            name: "VERCEL_TOKEN".into(),
        }
        .into();
        assert!(e.to_string().contains("VERCEL_TOKEN"));
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("could not parse runner config {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("pipeline \"{pipeline}\": invalid branch pattern \"{pattern}\" in trigger rule: {source}")]
    InvalidTrigger {
        pipeline: String,
        pattern: String,
        source: glob::PatternError,
    },

    #[error("pipeline \"{pipeline}\", job \"{job}\": invalid pattern \"{pattern}\": {source}")]
    InvalidPattern {
        pipeline: String,
        job: String,
        pattern: String,
        source: glob::PatternError,
    },

    #[error("pipeline \"{pipeline}\", job \"{job}\": \"{path}\" leaves the workspace")]
    EscapingPath {
        pipeline: String,
        job: String,
        path: String,
    },

    #[error("invalid pipelines directory pattern: {0}")]
    Directory(#[from] glob::PatternError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("job \"{job}\" is declared more than once")]
    DuplicateJob { job: String },

    #[error("job \"{job}\" depends on unknown job \"{dependency}\"")]
    UnknownJob { job: String, dependency: String },

    /// The cycle follows `depends_on` edges and ends on the job it started from.
    #[error("cyclic dependency between jobs: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("job \"{job}\" references unknown target \"{target}\"")]
    UnknownTarget { job: String, target: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret \"{name}\" is not defined")]
    Missing { name: String },
}

#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("could not reach {target}: {source}")]
    Transport {
        target: String,
        source: reqwest::Error,
    },

    #[error("{target} answered {status}: {body}")]
    Rejected {
        target: String,
        status: u16,
        body: String,
    },

    #[error("could not render message: {0}")]
    Template(#[from] handlebars::RenderError),
}

impl DeploymentError {
    /// Wraps a transport error, dropping the request URL: webhook URLs and
    /// service ids are credentials.
    pub(crate) fn transport(target: &str, source: reqwest::Error) -> Self {
        DeploymentError::Transport {
            target: target.to_string(),
            source: source.without_url(),
        }
    }
}
