//! Job and pipeline run records.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::warn;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::event::Event;


#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Cancelled counts as failed for gating
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Outcome of a set of jobs, never stored, always derived
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub name: String,
    pub command: String,
    /// None when the step was killed, timed out or could not start
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Failed, but `continue_on_failure` was set
    pub tolerated: bool,
    pub duration_ms: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
/// A file a job left in the artifact sink
pub struct ArtifactRef {
    pub job: String,
    /// Path relative to the job's workspace
    pub relative: PathBuf,
    /// Where it lives in the sink
    pub path: PathBuf,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
/// Outcome of one deploy/notify call. Never affects the job's own status.
pub struct DeploymentRecord {
    pub target: String,
    pub kind: String,
    pub success: bool,
    pub detail: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct JobRun {
    pub job_name: String,
    pub status: JobStatus,
    pub logs: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<ArtifactRef>,
    pub deployments: Vec<DeploymentRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Runs whatever happens upstream, and does not count toward the overall status
    pub always: bool,
}

impl JobRun {
    pub fn new(job_name: &str, always: bool) -> Self {
        JobRun {
            job_name: job_name.to_string(),
            status: JobStatus::Pending,
            logs: vec![],
            started_at: None,
            ended_at: None,
            steps: vec![],
            artifacts: vec![],
            deployments: vec![],
            skip_reason: None,
            always,
        }
    }

    /// Moves to `to` if allowed: pending → running | skipped | cancelled,
    /// running → any terminal status. Terminal statuses never change.
    pub fn transition(&mut self, to: JobStatus) -> bool {
        let allowed = match (self.status, to) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Skipped | JobStatus::Cancelled) => true,
            (JobStatus::Running, s) => s.is_terminal(),
            _ => false,
        };
        if !allowed {
            warn!(
                "job \"{}\": refusing transition {} -> {}",
                self.job_name, self.status, to
            );
            return false;
        }
        let now = Utc::now();
        if to == JobStatus::Running {
            self.started_at = Some(now);
        } else {
            self.ended_at = Some(now);
        }
        self.status = to;
        true
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(s), Some(e)) => Some((e - s).num_seconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline: String,
    pub event: Event,
    /// One entry per job, in declaration order
    pub jobs: Vec<JobRun>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(pipeline: &str, event: Event, jobs: Vec<JobRun>) -> Self {
        let started_at = Utc::now();
        PipelineRun {
            id: format!(
                "{}-{}",
                started_at.format("%Y%m%d%H%M%S"),
                crate::utils::random_suffix(6)
            ),
            pipeline: pipeline.to_string(),
            event,
            jobs,
            started_at,
            ended_at: None,
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobRun> {
        self.jobs.iter().find(|j| j.job_name == name)
    }

    /// Cancelled if anything was cancelled, failed if any job that is not
    /// an `always` job failed, succeeded otherwise.
    pub fn status(&self) -> RunStatus {
        if self.jobs.iter().any(|j| j.status == JobStatus::Cancelled) {
            RunStatus::Cancelled
        } else if self
            .jobs
            .iter()
            .any(|j| !j.always && j.status == JobStatus::Failed)
        {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status() == RunStatus::Succeeded
    }
}

// The overall status is derived, so it is written out alongside the jobs
impl Serialize for PipelineRun {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("PipelineRun", 7)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("pipeline", &self.pipeline)?;
        s.serialize_field("event", &self.event)?;
        s.serialize_field("status", &self.status())?;
        s.serialize_field("jobs", &self.jobs)?;
        s.serialize_field("started_at", &self.started_at)?;
        s.serialize_field("ended_at", &self.ended_at)?;
        s.end()
    }
}
