//! Runs one job: its steps, in order, in a fresh workspace.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::artifacts;
use crate::conf::{Env, JobDefinition, RunCondition, Step};
use crate::event::Event;
use crate::run::{ArtifactRef, JobRun, JobStatus, StepResult};
use crate::secrets::{Redactor, Secret, SecretStore};
use crate::utils::{docker, git};

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use crate::conf::JobDefinition;
    use crate::event::Event;
    use crate::executor::{is_commit_hash, Executor, JobSpec};
    use crate::run::JobStatus;
    use crate::secrets::SecretStore;

    fn job(yaml: &str) -> JobDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn spec(job: JobDefinition) -> JobSpec {
        JobSpec {
            pipeline: "p".into(),
            run_id: "run-1".into(),
            event: Event::push("main", "HEAD"),
            job,
            pipeline_env: HashMap::new(),
            upstream_artifacts: vec![],
        }
    }

    fn executor(sink: &TempDir) -> Executor {
        let mut secrets = HashMap::new();
        secrets.insert("NPM_TOKEN".to_string(), "npm_s3cr3t".to_string());
        Executor::new(sink.path(), SecretStore::from_map(secrets))
    }

    #[tokio::test]
    async fn steps_run_in_order_in_one_workspace() {
        let _ = pretty_env_logger::try_init();
        let sink = TempDir::new().unwrap();
        let j = job("name: build
env:
  GREETING: hello
steps:
  - run: echo $GREETING > out.txt
  - name: append
    run: echo $WHO >> out.txt
    env:
      WHO: world
  - run: cat out.txt
artifacts: [out.txt]");
        let run = executor(&sink)
            .execute(&spec(j), &CancellationToken::new())
            .await;
        assert_eq!(run.status, JobStatus::Succeeded);
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.steps[1].name, "append");
        assert!(run.logs.iter().any(|l| l == "world"));
        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(
            std::fs::read_to_string(sink.path().join("run-1/build/out.txt")).unwrap(),
            "hello\nworld\n"
        );
    }

    #[tokio::test]
    async fn failing_step_halts_the_job() {
        let sink = TempDir::new().unwrap();
        let j = job("name: tests
steps:
  - run: exit 3
  - run: echo unreachable");
        let run = executor(&sink)
            .execute(&spec(j), &CancellationToken::new())
            .await;
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].exit_code, Some(3));
        assert!(!run.logs.iter().any(|l| l == "unreachable"));
    }

    #[tokio::test]
    async fn tolerated_failure_continues() {
        let sink = TempDir::new().unwrap();
        let j = job("name: tests
steps:
  - name: audit
    run: 'false'
    continue_on_failure: true
  - run: echo after");
        let run = executor(&sink)
            .execute(&spec(j), &CancellationToken::new())
            .await;
        assert_eq!(run.status, JobStatus::Succeeded);
        assert!(run.steps[0].tolerated);
        assert!(!run.steps[0].success);
        assert!(run.logs.iter().any(|l| l == "after"));
    }

    #[tokio::test]
    async fn secrets_are_injected_and_redacted() {
        let sink = TempDir::new().unwrap();
        let j = job("name: publish
secrets: [NPM_TOKEN]
steps:
  - run: echo token=$NPM_TOKEN");
        let run = executor(&sink)
            .execute(&spec(j), &CancellationToken::new())
            .await;
        assert_eq!(run.status, JobStatus::Succeeded);
        assert!(run.logs.iter().any(|l| l == "token=***"));
        assert!(!run.logs.iter().any(|l| l.contains("npm_s3cr3t")));
    }

    #[tokio::test]
    async fn missing_secret_fails_the_job() {
        let sink = TempDir::new().unwrap();
        let j = job("name: deploy
secrets: [VERCEL_TOKEN]
steps:
  - run: 'true'");
        let run = executor(&sink)
            .execute(&spec(j), &CancellationToken::new())
            .await;
        assert_eq!(run.status, JobStatus::Failed);
        assert!(run.steps.is_empty());
    }

    #[tokio::test]
    async fn timeout_is_a_step_failure() {
        let sink = TempDir::new().unwrap();
        let j = job("name: slow
steps:
  - run: sleep 5
    timeout: 1");
        let run = executor(&sink)
            .execute(&spec(j), &CancellationToken::new())
            .await;
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.steps[0].exit_code, None);
    }

    #[tokio::test]
    async fn cancellation_kills_the_running_step() {
        let sink = TempDir::new().unwrap();
        let j = job("name: slow
steps:
  - run: sleep 10");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let run = executor(&sink).execute(&spec(j), &cancel).await;
        assert_eq!(run.status, JobStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn commit_hashes() {
        assert!(is_commit_hash("c0ffee1"));
        assert!(is_commit_hash("17af6fe1acfcf453025c8f221fdcf8842acbb38b"));
        assert!(!is_commit_hash("HEAD"));
        assert!(!is_commit_hash("abc"));
    }
}

#[derive(Debug, Clone)]
/// Everything a job needs to run, owned so it can move into a task
pub struct JobSpec {
    pub pipeline: String,
    pub run_id: String,
    pub event: Event,
    pub job: JobDefinition,
    pub pipeline_env: Env,
    /// Artifacts of the job's direct dependencies, copied into its workspace
    pub upstream_artifacts: Vec<ArtifactRef>,
}

#[derive(Debug, Clone)]
pub struct Executor {
    artifacts_dir: PathBuf,
    secrets: SecretStore,
    repository: Option<String>,
}

enum StepOutcome {
    Exited(Output),
    TimedOut(u64),
    Cancelled,
    NotStarted(io::Error),
}

pub(crate) fn is_commit_hash(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Executor {
    pub fn new(artifacts_dir: &Path, secrets: SecretStore) -> Self {
        Executor {
            artifacts_dir: artifacts_dir.to_path_buf(),
            secrets,
            repository: None,
        }
    }

    /// Clone `uri` into every workspace, at the event's branch
    pub fn with_repository(mut self, uri: impl Into<String>) -> Self {
        self.repository = Some(uri.into());
        self
    }

    /// Runs the job to a terminal status. Never fails: setup errors fail the job.
    pub async fn execute(&self, spec: &JobSpec, cancel: &CancellationToken) -> JobRun {
        let mut run = JobRun::new(
            &spec.job.name,
            matches!(spec.job.condition, RunCondition::Always),
        );
        run.transition(JobStatus::Running);
        let status = match self.execute_in_workspace(spec, &mut run, cancel).await {
            Ok(status) => status,
            Err(e) => {
                error!("job \"{}\" could not run: {:#}", spec.job.name, e);
                run.logs.push(format!("job could not run: {:#}", e));
                JobStatus::Failed
            }
        };
        run.transition(status);
        run
    }

    async fn execute_in_workspace(
        &self,
        spec: &JobSpec,
        run: &mut JobRun,
        cancel: &CancellationToken,
    ) -> Result<JobStatus> {
        let job = &spec.job;
        let workspace = tempfile::Builder::new().prefix("relayci-").tempdir()?;
        debug!("job \"{}\": workspace {}", job.name, workspace.path().display());
        if let Some(repo) = &self.repository {
            git::clone_branch(repo, &spec.event.branch, workspace.path()).await?;
            if is_commit_hash(&spec.event.commit) {
                git::checkout(workspace.path(), &spec.event.commit).await?;
            }
        }
        artifacts::restore(&spec.upstream_artifacts, workspace.path())?;

        let secrets = job
            .secrets
            .iter()
            .map(|name| self.secrets.resolve(name).map(|s| (name.clone(), s)))
            .collect::<Result<Vec<(String, Secret)>, _>>()?;
        let redactor = Redactor::new(
            &secrets.iter().map(|(_, s)| s.clone()).collect::<Vec<_>>(),
        );
        let mut env = spec.pipeline_env.clone();
        env.extend(job.env.clone());
        let container = job
            .image
            .as_ref()
            .map(|_| docker::container_name(&spec.pipeline, &job.name));

        for (index, step) in job.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(JobStatus::Cancelled);
            }
            let name = step.display_name(index);
            info!(" Running step \"{}\" of job \"{}\"", name, job.name);
            run.logs.push(format!("==> {}: {}", name, redactor.redact(&step.run)));

            let mut step_env = env.clone();
            step_env.extend(step.env.clone());
            for (k, v) in &secrets {
                step_env.insert(k.clone(), v.expose().to_string());
            }

            let start = Instant::now();
            let outcome = self
                .run_step(job, step, workspace.path(), &step_env, container.as_deref(), cancel)
                .await;
            let mut result = StepResult {
                name: name.clone(),
                command: redactor.redact(&step.run),
                exit_code: None,
                success: false,
                tolerated: false,
                duration_ms: 0,
            };
            let cancelled = matches!(outcome, StepOutcome::Cancelled);
            let killed = cancelled || matches!(outcome, StepOutcome::TimedOut(_));
            match outcome {
                StepOutcome::Exited(output) => {
                    capture(&output.stdout, "stdout", &redactor, &mut run.logs);
                    capture(&output.stderr, "stderr", &redactor, &mut run.logs);
                    result.exit_code = output.status.code();
                    result.success = output.status.success();
                }
                StepOutcome::TimedOut(secs) => {
                    run.logs.push(format!("step \"{}\" timed out after {}s", name, secs));
                }
                StepOutcome::NotStarted(e) => {
                    run.logs.push(format!("step \"{}\" could not start: {}", name, e));
                }
                StepOutcome::Cancelled => {
                    run.logs.push(format!("step \"{}\" cancelled", name));
                }
            }
            result.duration_ms = start.elapsed().as_millis() as u64;
            if killed {
                if let Some(c) = &container {
                    let _ = docker::docker_remove_container(c).await;
                }
            }
            if cancelled {
                run.steps.push(result);
                return Ok(JobStatus::Cancelled);
            }
            if !result.success {
                if step.continue_on_failure {
                    warn!(
                        "Step \"{}\" of job \"{}\" failed, continuing",
                        name, job.name
                    );
                    result.tolerated = true;
                } else {
                    error!(
                        "Step \"{}\" of job \"{}\" returned execution failure! aborting next steps",
                        name, job.name
                    );
                    run.steps.push(result);
                    return Ok(JobStatus::Failed);
                }
            }
            run.steps.push(result);
        }

        if !job.artifacts.is_empty() {
            let sink = self.artifacts_dir.join(&spec.run_id).join(&job.name);
            run.artifacts = artifacts::collect(&job.name, workspace.path(), &job.artifacts, &sink)?;
        }
        Ok(JobStatus::Succeeded)
    }

    async fn run_step(
        &self,
        job: &JobDefinition,
        step: &Step,
        workspace: &Path,
        env: &Env,
        container: Option<&str>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let mut cmd = match (&job.image, container) {
            (Some(image), Some(name)) => docker::run_command(image, name, workspace, env, &step.run),
            _ => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(&step.run).current_dir(workspace).envs(env);
                c
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return StepOutcome::NotStarted(e),
        };
        let wait = child.wait_with_output();
        let bounded = async {
            match step.timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait)
                    .await
                    .map_err(|_| secs),
                None => Ok(wait.await),
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => StepOutcome::Cancelled,
            r = bounded => match r {
                Ok(Ok(output)) => StepOutcome::Exited(output),
                Ok(Err(e)) => StepOutcome::NotStarted(e),
                Err(secs) => StepOutcome::TimedOut(secs),
            },
        }
    }
}

fn capture(raw: &[u8], stream: &str, redactor: &Redactor, logs: &mut Vec<String>) {
    if raw.is_empty() {
        return;
    }
    for l in String::from_utf8_lossy(raw).lines() {
        let l = redactor.redact(l);
        debug!("    {}: {}", stream, l);
        logs.push(l);
    }
}
