//! Runs the pipelines an event selects, and the jobs of each pipeline.
//!
//! Every pipeline run is owned by one coordinator, the only place job
//! statuses change. Jobs execute as tasks of a [JoinSet] and report back
//! to it; a semaphore shared by every pipeline bounds how many run at once.
//! A job is gated exactly once, when the last of its dependencies reaches
//! a terminal status.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::conf::{PipelineDefinition, RunCondition, RunnerConfig};
use crate::error::GraphError;
use crate::event::Event;
use crate::executor::{Executor, JobSpec};
use crate::gating::{self, Upstream, Verdict};
use crate::graph::JobGraph;
use crate::notifications::{ActionPayload, Connector};
use crate::run::{JobRun, JobStatus, PipelineRun, RunStatus};
use crate::secrets::SecretStore;
use crate::trigger::{self, Pipeline};


#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
/// A selected pipeline whose job graph is invalid. None of its jobs ran.
pub struct RejectedPipeline {
    pub pipeline: String,
    pub error: String,
}

#[derive(Serialize, Debug, Clone)]
/// Everything one event caused
pub struct EventOutcome {
    pub event: Event,
    pub runs: Vec<PipelineRun>,
    pub rejected: Vec<RejectedPipeline>,
}

impl EventOutcome {
    /// True when no pipeline was rejected and every run succeeded.
    /// An event that selects nothing succeeds.
    pub fn succeeded(&self) -> bool {
        self.rejected.is_empty() && self.runs.iter().all(PipelineRun::succeeded)
    }
}

#[derive(Clone)]
/// Runs pipelines. Cheap to clone: clones share the concurrency bound.
pub struct Engine {
    executor: Arc<Executor>,
    connector: Connector,
    permits: Arc<Semaphore>,
}

impl Engine {
    pub fn new(config: &RunnerConfig, secrets: SecretStore) -> Self {
        Engine {
            executor: Arc::new(Executor::new(&config.artifacts_dir, secrets.clone())),
            connector: Connector::new(secrets),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        }
    }

    /// Jobs of this engine will run in a clone of `uri`
    pub fn with_repository(self, uri: impl Into<String>) -> Self {
        let executor = (*self.executor).clone().with_repository(uri);
        Engine {
            executor: Arc::new(executor),
            ..self
        }
    }

    /// Runs every pipeline `event` triggers, concurrently. Cancelling
    /// `cancel` cancels all of them.
    pub async fn run_event(
        &self,
        pipelines: &[Pipeline],
        event: &Event,
        cancel: &CancellationToken,
    ) -> EventOutcome {
        let selected = trigger::select(pipelines, event);
        if selected.is_empty() {
            info!("No pipeline is triggered by {}", event);
        } else {
            let names: Vec<&str> = selected.iter().map(|p| p.name()).collect();
            info!("{} triggers {}", event, names.join(", "));
        }
        let results = join_all(
            selected
                .iter()
                .map(|p| self.run_pipeline(p, event, cancel.child_token())),
        )
        .await;

        let mut outcome = EventOutcome {
            event: event.clone(),
            runs: vec![],
            rejected: vec![],
        };
        for (pipeline, result) in selected.iter().zip(results) {
            match result {
                Ok(run) => outcome.runs.push(run),
                Err(e) => outcome.rejected.push(RejectedPipeline {
                    pipeline: pipeline.name().to_string(),
                    error: e.to_string(),
                }),
            }
        }
        outcome
    }

    /// Validates the pipeline's job graph, then runs it to completion
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        event: &Event,
        cancel: CancellationToken,
    ) -> Result<PipelineRun, GraphError> {
        let graph = JobGraph::build(&pipeline.definition).map_err(|e| {
            error!("Pipeline \"{}\" rejected: {}", pipeline.name(), e);
            e
        })?;
        Ok(Coordinator::new(self, pipeline, graph, event, cancel)
            .run()
            .await)
    }
}

struct Shared {
    engine: Engine,
    definition: PipelineDefinition,
}

type Finished = (usize, JobRun);

struct Coordinator {
    shared: Arc<Shared>,
    graph: JobGraph,
    run: PipelineRun,
    /// Dependencies of each job not yet terminal
    waiting_on: Vec<usize>,
    resolved: usize,
    ready: VecDeque<usize>,
    cancel: CancellationToken,
    cancelled: bool,
}

impl Coordinator {
    fn new(
        engine: &Engine,
        pipeline: &Pipeline,
        graph: JobGraph,
        event: &Event,
        cancel: CancellationToken,
    ) -> Self {
        let jobs = graph
            .jobs()
            .iter()
            .map(|j| JobRun::new(&j.name, matches!(j.condition, RunCondition::Always)))
            .collect();
        let run = PipelineRun::new(pipeline.name(), event.clone(), jobs);
        let waiting_on = (0..graph.len()).map(|i| graph.upstream_of(i).len()).collect();
        Coordinator {
            shared: Arc::new(Shared {
                engine: engine.clone(),
                definition: pipeline.definition.clone(),
            }),
            graph,
            run,
            waiting_on,
            resolved: 0,
            ready: VecDeque::new(),
            cancel,
            cancelled: false,
        }
    }

    async fn run(mut self) -> PipelineRun {
        info!(
            "Starting pipeline \"{}\" (run {}) for {}",
            self.run.pipeline, self.run.id, self.run.event
        );
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<usize>();
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let cancel = self.cancel.clone();
        let roots: Vec<usize> = (0..self.graph.len())
            .filter(|&i| self.waiting_on[i] == 0)
            .collect();
        self.ready.extend(roots);

        loop {
            while let Some(i) = self.ready.pop_front() {
                self.gate(i, &mut tasks, &started_tx);
            }
            if self.resolved == self.graph.len() {
                break;
            }
            tokio::select! {
                biased;
                Some(i) = started_rx.recv() => self.mark_running(i),
                Some(joined) = tasks.join_next() => match joined {
                    Ok((i, job)) => self.complete(i, job),
                    Err(e) => error!("pipeline \"{}\": job task lost: {}", self.run.pipeline, e),
                },
                _ = cancel.cancelled(), if !self.cancelled => self.cancel_remaining(),
            }
        }
        // cancelled jobs still report what they got to do
        while let Some(joined) = tasks.join_next().await {
            if let Ok((i, job)) = joined {
                self.complete(i, job);
            }
        }

        self.run.ended_at = Some(chrono::Utc::now());
        match self.run.status() {
            RunStatus::Succeeded => info!("Pipeline \"{}\" succeeded", self.run.pipeline),
            status => warn!("Pipeline \"{}\" {}", self.run.pipeline, status),
        }
        self.run
    }

    fn gate(&mut self, i: usize, tasks: &mut JoinSet<Finished>, started: &UnboundedSender<usize>) {
        if self.run.jobs[i].status.is_terminal() {
            return;
        }
        let upstream = Upstream::new(self.graph.upstream_of(i).iter().map(|&u| {
            let job = &self.run.jobs[u];
            (job.job_name.clone(), job.status)
        }));
        let definition = &self.graph.jobs()[i];
        match gating::evaluate(&definition.condition, &upstream, &self.run.event) {
            Verdict::Skip(reason) => {
                info!("Skipping job \"{}\": {}", definition.name, reason);
                let job = &mut self.run.jobs[i];
                job.transition(JobStatus::Skipped);
                job.skip_reason = Some(reason);
                self.resolve(i);
            }
            Verdict::Run => {
                let spec = JobSpec {
                    pipeline: self.run.pipeline.clone(),
                    run_id: self.run.id.clone(),
                    event: self.run.event.clone(),
                    job: definition.clone(),
                    pipeline_env: self.shared.definition.env.clone(),
                    upstream_artifacts: self
                        .graph
                        .upstream_of(i)
                        .iter()
                        .flat_map(|&u| self.run.jobs[u].artifacts.iter().cloned())
                        .collect(),
                };
                let task = JobTask {
                    index: i,
                    spec,
                    upstream,
                    jobs: self
                        .run
                        .jobs
                        .iter()
                        .map(|j| (j.job_name.clone(), j.status))
                        .collect(),
                    shared: self.shared.clone(),
                    started: started.clone(),
                    cancel: self.cancel.child_token(),
                };
                tasks.spawn(task.run());
            }
        }
    }

    fn mark_running(&mut self, i: usize) {
        let job = &mut self.run.jobs[i];
        if job.status == JobStatus::Pending {
            job.transition(JobStatus::Running);
        }
    }

    fn complete(&mut self, i: usize, finished: JobRun) {
        let current = &mut self.run.jobs[i];
        if current.status.is_terminal() {
            // cancelled while running: the status stays
            current.logs = finished.logs;
            current.steps = finished.steps;
            current.ended_at = finished.ended_at.or(current.ended_at);
            return;
        }
        let started_at = current.started_at.or(finished.started_at);
        *current = JobRun {
            started_at,
            ..finished
        };
        self.resolve(i);
    }

    fn resolve(&mut self, i: usize) {
        self.resolved += 1;
        let job = &self.run.jobs[i];
        match job.status {
            JobStatus::Failed => error!("Job \"{}\" failed", job.job_name),
            status => info!("Job \"{}\" {}", job.job_name, status),
        }
        if self.cancelled {
            return;
        }
        for &d in self.graph.downstream_of(i) {
            self.waiting_on[d] -= 1;
            if self.waiting_on[d] == 0 {
                self.ready.push_back(d);
            }
        }
    }

    fn cancel_remaining(&mut self) {
        warn!("Cancelling pipeline \"{}\"", self.run.pipeline);
        self.cancelled = true;
        self.ready.clear();
        for job in self.run.jobs.iter_mut() {
            if !job.status.is_terminal() && job.transition(JobStatus::Cancelled) {
                self.resolved += 1;
            }
        }
    }
}

struct JobTask {
    index: usize,
    spec: JobSpec,
    upstream: Upstream,
    /// Statuses of every job of the run when this one was gated
    jobs: BTreeMap<String, JobStatus>,
    shared: Arc<Shared>,
    started: UnboundedSender<usize>,
    cancel: CancellationToken,
}

impl JobTask {
    async fn run(self) -> Finished {
        let index = self.index;
        let name = self.spec.job.name.clone();
        let always = matches!(self.spec.job.condition, RunCondition::Always);
        let job = AssertUnwindSafe(self.execute())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("job \"{}\" panicked", name);
                let mut job = JobRun::new(&name, always);
                job.transition(JobStatus::Running);
                job.logs.push("the job panicked".to_string());
                job.transition(JobStatus::Failed);
                job
            });
        (index, job)
    }

    async fn execute(self) -> JobRun {
        let engine = &self.shared.engine;
        let permit = tokio::select! {
            p = engine.permits.clone().acquire_owned() => p.ok(),
            _ = self.cancel.cancelled() => None,
        };
        let _permit = match permit {
            Some(p) => p,
            None => {
                let mut job = JobRun::new(
                    &self.spec.job.name,
                    matches!(self.spec.job.condition, RunCondition::Always),
                );
                job.transition(JobStatus::Cancelled);
                return job;
            }
        };
        let _ = self.started.send(self.index);
        info!(
            "Running job \"{}\" of pipeline \"{}\"",
            self.spec.job.name, self.spec.pipeline
        );
        let mut job = engine.executor.execute(&self.spec, &self.cancel).await;
        if job.status == JobStatus::Succeeded && !self.cancel.is_cancelled() {
            self.dispatch_actions(&mut job).await;
        }
        job
    }

    async fn dispatch_actions(&self, job: &mut JobRun) {
        if self.spec.job.actions.is_empty() {
            return;
        }
        let mut artifacts = self.spec.upstream_artifacts.clone();
        artifacts.extend(job.artifacts.iter().cloned());
        let mut jobs = self.jobs.clone();
        jobs.insert(job.job_name.clone(), job.status);
        let payload = ActionPayload {
            pipeline: self.spec.pipeline.clone(),
            run_id: self.spec.run_id.clone(),
            job: job.job_name.clone(),
            event: self.spec.event.kind,
            branch: self.spec.event.branch.clone(),
            commit: self.spec.event.commit.clone(),
            status: self.upstream.aggregate(),
            artifacts,
            jobs,
        };
        for name in &self.spec.job.actions {
            match self.shared.definition.targets.get(name) {
                Some(target) => {
                    let record = self
                        .shared
                        .engine
                        .connector
                        .dispatch(name, target, &payload)
                        .await;
                    job.deployments.push(record);
                }
                None => error!("job \"{}\": no target named \"{}\"", job.job_name, name),
            }
        }
    }
}
