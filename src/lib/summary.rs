//! Human readable reports: the end-of-run summary and notification messages.

use handlebars::{handlebars_helper, Handlebars, RenderError};
use serde::Serialize;

use crate::notifications::ActionPayload;
use crate::run::{DeploymentRecord, JobRun, PipelineRun};
use crate::scheduler::{EventOutcome, RejectedPipeline};

#[cfg(test)]
mod tests {
    use log::debug;
    use pretty_assertions::assert_eq;

    use crate::event::Event;
    use crate::run::{DeploymentRecord, JobRun, JobStatus, PipelineRun, StepResult};
    use crate::scheduler::{EventOutcome, RejectedPipeline};
    use crate::summary::{render_message, render_summary};

    fn outcome() -> EventOutcome {
        let event = Event::push("main", "c0ffee");
        let mut tests = JobRun::new("backend-tests", false);
        tests.transition(JobStatus::Running);
        tests.steps.push(StepResult {
            name: "audit".into(),
            command: "npm audit".into(),
            exit_code: Some(1),
            success: false,
            tolerated: true,
            duration_ms: 10,
        });
        tests.transition(JobStatus::Succeeded);
        let mut deploy = JobRun::new("deploy", false);
        deploy.transition(JobStatus::Running);
        deploy.deployments.push(DeploymentRecord {
            target: "render-backend".into(),
            kind: "render".into(),
            success: false,
            detail: "render answered 503: down".into(),
        });
        deploy.transition(JobStatus::Succeeded);
        let mut notify = JobRun::new("notify", true);
        notify.transition(JobStatus::Skipped);
        notify.skip_reason = Some("dependency \"deploy\" failed".into());
        EventOutcome {
            event: event.clone(),
            runs: vec![PipelineRun::new("shopsmart", event, vec![tests, deploy, notify])],
            rejected: vec![RejectedPipeline {
                pipeline: "cyclic".into(),
                error: "cyclic dependency between jobs: a -> b -> a".into(),
            }],
        }
    }

    #[test]
    fn summary_lists_every_job() {
        let _ = pretty_env_logger::try_init();
        let s = render_summary(&outcome()).unwrap();
        debug!("rendered summary:\n{}", s);
        assert!(s.contains("Pipeline \"shopsmart\""));
        assert!(s.contains("SUCCEEDED"));
        assert!(s.contains("backend-tests [succeeded]"));
        assert!(s.contains("step \"audit\" failed (tolerated)"));
        assert!(s.contains("render-backend (render): FAILED render answered 503: down"));
        assert!(s.contains("notify [skipped] (dependency \"deploy\" failed)"));
        assert!(s.contains("Pipeline \"cyclic\" rejected: cyclic dependency between jobs: a -> b -> a"));
    }

    #[test]
    fn default_message() {
        let p = crate::notifications::tests::payload();
        let s = render_message(None, &p).unwrap();
        assert!(s.starts_with("shopsmart on main (c0ffee): SUCCEEDED"));
        assert!(s.contains("build: succeeded"));
    }

    #[test]
    fn custom_message_is_not_escaped() {
        let p = crate::notifications::tests::payload();
        let s = render_message(Some("<{{job}}> & {{upper status}}"), &p).unwrap();
        assert_eq!(s, "<deploy> & SUCCEEDED");
    }
}

const SUMMARY_TEMPLATE: &str = include_str!("../../resources/templates/summary.txt.hbs");
const MESSAGE_TEMPLATE: &str = include_str!("../../resources/templates/message.txt.hbs");

#[derive(Serialize)]
struct SummaryView<'a> {
    runs: Vec<RunView<'a>>,
    rejected: &'a [RejectedPipeline],
}

#[derive(Serialize)]
struct RunView<'a> {
    id: &'a str,
    pipeline: &'a str,
    event: String,
    status: String,
    jobs: Vec<JobView<'a>>,
}

#[derive(Serialize)]
struct JobView<'a> {
    name: &'a str,
    status: String,
    duration: Option<String>,
    reason: Option<&'a str>,
    tolerated: Vec<&'a str>,
    deployments: &'a [DeploymentRecord],
}

impl<'a> From<&'a PipelineRun> for RunView<'a> {
    fn from(run: &'a PipelineRun) -> Self {
        RunView {
            id: &run.id,
            pipeline: &run.pipeline,
            event: run.event.to_string(),
            status: run.status().to_string(),
            jobs: run.jobs.iter().map(JobView::from).collect(),
        }
    }
}

impl<'a> From<&'a JobRun> for JobView<'a> {
    fn from(job: &'a JobRun) -> Self {
        JobView {
            name: &job.job_name,
            status: job.status.to_string(),
            duration: job.duration_secs().map(|s| format!("{}s", s)),
            reason: job.skip_reason.as_deref(),
            tolerated: job
                .steps
                .iter()
                .filter(|s| s.tolerated)
                .map(|s| s.name.as_str())
                .collect(),
            deployments: &job.deployments,
        }
    }
}

fn registry() -> Handlebars<'static> {
    let mut reg = Handlebars::new();
    reg.register_escape_fn(handlebars::no_escape);
    handlebars_helper!(upper: |s: str| s.to_uppercase());
    handlebars_helper!(mark: |status: str| {
        match status {
            "succeeded" => "+",
            "failed" | "cancelled" => "x",
            "skipped" => "-",
            _ => "?",
        }
    });
    reg.register_helper("upper", Box::new(upper));
    reg.register_helper("mark", Box::new(mark));
    reg
}

/// Per-job and overall status of every pipeline an event ran
pub fn render_summary(outcome: &EventOutcome) -> Result<String, RenderError> {
    let view = SummaryView {
        runs: outcome.runs.iter().map(RunView::from).collect(),
        rejected: &outcome.rejected,
    };
    registry().render_template(SUMMARY_TEMPLATE, &view)
}

/// Renders a notification message, with the default template unless one is given
pub fn render_message(template: Option<&str>, payload: &ActionPayload) -> Result<String, RenderError> {
    registry().render_template(template.unwrap_or(MESSAGE_TEMPLATE), payload)
}
