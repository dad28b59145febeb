use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::error::DeploymentError;
use crate::event::EventKind;
use crate::run::{ArtifactRef, DeploymentRecord, JobStatus, RunStatus};
use crate::secrets::SecretStore;

use self::render::RenderDeploy;
use self::slack::SlackNotifier;
use self::vercel::VercelDeploy;
use self::webhook::ReportWebhook;

/// Render service deploys
pub mod render;
/// Slack incoming webhooks
pub mod slack;
/// Vercel deployments
pub mod vercel;
/// Generic JSON webhooks, for report sinks
pub mod webhook;


#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
/// Represents all possible deploy and notification targets
pub enum Target {
    Render(RenderDeploy),
    Vercel(VercelDeploy),
    Slack(SlackNotifier),
    Webhook(ReportWebhook),
}

impl Target {
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Render(_) => "render",
            Target::Vercel(_) => "vercel",
            Target::Slack(_) => "slack",
            Target::Webhook(_) => "webhook",
        }
    }

    /// Performs the outbound call, whatever the variant of Target it is
    pub async fn send(
        &self,
        connector: &Connector,
        payload: &ActionPayload,
    ) -> Result<String, DeploymentError> {
        match self {
            Target::Render(t) => t.send(connector, payload).await,
            Target::Vercel(t) => t.send(connector, payload).await,
            Target::Slack(t) => t.send(connector, payload).await,
            Target::Webhook(t) => t.send(connector, payload).await,
        }
    }
}

/// Defines a [Target], who can communicate build results to the outside world.
/// Returns a short, secret-free description of what happened.
#[async_trait]
pub trait Notify {
    async fn send(
        &self,
        connector: &Connector,
        payload: &ActionPayload,
    ) -> Result<String, DeploymentError>;
}

#[derive(Serialize, Debug, Clone)]
/// What a deploy/notify action is told about the run
pub struct ActionPayload {
    pub pipeline: String,
    pub run_id: String,
    /// The job invoking the action
    pub job: String,
    pub event: EventKind,
    pub branch: String,
    pub commit: String,
    /// Aggregated status of the job's dependencies
    pub status: RunStatus,
    /// Artifacts of the job and of its dependencies
    pub artifacts: Vec<ArtifactRef>,
    /// Every job's status when the action job started
    pub jobs: BTreeMap<String, JobStatus>,
}

#[derive(Clone, Debug)]
/// Shared HTTP client and secret store for all targets
pub struct Connector {
    pub(crate) client: reqwest::Client,
    pub(crate) secrets: SecretStore,
}

impl Connector {
    pub fn new(secrets: SecretStore) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relay-ci/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Connector { client, secrets }
    }

    /// Invokes `target` once. Failures are logged and recorded, never returned.
    pub async fn dispatch(
        &self,
        name: &str,
        target: &Target,
        payload: &ActionPayload,
    ) -> DeploymentRecord {
        info!(
            "job \"{}\": invoking {} target \"{}\"",
            payload.job,
            target.kind(),
            name
        );
        let sent = AssertUnwindSafe(target.send(self, payload))
            .catch_unwind()
            .await;
        let (success, detail) = match sent {
            Ok(Ok(detail)) => {
                info!("target \"{}\": {}", name, detail);
                (true, detail)
            }
            Ok(Err(e)) => {
                error!("target \"{}\" failed: {}", name, e);
                (false, e.to_string())
            }
            Err(_) => {
                error!("target \"{}\" panicked", name);
                (false, format!("{} target panicked", target.kind()))
            }
        };
        DeploymentRecord {
            target: name.to_string(),
            kind: target.kind().to_string(),
            success,
            detail,
        }
    }
}

/// Turns a non-2xx answer into [DeploymentError::Rejected]
pub(crate) async fn check(
    target: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, DeploymentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();
    Err(DeploymentError::Rejected {
        target: target.to_string(),
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn base_url<'a>(configured: &'a Option<String>, default: &'a str) -> &'a str {
    configured
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
}
