use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DeploymentError;
use crate::notifications::{base_url, check, ActionPayload, Connector, Notify};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::notifications::tests::{connector, payload};
    use crate::notifications::vercel::VercelDeploy;
    use crate::notifications::Notify;

    #[tokio::test]
    async fn production_deploy_on_main() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/v13/deployments")
            .match_query(mockito::Matcher::UrlEncoded(
                "teamId".into(),
                "team_1".into(),
            ))
            .match_header("authorization", "Bearer vc_token")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "project": "prj_9",
                "target": "production",
                "meta": {"githubCommitRef": "main", "githubCommitSha": "c0ffee"}
            })))
            .with_status(200)
            .with_body(r#"{"id": "dpl_1", "url": "shopsmart.vercel.app"}"#)
            .create_async()
            .await;
        let c = connector(&[
            ("VERCEL_TOKEN", "vc_token"),
            ("VERCEL_PROJECT_ID", "prj_9"),
            ("VERCEL_ORG_ID", "team_1"),
        ]);
        let target = VercelDeploy {
            base_url: Some(server.url()),
            ..Default::default()
        };
        let detail = target.send(&c, &payload()).await.unwrap();
        assert_eq!(detail, "deployment dpl_1 at https://shopsmart.vercel.app");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn missing_token_fails_before_calling() {
        let target = VercelDeploy {
            base_url: Some("http://127.0.0.1:9".into()),
            ..Default::default()
        };
        let e = target.send(&connector(&[]), &payload()).await.unwrap_err();
        assert!(e.to_string().contains("VERCEL_TOKEN"));
    }
}

const VERCEL_API: &str = "https://api.vercel.com";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
/// Creates a Vercel deployment. Credentials are secret names.
pub struct VercelDeploy {
    #[serde(default = "default_token")]
    pub token: String,
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_org_id")]
    pub org_id: String,
    #[serde(default = "default_production_branch")]
    /// Deploys from this branch target production, others are previews
    pub production_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_token() -> String {
    "VERCEL_TOKEN".to_string()
}

fn default_project_id() -> String {
    "VERCEL_PROJECT_ID".to_string()
}

fn default_org_id() -> String {
    "VERCEL_ORG_ID".to_string()
}

fn default_production_branch() -> String {
    "main".to_string()
}

impl Default for VercelDeploy {
    fn default() -> Self {
        VercelDeploy {
            token: default_token(),
            project_id: default_project_id(),
            org_id: default_org_id(),
            production_branch: default_production_branch(),
            base_url: None,
        }
    }
}

#[async_trait]
impl Notify for VercelDeploy {
    async fn send(
        &self,
        connector: &Connector,
        payload: &ActionPayload,
    ) -> Result<String, DeploymentError> {
        let token = connector.secrets.resolve(&self.token)?;
        let project = connector.secrets.resolve(&self.project_id)?;
        let org = connector.secrets.resolve(&self.org_id)?;
        let url = format!("{}/v13/deployments", base_url(&self.base_url, VERCEL_API));
        let mut body = json!({
            "name": project.expose(),
            "project": project.expose(),
            "meta": {
                "githubCommitRef": payload.branch,
                "githubCommitSha": payload.commit,
                "relayciPipeline": payload.pipeline,
                "relayciRun": payload.run_id,
            },
        });
        if payload.branch == self.production_branch {
            body["target"] = json!("production");
        }
        let response = connector
            .client
            .post(url)
            .query(&[("teamId", org.expose())])
            .bearer_auth(token.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeploymentError::transport("vercel", e))?;
        let response = check("vercel", response).await?;
        let created: Value = response.json().await.unwrap_or_default();
        let id = created.get("id").and_then(Value::as_str).unwrap_or("?");
        Ok(match created.get("url").and_then(Value::as_str) {
            Some(u) => format!("deployment {} at https://{}", id, u),
            None => format!("deployment {} created", id),
        })
    }
}
