use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeploymentError;
use crate::notifications::{check, ActionPayload, Connector, Notify};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::notifications::tests::{connector, payload};
    use crate::notifications::webhook::ReportWebhook;
    use crate::notifications::Notify;

    #[tokio::test]
    async fn posts_the_payload() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/upload")
            .match_header("authorization", "Bearer cov")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "pipeline": "shopsmart",
                "status": "succeeded",
                "jobs": {"build": "succeeded"}
            })))
            .with_status(202)
            .create_async()
            .await;
        let target = ReportWebhook {
            url: format!("{}/upload", server.url()),
            token: Some("CODECOV_TOKEN".into()),
        };
        let detail = target
            .send(&connector(&[("CODECOV_TOKEN", "cov")]), &payload())
            .await
            .unwrap();
        assert_eq!(detail, "report accepted (HTTP 202)");
        m.assert_async().await;
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
/// Posts the action payload as JSON, e.g. to a coverage or report service
pub struct ReportWebhook {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Secret holding a bearer token
    pub token: Option<String>,
}

#[async_trait]
impl Notify for ReportWebhook {
    async fn send(
        &self,
        connector: &Connector,
        payload: &ActionPayload,
    ) -> Result<String, DeploymentError> {
        let mut request = connector.client.post(&self.url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(connector.secrets.resolve(token)?.expose());
        }
        let response = request
            .send()
            .await
            .map_err(|e| DeploymentError::transport("webhook", e))?;
        let response = check("webhook", response).await?;
        Ok(format!(
            "report accepted (HTTP {})",
            response.status().as_u16()
        ))
    }
}
