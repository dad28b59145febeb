use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::DeploymentError;
use crate::notifications::{check, ActionPayload, Connector, Notify};
use crate::summary::render_message;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::notifications::slack::SlackNotifier;
    use crate::notifications::tests::{connector, payload};
    use crate::notifications::Notify;

    #[tokio::test]
    async fn posts_rendered_text() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/services/T000/B000/XXX")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "channel": "#deploys",
                "text": "shopsmart@main: succeeded"
            })))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;
        let url = format!("{}/services/T000/B000/XXX", server.url());
        let c = connector(&[("SLACK_WEBHOOK_URL", url.as_str())]);
        let target = SlackNotifier {
            webhook_url: "SLACK_WEBHOOK_URL".into(),
            channel: Some("#deploys".into()),
            template: Some("{{pipeline}}@{{branch}}: {{status}}".into()),
        };
        assert_eq!(target.send(&c, &payload()).await.unwrap(), "message posted");
        m.assert_async().await;
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
/// Posts a message to a Slack incoming webhook
pub struct SlackNotifier {
    #[serde(default = "default_webhook_url")]
    /// Secret holding the webhook URL
    pub webhook_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Handlebars template rendered against the action payload
    pub template: Option<String>,
}

fn default_webhook_url() -> String {
    "SLACK_WEBHOOK_URL".to_string()
}

#[async_trait]
impl Notify for SlackNotifier {
    async fn send(
        &self,
        connector: &Connector,
        payload: &ActionPayload,
    ) -> Result<String, DeploymentError> {
        let url = connector.secrets.resolve(&self.webhook_url)?;
        let mut body = json!({ "text": render_message(self.template.as_deref(), payload)? });
        if let Some(channel) = &self.channel {
            body["channel"] = json!(channel);
        }
        let response = connector
            .client
            .post(url.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeploymentError::transport("slack", e))?;
        check("slack", response).await?;
        Ok("message posted".to_string())
    }
}
