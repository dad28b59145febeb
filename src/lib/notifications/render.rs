use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DeploymentError;
use crate::notifications::{base_url, check, ActionPayload, Connector, Notify};


const RENDER_API: &str = "https://api.render.com";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
/// Triggers a deploy of a Render service. Credentials are secret names.
pub struct RenderDeploy {
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_service_id")]
    pub service_id: String,
    #[serde(default)]
    pub clear_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_api_key() -> String {
    "RENDER_API_KEY".to_string()
}

fn default_service_id() -> String {
    "RENDER_BACKEND_SERVICE_ID".to_string()
}

impl Default for RenderDeploy {
    fn default() -> Self {
        RenderDeploy {
            api_key: default_api_key(),
            service_id: default_service_id(),
            clear_cache: false,
            base_url: None,
        }
    }
}

#[async_trait]
impl Notify for RenderDeploy {
    async fn send(
        &self,
        connector: &Connector,
        _payload: &ActionPayload,
    ) -> Result<String, DeploymentError> {
        let key = connector.secrets.resolve(&self.api_key)?;
        let service = connector.secrets.resolve(&self.service_id)?;
        let url = format!(
            "{}/v1/services/{}/deploys",
            base_url(&self.base_url, RENDER_API),
            service.expose()
        );
        let body = json!({
            "clearCache": if self.clear_cache { "clear" } else { "do_not_clear" },
        });
        let response = connector
            .client
            .post(url)
            .bearer_auth(key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeploymentError::transport("render", e))?;
        let response = check("render", response).await?;
        let created: Value = response.json().await.unwrap_or_default();
        Ok(match created.get("id").and_then(Value::as_str) {
            Some(id) => format!("deploy {} created", id),
            None => "deploy triggered".to_string(),
        })
    }
}
