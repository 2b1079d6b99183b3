use std::time::Duration;

use base64::Engine as _;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, error, info};
use ureq::{Agent as HttpAgent, Body, RequestBuilder, http::Response};

use super::types::{
    AgentConfigList, AgentList, CreateEnrollmentKey, DataStreamList, EnrollmentApiKey,
    EnrollmentKeyResponse, SetupRequest, SetupStatus,
};
use crate::config::KibanaConfig;

pub const FLEET_SETUP_PATH: &str = "/api/ingest_manager/fleet/setup";
pub const FLEET_AGENTS_PATH: &str = "/api/ingest_manager/fleet/agents";
pub const ENROLLMENT_KEYS_PATH: &str = "/api/ingest_manager/fleet/enrollment-api-keys";
pub const AGENT_CONFIGS_PATH: &str = "/api/ingest_manager/agent_configs";
pub const DATA_STREAMS_PATH: &str = "/api/ingest_manager/data_streams";

// Kibana rejects an URL-encoded query on this endpoint, so it is appended verbatim.
const AGENTS_QUERY: &str = "page=1&perPage=20&showInactive=true";

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{method} {url} failed: {source}")]
    Transport {
        method: &'static str,
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        body: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("Fleet is not ready: {0}")]
    NotReady(String),
    #[error("blocking Fleet call did not complete: {0}")]
    Join(String),
}

impl FleetError {
    /// Errors that may go away on their own while the stack converges.
    pub fn is_transient(&self) -> bool {
        match self {
            FleetError::Transport { .. } | FleetError::NotFound(_) | FleetError::NotReady(_) => {
                true
            }
            FleetError::Status { status, .. } => *status >= 500,
            FleetError::Decode { .. } | FleetError::Join(_) => false,
        }
    }
}

/// Blocking client for the Fleet management API exposed by Kibana.
///
/// Every request carries basic auth, a JSON content type and the `kbn-xsrf`
/// header. Async callers go through [`FleetClient::run_blocking`].
#[derive(Clone)]
pub struct FleetClient {
    base_url: String,
    authorization: String,
    xsrf_token: String,
    http: HttpAgent,
}

impl std::fmt::Debug for FleetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetClient")
            .field("base_url", &self.base_url)
            .field("xsrf_token", &self.xsrf_token)
            .finish_non_exhaustive()
    }
}

impl FleetClient {
    pub fn new(config: &KibanaConfig, timeout: Duration) -> Self {
        let credentials = format!("{}:{}", config.username, config.password);
        let authorization = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        );
        let http: HttpAgent = HttpAgent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            authorization,
            xsrf_token: config.xsrf_token.clone(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a blocking client call off the async executor.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T, FleetError>
    where
        T: Send + 'static,
        F: FnOnce(&FleetClient) -> Result<T, FleetError> + Send + 'static,
    {
        let client = self.clone();
        tokio::task::spawn_blocking(move || op(&client))
            .await
            .map_err(|err| FleetError::Join(err.to_string()))?
    }

    /// Force the recreation of the Fleet setup.
    pub fn setup(&self) -> Result<(), FleetError> {
        let body = self.post(
            FLEET_SETUP_PATH,
            &SetupRequest {
                force_recreate: true,
            },
        )?;
        debug!(response = %body, "Fleet setup done");
        Ok(())
    }

    pub fn setup_status(&self) -> Result<SetupStatus, FleetError> {
        let url = self.url(FLEET_SETUP_PATH);
        let body = self.get(&url)?;
        decode(&url, body)
    }

    /// Fails with [`FleetError::NotReady`] unless Fleet reports ready with no missing requirements.
    pub fn check_setup(&self) -> Result<SetupStatus, FleetError> {
        let status = self.setup_status()?;
        if !status.ready() {
            error!(?status, "Kibana has not been initialised for Fleet");
            return Err(FleetError::NotReady(format!(
                "isReady={} missing_requirements={:?}",
                status.is_ready, status.missing_requirements
            )));
        }
        info!("Kibana setup initialised");
        Ok(status)
    }

    pub fn agent_configs(&self) -> Result<AgentConfigList, FleetError> {
        let url = self.url(AGENT_CONFIGS_PATH);
        let body = self.get(&url)?;
        let configs: AgentConfigList = decode(&url, body)?;
        debug!(count = configs.items.len(), "Fleet configs retrieved");
        Ok(configs)
    }

    pub fn default_agent_config_id(&self) -> Result<String, FleetError> {
        let configs = self.agent_configs()?;
        let default = configs
            .items
            .iter()
            .find(|config| config.is_default == Some(true))
            .or_else(|| configs.items.first())
            .ok_or_else(|| FleetError::NotFound("no agent configs registered in Fleet".into()))?;
        Ok(default.id.clone())
    }

    pub fn create_enrollment_key(
        &self,
        name: &str,
        config_id: &str,
    ) -> Result<EnrollmentApiKey, FleetError> {
        let url = self.url(ENROLLMENT_KEYS_PATH);
        let body = self.post(ENROLLMENT_KEYS_PATH, &CreateEnrollmentKey { config_id, name })?;
        let response: EnrollmentKeyResponse = decode(&url, body)?;
        debug!(
            token_id = %response.item.id,
            api_key_id = %response.item.api_key_id,
            "Fleet token created"
        );
        Ok(response.item)
    }

    pub fn revoke_enrollment_key(&self, key_id: &str) -> Result<(), FleetError> {
        let url = self.url(&format!("{ENROLLMENT_KEYS_PATH}/{key_id}"));
        self.delete(&url)?;
        debug!(token_id = key_id, "enrollment token revoked");
        Ok(())
    }

    pub fn list_agents(&self) -> Result<AgentList, FleetError> {
        let url = format!("{}?{AGENTS_QUERY}", self.url(FLEET_AGENTS_PATH));
        let body = self.get(&url)?;
        let agents: AgentList = decode(&url, body)?;
        for agent in &agents.list {
            debug!(status = %agent.status, hostname = agent.hostname(), "agent status retrieved");
        }
        Ok(agents)
    }

    pub fn unenroll_agent(&self, agent_id: &str) -> Result<(), FleetError> {
        let path = format!("{FLEET_AGENTS_PATH}/{agent_id}/unenroll");
        self.post(&path, &serde_json::json!({}))?;
        debug!(agent_id, "Fleet agent was unenrolled");
        Ok(())
    }

    pub fn data_streams(&self) -> Result<DataStreamList, FleetError> {
        let url = self.url(DATA_STREAMS_PATH);
        let body = self.get(&url)?;
        let streams: DataStreamList = decode(&url, body)?;
        debug!(count = streams.data_streams.len(), "data streams retrieved");
        Ok(streams)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn decorate<B>(&self, request: RequestBuilder<B>) -> RequestBuilder<B> {
        request
            .header("Authorization", self.authorization.as_str())
            .header("Content-Type", "application/json")
            .header("kbn-xsrf", self.xsrf_token.as_str())
    }

    fn get(&self, url: &str) -> Result<String, FleetError> {
        let result = self.decorate(self.http.get(url)).call();
        read_body("GET", url, result)
    }

    fn post(&self, path: &str, payload: &impl Serialize) -> Result<String, FleetError> {
        let url = self.url(path);
        let result = self.decorate(self.http.post(&url)).send_json(payload);
        read_body("POST", &url, result)
    }

    fn delete(&self, url: &str) -> Result<String, FleetError> {
        let result = self.decorate(self.http.delete(url)).call();
        read_body("DELETE", url, result)
    }
}

fn read_body(
    method: &'static str,
    url: &str,
    result: Result<Response<Body>, ureq::Error>,
) -> Result<String, FleetError> {
    let transport = |source: ureq::Error| FleetError::Transport {
        method,
        url: url.to_string(),
        source: Box::new(source),
    };
    let mut response = result.map_err(transport)?;
    let status = response.status();
    let body = response.body_mut().read_to_string().map_err(transport)?;
    if !status.is_success() {
        error!(method, url, status = status.as_u16(), %body, "Fleet request failed");
        return Err(FleetError::Status {
            method,
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn decode<T: DeserializeOwned>(url: &str, body: String) -> Result<T, FleetError> {
    serde_json::from_str(&body).map_err(|source| {
        error!(url, %body, "could not parse response into JSON");
        FleetError::Decode {
            url: url.to_string(),
            body,
            source,
        }
    })
}

/// Online status of the agent running on `hostname`.
pub fn agent_status(agents: &AgentList, hostname: &str) -> Result<bool, FleetError> {
    agents
        .list
        .iter()
        .find(|agent| agent.hostname() == hostname)
        .map(|agent| agent.is_online())
        .ok_or_else(|| FleetError::NotFound(format!("the agent '{hostname}' was not found in Fleet")))
}

pub fn agent_id(agents: &AgentList, index: usize) -> Result<String, FleetError> {
    agents
        .list
        .get(index)
        .map(|agent| agent.id.clone())
        .ok_or_else(|| {
            FleetError::NotFound(format!(
                "no agent at index {index}; Fleet lists {} agent(s)",
                agents.list.len()
            ))
        })
}
