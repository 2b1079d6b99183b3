use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

pub const DEFAULT_CONFIG_ID: &str = "config-default";

/// Knobs shaping how quickly the simulated stack converges.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub username: String,
    pub password: String,
    /// Agent list queries an enrolled agent stays offline for.
    pub online_after_polls: u32,
    /// Datastream queries answered with an empty list.
    pub data_streams_after_polls: u32,
    pub setup_ready: bool,
    /// Setup status checks answered "not ready" after each forced setup.
    pub setup_checks_before_ready: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            username: "elastic".into(),
            password: "changeme".into(),
            online_after_polls: 2,
            data_streams_after_polls: 2,
            setup_ready: false,
            setup_checks_before_ready: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimKey {
    pub id: String,
    pub api_key: String,
    pub api_key_id: String,
    pub name: String,
    pub config_id: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimAgent {
    pub id: String,
    pub hostname: String,
    pub polls_until_online: u32,
    pub unenrolled: bool,
}

impl SimAgent {
    pub fn status(&self) -> &'static str {
        if self.unenrolled {
            "inactive"
        } else if self.polls_until_online == 0 {
            "online"
        } else {
            "offline"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollError {
    UnknownKey,
    RevokedKey,
}

#[derive(Debug, Default)]
struct Inner {
    ready: bool,
    setup_requests: u32,
    pending_setup_checks: u32,
    keys: BTreeMap<String, SimKey>,
    agents: Vec<SimAgent>,
    data_stream_queries: u32,
    agent_queries: u32,
}

/// Shared in-memory state of the simulator; cheap to clone.
#[derive(Debug, Clone)]
pub struct FleetState {
    config: Arc<SimConfig>,
    inner: Arc<Mutex<Inner>>,
}

impl Default for FleetState {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl FleetState {
    pub fn new(config: SimConfig) -> Self {
        let inner = Inner {
            ready: config.setup_ready,
            ..Inner::default()
        };
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.lock().ready = ready;
    }

    /// Forced setup: recreates the Fleet configuration and restarts the
    /// readiness countdown.
    pub fn force_setup(&self) {
        let mut inner = self.inner.lock();
        inner.setup_requests += 1;
        inner.ready = true;
        inner.pending_setup_checks = self.config.setup_checks_before_ready;
    }

    pub fn setup_requests(&self) -> u32 {
        self.inner.lock().setup_requests
    }

    pub fn setup_json(&self) -> Value {
        let ready = {
            let mut inner = self.inner.lock();
            if inner.ready && inner.pending_setup_checks > 0 {
                inner.pending_setup_checks -= 1;
                false
            } else {
                inner.ready
            }
        };
        let missing: Vec<&str> = if ready { vec![] } else { vec!["fleet_setup"] };
        json!({"isReady": ready, "missing_requirements": missing})
    }

    pub fn create_key(&self, name: &str, config_id: &str) -> SimKey {
        let key = SimKey {
            id: Uuid::new_v4().to_string(),
            api_key: Uuid::new_v4().simple().to_string(),
            api_key_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            config_id: config_id.to_string(),
            active: true,
        };
        self.inner.lock().keys.insert(key.id.clone(), key.clone());
        key
    }

    pub fn key(&self, id: &str) -> Option<SimKey> {
        self.inner.lock().keys.get(id).cloned()
    }

    /// Returns `false` when no key has that id.
    pub fn revoke_key(&self, id: &str) -> bool {
        match self.inner.lock().keys.get_mut(id) {
            Some(key) => {
                key.active = false;
                true
            }
            None => false,
        }
    }

    /// What an agent on `hostname` running `elastic-agent enroll` with
    /// `api_key` would cause. Re-enrolling a host resets its agent.
    pub fn enroll(&self, hostname: &str, api_key: &str) -> Result<String, EnrollError> {
        let mut inner = self.inner.lock();
        let key = inner
            .keys
            .values()
            .find(|key| key.api_key == api_key)
            .ok_or(EnrollError::UnknownKey)?;
        if !key.active {
            return Err(EnrollError::RevokedKey);
        }
        let polls = self.config.online_after_polls;
        if let Some(agent) = inner.agents.iter_mut().find(|a| a.hostname == hostname) {
            agent.polls_until_online = polls;
            agent.unenrolled = false;
            return Ok(agent.id.clone());
        }
        let agent = SimAgent {
            id: Uuid::new_v4().to_string(),
            hostname: hostname.to_string(),
            polls_until_online: polls,
            unenrolled: false,
        };
        let id = agent.id.clone();
        inner.agents.push(agent);
        Ok(id)
    }

    pub fn agent(&self, hostname: &str) -> Option<SimAgent> {
        self.inner
            .lock()
            .agents
            .iter()
            .find(|agent| agent.hostname == hostname)
            .cloned()
    }

    /// Returns `false` when no agent has that id.
    pub fn unenroll(&self, id: &str) -> bool {
        match self.inner.lock().agents.iter_mut().find(|a| a.id == id) {
            Some(agent) => {
                agent.unenrolled = true;
                true
            }
            None => false,
        }
    }

    /// One agent list query: every enrolled agent moves a poll closer to online.
    pub fn poll_agents(&self) -> Value {
        let mut inner = self.inner.lock();
        inner.agent_queries += 1;
        for agent in inner.agents.iter_mut().filter(|a| !a.unenrolled) {
            agent.polls_until_online = agent.polls_until_online.saturating_sub(1);
        }
        let list: Vec<Value> = inner
            .agents
            .iter()
            .map(|agent| {
                json!({
                    "id": agent.id,
                    "status": agent.status(),
                    "active": !agent.unenrolled,
                    "local_metadata": {"host": {"hostname": agent.hostname}},
                })
            })
            .collect();
        json!({"list": list, "total": inner.agents.len(), "page": 1, "perPage": 20})
    }

    pub fn agent_queries(&self) -> u32 {
        self.inner.lock().agent_queries
    }

    pub fn poll_data_streams(&self) -> Value {
        let mut inner = self.inner.lock();
        inner.data_stream_queries += 1;
        if inner.data_stream_queries <= self.config.data_streams_after_polls {
            return json!({"data_streams": []});
        }
        let streams: Vec<Value> = ["system.cpu", "system.memory", "system.syslog"]
            .iter()
            .map(|dataset| {
                let kind = if dataset.ends_with("syslog") { "logs" } else { "metrics" };
                json!({
                    "index": format!("{kind}-{dataset}-default"),
                    "dataset": dataset,
                    "namespace": "default",
                    "type": kind,
                    "package": "system",
                })
            })
            .collect();
        json!({"data_streams": streams})
    }
}
