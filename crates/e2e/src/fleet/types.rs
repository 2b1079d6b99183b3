//! Response and request payloads of the Fleet (ingest manager) API.
//!
//! Responses are decoded into these structs as soon as they arrive, so a
//! malformed body fails at the call site instead of at some later field
//! lookup.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupStatus {
    #[serde(rename = "isReady")]
    pub is_ready: bool,
    #[serde(default)]
    pub missing_requirements: Vec<String>,
}

impl SetupStatus {
    pub fn ready(&self) -> bool {
        self.is_ready && self.missing_requirements.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupRequest {
    #[serde(rename = "forceRecreate")]
    pub force_recreate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfigList {
    #[serde(default)]
    pub items: Vec<AgentConfigSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfigSummary {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_default: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateEnrollmentKey<'a> {
    pub config_id: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrollmentKeyResponse {
    pub item: EnrollmentApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrollmentApiKey {
    pub id: String,
    pub api_key: String,
    pub api_key_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config_id: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentList {
    #[serde(default)]
    pub list: Vec<Agent>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(rename = "perPage", default)]
    pub per_page: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub active: Option<bool>,
    pub local_metadata: LocalMetadata,
}

impl Agent {
    pub fn hostname(&self) -> &str {
        &self.local_metadata.host.hostname
    }

    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalMetadata {
    pub host: HostMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostMetadata {
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataStreamList {
    #[serde(default)]
    pub data_streams: Vec<DataStream>,
}

/// Only `index` is relied upon; the rest varies between stack versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataStream {
    pub index: String,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_status_requires_no_missing_requirements() {
        let ready: SetupStatus =
            serde_json::from_value(json!({"isReady": true, "missing_requirements": []}))
                .expect("decode");
        assert!(ready.ready());

        let missing: SetupStatus = serde_json::from_value(
            json!({"isReady": true, "missing_requirements": ["api_keys"]}),
        )
        .expect("decode");
        assert!(!missing.ready());
    }

    #[test]
    fn agent_list_decodes_nested_hostname() {
        let list: AgentList = serde_json::from_value(json!({
            "list": [{
                "id": "agent-1",
                "status": "ONLINE",
                "active": true,
                "local_metadata": {"host": {"hostname": "centos-box"}, "os": {"name": "CentOS"}}
            }],
            "total": 1,
            "page": 1,
            "perPage": 20
        }))
        .expect("decode");
        assert_eq!(list.list.len(), 1);
        assert_eq!(list.list[0].hostname(), "centos-box");
        assert!(list.list[0].is_online());
        assert_eq!(list.per_page, Some(20));
    }

    #[test]
    fn agent_without_hostname_is_rejected() {
        let err = serde_json::from_value::<AgentList>(json!({
            "list": [{"id": "a", "status": "online", "local_metadata": {"host": {}}}]
        }))
        .expect_err("hostname is required");
        assert!(err.to_string().contains("hostname"));
    }

    #[test]
    fn data_streams_keep_unknown_fields() {
        let list: DataStreamList = serde_json::from_value(json!({
            "data_streams": [{
                "index": "logs-system.syslog-default",
                "dataset": "system.syslog",
                "namespace": "default",
                "type": "logs",
                "package": "system",
                "last_activity": "2020-07-01T00:00:00Z"
            }]
        }))
        .expect("decode");
        let stream = &list.data_streams[0];
        assert_eq!(stream.kind.as_deref(), Some("logs"));
        assert!(stream.extra.contains_key("last_activity"));
    }
}
