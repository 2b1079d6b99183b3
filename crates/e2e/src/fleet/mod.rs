//! Fleet (ingest manager) management API: typed payloads and a blocking client.

pub mod client;
pub mod types;

pub use client::{FleetClient, FleetError, agent_id, agent_status};
pub use types::{Agent, AgentList, DataStream, DataStreamList, EnrollmentApiKey, SetupStatus};
