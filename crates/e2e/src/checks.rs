//! Eventual-consistency checks built on [`poll_until`].

use std::path::Path;

use tracing::debug;

use crate::{
    fleet::{FleetClient, FleetError, SetupStatus, agent_status},
    metricbeat::{MetricsScan, scan_metrics_dir},
    poll::{BackoffPolicy, Outcome, PollError, PollReport, poll_until},
};

fn outcome_for<T>(err: FleetError) -> Outcome<T> {
    match err {
        FleetError::Transport { .. } => Outcome::transport(err),
        err if err.is_transient() => Outcome::retry(err.to_string()),
        err => Outcome::fatal(err.to_string()),
    }
}

/// Force the Fleet setup once, then wait until Kibana reports it ready.
///
/// Kibana answers with transport errors or 503s while it boots. The setup
/// request is only repeated while it has not been accepted; status checks
/// are repeated until ready.
pub async fn wait_for_fleet_setup(
    client: &FleetClient,
    policy: &BackoffPolicy,
) -> Result<PollReport<SetupStatus>, PollError> {
    poll_until("fleet setup request", policy, move || async move {
        match client.run_blocking(|c| c.setup()).await {
            Ok(()) => Outcome::Success(()),
            Err(err) => outcome_for(err),
        }
    })
    .await?;

    poll_until("fleet setup", policy, move || async move {
        match client.run_blocking(|c| c.check_setup()).await {
            Ok(status) => Outcome::Success(status),
            Err(err) => outcome_for(err),
        }
    })
    .await
}

/// Wait until the agent on `hostname` is listed as online (`online = true`)
/// or as anything but online (`online = false`).
pub async fn wait_for_agent_status(
    client: &FleetClient,
    hostname: &str,
    online: bool,
    policy: &BackoffPolicy,
) -> Result<PollReport<()>, PollError> {
    let label = if online {
        format!("agent {hostname} online")
    } else {
        format!("agent {hostname} offline")
    };
    poll_until(&label, policy, move || async move {
        let agents = match client.run_blocking(|c| c.list_agents()).await {
            Ok(agents) => agents,
            Err(err) => return outcome_for(err),
        };
        match agent_status(&agents, hostname) {
            Ok(active) if active == online => Outcome::Success(()),
            Ok(active) => {
                debug!(active, hostname, "agent status differs from the expected one");
                if online {
                    Outcome::retry("the agent is not online yet")
                } else {
                    Outcome::retry("the agent is still online")
                }
            }
            Err(err) => outcome_for(err),
        }
    })
    .await
}

/// Wait until Fleet reports at least one datastream and return how many there are.
pub async fn wait_for_data_streams(
    client: &FleetClient,
    policy: &BackoffPolicy,
) -> Result<PollReport<usize>, PollError> {
    poll_until("datastreams present", policy, move || async move {
        match client.run_blocking(|c| c.data_streams()).await {
            Ok(streams) if streams.data_streams.is_empty() => {
                Outcome::retry("there are no datastreams yet")
            }
            Ok(streams) => Outcome::Success(streams.data_streams.len()),
            Err(err) => outcome_for(err),
        }
    })
    .await
}

/// Wait until a metricbeat file output under `dir` (named `file_prefix*`)
/// holds at least one event of `module`, returning the matching event count.
///
/// A missing directory or file is retried; a corrupt event line is fatal.
pub async fn wait_for_metrics_file(
    dir: &Path,
    file_prefix: &str,
    module: &str,
    policy: &BackoffPolicy,
) -> Result<PollReport<usize>, PollError> {
    let label = format!("{module} metrics in {}", dir.join(file_prefix).display());
    poll_until(&label, policy, move || async move {
        if !dir.exists() {
            return Outcome::retry(format!("{} does not exist yet", dir.display()));
        }
        match scan_metrics_dir(dir, file_prefix, module) {
            Ok(MetricsScan { files: 0, .. }) => {
                Outcome::retry(format!("no {file_prefix}* output file yet"))
            }
            Ok(MetricsScan { matching: 0, events, .. }) => {
                Outcome::retry(format!("{events} event(s) written, none for {module}"))
            }
            Ok(scan) => Outcome::Success(scan.matching),
            Err(err) if err.is_corrupt() => Outcome::fatal(err.to_string()),
            Err(err) => Outcome::retry(err.to_string()),
        }
    })
    .await
}
