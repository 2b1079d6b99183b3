use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use elastic_e2e::{
    checks::{wait_for_agent_status, wait_for_data_streams},
    config::{SuiteConfig, load_config},
    fleet::FleetClient,
    logging::init_tracing,
    metricbeat,
    poll::BackoffPolicy,
    services::{ServiceError, ServiceManager, ServiceSpec, docker_available},
};

#[derive(Parser, Debug)]
#[command(
    name = "elastic-e2e",
    version,
    about = "Fleet and metricbeat end-to-end harness CLI"
)]
struct Cli {
    /// Path to the configuration file (defaults to $E2E_CONFIG, then config/e2e.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<Utf8PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Talk to the Fleet management API
    Fleet {
        #[command(subcommand)]
        command: FleetCommand,
    },
    /// Start and stop compose services
    Services {
        #[command(subcommand)]
        command: ServicesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum FleetCommand {
    /// Force the Fleet setup and check it is ready
    Setup,
    /// List enrolled agents
    Agents,
    /// Wait until an agent is (or is not) listed as online
    Wait(WaitArgs),
    /// List datastreams, optionally waiting for the first one
    DataStreams(DataStreamsArgs),
    /// Revoke an enrollment token
    RevokeToken(RevokeTokenArgs),
}

#[derive(Args, Debug)]
struct WaitArgs {
    #[arg(long)]
    hostname: String,
    /// Wait for the agent to stop being online instead
    #[arg(long, default_value_t = false)]
    offline: bool,
    /// Overrides polling.timeout_ms
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct DataStreamsArgs {
    #[arg(long, default_value_t = false)]
    wait: bool,
}

#[derive(Args, Debug)]
struct RevokeTokenArgs {
    #[arg(long)]
    id: String,
}

#[derive(Subcommand, Debug)]
enum ServicesCommand {
    /// Start a service from compose/services/<name>
    Up(ServiceUpArgs),
    /// Stop a service and remove its volumes
    Down(ServiceDownArgs),
}

#[derive(Args, Debug)]
struct ServiceUpArgs {
    name: String,
    #[arg(long)]
    version: String,
}

#[derive(Args, Debug)]
struct ServiceDownArgs {
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Fleet { command } => handle_fleet(command, &config).await?,
        Command::Services { command } => handle_services(command, &config)?,
    }

    Ok(())
}

async fn handle_fleet(cmd: FleetCommand, config: &SuiteConfig) -> Result<()> {
    let client = FleetClient::new(&config.kibana, config.request_timeout());
    match cmd {
        FleetCommand::Setup => {
            let status = client
                .run_blocking(|c| {
                    c.setup()?;
                    c.check_setup()
                })
                .await?;
            println!("Fleet is ready (isReady={})", status.is_ready);
        }
        FleetCommand::Agents => {
            let agents = client.run_blocking(|c| c.list_agents()).await?;
            println!("{} agent(s):", agents.list.len());
            for agent in &agents.list {
                println!("  {}  {:<10} {}", agent.id, agent.status, agent.hostname());
            }
        }
        FleetCommand::Wait(args) => {
            let policy = wait_policy(config, args.timeout_secs)?;
            let report =
                wait_for_agent_status(&client, &args.hostname, !args.offline, &policy).await?;
            info!(
                hostname = %args.hostname,
                attempts = report.attempts,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "agent reached the expected status"
            );
        }
        FleetCommand::DataStreams(args) => {
            if args.wait {
                let report = wait_for_data_streams(&client, &config.polling.policy()).await?;
                info!(attempts = report.attempts, "datastreams present");
            }
            let streams = client.run_blocking(|c| c.data_streams()).await?;
            let json = serde_json::to_string_pretty(&streams)?;
            println!("{json}");
        }
        FleetCommand::RevokeToken(args) => {
            let id = args.id.clone();
            client
                .run_blocking(move |c| c.revoke_enrollment_key(&id))
                .await
                .with_context(|| format!("failed to revoke token {}", args.id))?;
            println!("Revoked enrollment token {}", args.id);
        }
    }
    Ok(())
}

fn wait_policy(config: &SuiteConfig, timeout_secs: Option<u64>) -> Result<BackoffPolicy> {
    let mut policy = config.polling.policy();
    if let Some(secs) = timeout_secs {
        policy.max_elapsed_time = Duration::from_secs(secs);
    }
    policy.validate().context("invalid wait timeout")?;
    Ok(policy)
}

fn handle_services(cmd: ServicesCommand, config: &SuiteConfig) -> Result<()> {
    if !docker_available() {
        return Err(ServiceError::DockerUnavailable.into());
    }
    let manager = ServiceManager::from_config(config, "cli")?;
    match cmd {
        ServicesCommand::Up(args) => {
            let spec = service_spec(&args.name, &args.version);
            manager.run(&spec)?;
            println!("Started {} {}", spec.name, spec.version);
        }
        ServicesCommand::Down(args) => {
            manager.stop(&ServiceSpec::new(args.name.as_str(), "latest"))?;
            println!("Stopped {}", args.name);
        }
    }
    Ok(())
}

fn service_spec(name: &str, version: &str) -> ServiceSpec {
    match name {
        metricbeat::MYSQL_SERVICE => metricbeat::mysql_service(version),
        _ => ServiceSpec::new(name, version),
    }
}
