//! Scenario contexts: the state a suite's steps share, passed explicitly to
//! every step instead of living in globals.
//!
//! [`FleetSuite`] and [`MetricbeatSuite`] are built once per run, before the
//! first scenario; each scenario gets a fresh context borrowing their
//! write-once data. Contexts tear down what they started when dropped.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    checks::{
        wait_for_agent_status, wait_for_data_streams, wait_for_fleet_setup, wait_for_metrics_file,
    },
    config::SuiteConfig,
    fleet::{AgentList, EnrollmentApiKey, FleetClient, FleetError, agent_id},
    installer::{AgentInstaller, FLEET_PROFILE, installers},
    metricbeat::{self, CONTAINER_CONFIG_PATH},
    services::{ServiceError, ServiceManager, ServiceSpec},
};

/// Suite-wide state of the Fleet suite, produced by [`FleetSuite::bootstrap`].
#[derive(Debug, Clone)]
pub struct FleetSuite {
    pub config: SuiteConfig,
    pub client: FleetClient,
    pub services: ServiceManager,
    pub profile_env: BTreeMap<String, String>,
    /// Agent config every enrollment token is created for.
    pub agent_config_id: String,
}

impl FleetSuite {
    /// Start the Fleet profile, force the Fleet setup and wait for it to be ready.
    pub async fn bootstrap(config: SuiteConfig) -> Result<Self> {
        let services = ServiceManager::from_config(&config, FLEET_PROFILE)?;
        let profile_env = BTreeMap::from([(
            "stackVersion".to_string(),
            config.stack.version.to_string(),
        )]);
        services
            .run_profile(FLEET_PROFILE, &profile_env)
            .context("failed to start the Fleet profile")?;

        let client = FleetClient::new(&config.kibana, config.request_timeout());
        let policy = config.polling.policy();
        wait_for_fleet_setup(&client, &policy)
            .await
            .context("Fleet setup never became ready")?;
        let agent_config_id = client
            .run_blocking(|c| c.default_agent_config_id())
            .await
            .context("failed to read the default agent config")?;
        info!(config_id = %agent_config_id, "Fleet suite ready");

        Ok(Self {
            config,
            client,
            services,
            profile_env,
            agent_config_id,
        })
    }

    pub fn teardown(&self) -> Result<()> {
        let log = self
            .services
            .capture_logs(FLEET_PROFILE, &[], &self.profile_env)?;
        debug!(log = %log.display(), "Fleet profile logs captured");
        self.services
            .stop_profile(FLEET_PROFILE, &self.profile_env)
            .context("failed to stop the Fleet profile")?;
        Ok(())
    }
}

/// Per-scenario state of the Fleet suite.
#[derive(Debug)]
pub struct FleetContext {
    config: SuiteConfig,
    client: FleetClient,
    services: ServiceManager,
    installers: BTreeMap<String, AgentInstaller>,
    agent_config_id: String,
    env: BTreeMap<String, String>,
    pub image: Option<String>,
    pub hostname: Option<String>,
    pub enrolled_agent_id: Option<String>,
    pub current_token: Option<EnrollmentApiKey>,
    deployed: Vec<String>,
    cleanup: bool,
}

impl FleetContext {
    pub fn new(suite: &FleetSuite) -> Self {
        Self {
            config: suite.config.clone(),
            client: suite.client.clone(),
            services: suite.services.clone(),
            installers: installers(&suite.config),
            agent_config_id: suite.agent_config_id.clone(),
            env: suite.profile_env.clone(),
            image: None,
            hostname: None,
            enrolled_agent_id: None,
            current_token: None,
            deployed: Vec::new(),
            cleanup: false,
        }
    }

    pub fn default_image(&self) -> &str {
        &self.config.agent.default_image
    }

    fn installer(&self) -> Result<&AgentInstaller> {
        let image = self.image.as_deref().context("no agent has been deployed yet")?;
        self.installers
            .get(image)
            .with_context(|| format!("no installer for image {image}"))
    }

    fn hostname(&self) -> Result<&str> {
        self.hostname
            .as_deref()
            .context("the hostname of the agent container is unknown")
    }

    fn token(&self) -> Result<&EnrollmentApiKey> {
        self.current_token
            .as_ref()
            .context("no enrollment token has been created")
    }

    fn deploy_container(&mut self, n: usize) -> Result<String> {
        let installer = self.installer()?.clone();
        let container = installer.container_name(n);
        self.env.extend(installer.compose_env(&container));
        self.cleanup = true;
        self.deployed.push(container.clone());
        installer
            .deploy(&self.services, &self.env)
            .with_context(|| format!("failed to deploy the agent to {container}"))?;
        Ok(container)
    }

    fn enroll(&self, installer: &AgentInstaller, token: &str) -> Result<(), ServiceError> {
        installer.enroll(&self.services, &self.config.agent.enroll_url, token, &self.env)
    }

    /// Deploy an agent on `image`, create a token for its host and enroll it.
    pub async fn deploy_agent(&mut self, image: &str) -> Result<()> {
        debug!(image, "deploying an agent to Fleet with base image");
        if !self.installers.contains_key(image) {
            bail!(
                "unsupported image {image}; known images: {:?}",
                self.installers.keys().collect::<Vec<_>>()
            );
        }
        self.image = Some(image.to_string());

        let container = self.deploy_container(1)?;
        let hostname = self.services.container_hostname(&container)?;
        self.hostname = Some(hostname.clone());

        let name = format!("Test token for {hostname}");
        let config_id = self.agent_config_id.clone();
        let token = self
            .client
            .run_blocking(move |c| c.create_enrollment_key(&name, &config_id))
            .await
            .context("failed to create an enrollment token")?;
        self.enroll(self.installer()?, &token.api_key)
            .context("failed to enroll the agent")?;
        self.current_token = Some(token);

        let agents = self.client.run_blocking(|c| c.list_agents()).await?;
        let id = find_agent_id(&agents, &hostname)?;
        debug!(agent_id = %id, hostname = %hostname, "agent id retrieved");
        self.enrolled_agent_id = Some(id);
        Ok(())
    }

    /// Poll Fleet until the deployed agent is (or is no longer) listed as online.
    pub async fn wait_agent_online(&self, online: bool) -> Result<()> {
        let hostname = self.hostname()?;
        let report =
            wait_for_agent_status(&self.client, hostname, online, &self.config.polling.policy())
                .await?;
        info!(
            hostname,
            online,
            attempts = report.attempts,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "agent reached the expected status"
        );
        Ok(())
    }

    pub fn restart_host(&self) -> Result<()> {
        let installer = self.installer()?;
        let service = installer.service.as_str();
        self.services
            .run_command(&installer.profile, &[service], &["restart", service], &self.env)
            .inspect_err(|err| {
                error!(image = %installer.image, service, %err, "could not restart the service");
            })?;
        debug!(image = %installer.image, service, "the service has been restarted");
        Ok(())
    }

    pub async fn wait_data_streams(&self) -> Result<usize> {
        let report = wait_for_data_streams(&self.client, &self.config.polling.policy()).await?;
        Ok(report.value)
    }

    pub async fn unenroll(&self) -> Result<()> {
        let agent_id = self
            .enrolled_agent_id
            .clone()
            .context("no agent has been enrolled")?;
        debug!(agent_id = %agent_id, "un-enrolling agent in Fleet");
        self.client
            .run_blocking(move |c| c.unenroll_agent(&agent_id))
            .await
            .context("could not unenroll the agent")?;
        Ok(())
    }

    /// Enroll the agent again with the current token.
    pub fn reenroll(&self) -> Result<()> {
        debug!("re-enrolling the agent on the host with same token");
        let token = self.token()?;
        self.enroll(self.installer()?, &token.api_key)
            .context("failed to re-enroll the agent")?;
        Ok(())
    }

    pub async fn revoke_token(&mut self) -> Result<()> {
        let token = self.token()?;
        let token_id = token.id.clone();
        debug!(token_id = %token_id, "revoking enrollment token");
        let id = token_id.clone();
        self.client
            .run_blocking(move |c| c.revoke_enrollment_key(&id))
            .await
            .context("could not revoke the enrollment token")?;
        if let Some(token) = self.current_token.as_mut() {
            token.active = false;
        }
        debug!(token_id = %token_id, "token was revoked");
        Ok(())
    }

    /// Deploy a second agent host and assert that enrolling it with the
    /// current (revoked) token fails.
    pub fn expect_enrollment_rejected(&mut self) -> Result<()> {
        debug!("enrolling a new agent with a revoked token");
        self.deploy_container(2)?;
        let token = self.token()?;
        let result = self.enroll(self.installer()?, &token.api_key);
        expect_rejected(result, &token.id)
    }
}

/// Id of the agent running on `hostname`, or of the first listed agent when
/// no hostname matches.
fn find_agent_id(agents: &AgentList, hostname: &str) -> Result<String, FleetError> {
    match agents.list.iter().find(|agent| agent.hostname() == hostname) {
        Some(agent) => Ok(agent.id.clone()),
        None => agent_id(agents, 0),
    }
}

/// An enrollment with a revoked token must fail.
fn expect_rejected(result: Result<(), ServiceError>, token_id: &str) -> Result<()> {
    match result {
        Ok(()) => {
            error!(token_id, "the agent was enrolled with a revoked token");
            bail!("the agent was enrolled although the token was previously revoked")
        }
        Err(err) => {
            debug!(%err, token_id, "enrollment with a revoked token was rejected");
            Ok(())
        }
    }
}

impl Drop for FleetContext {
    fn drop(&mut self) {
        if !self.cleanup {
            return;
        }
        let Ok(installer) = self.installer() else {
            return;
        };
        let service = installer.service.as_str();
        if let Err(err) = self.services.capture_logs(&installer.profile, &[service], &self.env) {
            warn!(%err, "could not capture agent logs");
        }
        match self
            .services
            .remove_services(&installer.profile, &[service], &[service], &self.env)
        {
            Ok(()) => debug!(containers = ?self.deployed, "agent containers removed"),
            Err(err) => warn!(%err, containers = ?self.deployed, "could not remove agent containers"),
        }
    }
}

/// Suite-wide state of the metricbeat suite.
#[derive(Debug, Clone)]
pub struct MetricbeatSuite {
    pub config: SuiteConfig,
    pub services: ServiceManager,
}

impl MetricbeatSuite {
    pub fn new(config: SuiteConfig) -> Result<Self> {
        let services = ServiceManager::from_config(&config, "metricbeat")?;
        Ok(Self { config, services })
    }
}

/// Per-scenario state of the metricbeat suite.
#[derive(Debug)]
pub struct MetricbeatContext {
    config: SuiteConfig,
    services: ServiceManager,
    /// Host directory holding this scenario's metricbeat.yml and output.
    workdir: PathBuf,
    pub monitored: Option<ServiceSpec>,
    pub metricbeat: Option<ServiceSpec>,
}

impl MetricbeatContext {
    pub fn new(suite: &MetricbeatSuite) -> Self {
        let workdir = suite
            .config
            .artifacts
            .root
            .join("metricbeat")
            .join(Uuid::new_v4().to_string())
            .into_std_path_buf();
        Self {
            config: suite.config.clone(),
            services: suite.services.clone(),
            workdir,
            monitored: None,
            metricbeat: None,
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.workdir.join("output")
    }

    pub fn config_path(&self) -> PathBuf {
        self.workdir.join("metricbeat.yml")
    }

    pub fn run_mysql(&mut self, version: &str) -> Result<()> {
        let spec = metricbeat::mysql_service(version);
        self.services
            .run(&spec)
            .with_context(|| format!("failed to start MySQL {version}"))?;
        self.monitored = Some(spec);
        Ok(())
    }

    /// Configure metricbeat `version` for the MySQL module and start it. Events
    /// are written to `<service>-<version>.metrics` in the output dir.
    pub fn run_metricbeat(&mut self, version: &str) -> Result<()> {
        let monitored = self
            .monitored
            .clone()
            .context("MySQL must be running before metricbeat is configured")?;
        let filename = format!("{}-{}.metrics", monitored.name, monitored.version);
        let config = metricbeat::metricbeat_config(&monitored.name, &monitored, &filename);
        let config_path = self.config_path();
        metricbeat::write_metricbeat_config(&config_path, &config)?;
        std::fs::create_dir_all(self.output_dir())
            .with_context(|| format!("failed to create {}", self.output_dir().display()))?;

        let spec = metricbeat::metricbeat_service(version, &monitored, &config_path, &self.output_dir());
        debug!(
            config = %config_path.display(),
            mounted_at = CONTAINER_CONFIG_PATH,
            "metricbeat configured"
        );
        self.services
            .run(&spec)
            .with_context(|| format!("failed to start metricbeat {version}"))?;
        self.metricbeat = Some(spec);
        Ok(())
    }

    /// Poll the output dir until `file` (or its rotations) holds events of the
    /// monitored module.
    pub async fn wait_metrics_file(&self, file: &str) -> Result<usize> {
        let monitored = self
            .monitored
            .as_ref()
            .context("no monitored service is running")?;
        let output = self.output_dir();
        let report = wait_for_metrics_file(
            &output,
            file,
            &monitored.name,
            &self.config.polling.policy(),
        )
        .await?;
        info!(
            file,
            events = report.value,
            attempts = report.attempts,
            "metricbeat wrote metrics"
        );
        Ok(report.value)
    }
}

impl Drop for MetricbeatContext {
    fn drop(&mut self) {
        for spec in [self.metricbeat.take(), self.monitored.take()].into_iter().flatten() {
            if let Err(err) = self.services.stop(&spec) {
                warn!(service = %spec.name, %err, "could not stop service");
            }
        }
    }
}
