//! Elastic Agent installers, one per base image the agent can be deployed on.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use tracing::{debug, error, info, warn};

use crate::{
    config::SuiteConfig,
    services::{ServiceError, ServiceManager, env_prefix},
};

/// Compose profile holding Elasticsearch, Kibana and the agent hosts.
pub const FLEET_PROFILE: &str = "fleet";
pub const AGENT_BINARY: &str = "elastic-agent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInstaller {
    /// Base image name used in step text (`centos`, `debian`).
    pub image: String,
    pub profile: String,
    /// Compose service running the image with systemd.
    pub service: String,
    pub tag: String,
    pub artifact_name: String,
    /// Artifact location on the host, mounted into the container.
    pub binary_path: Utf8PathBuf,
    pub install_cmds: Vec<String>,
    pub post_install_cmds: Vec<Vec<String>>,
}

impl AgentInstaller {
    fn centos(artifacts: &Utf8PathBuf, version: &str) -> Self {
        let artifact_name = format!("elastic-agent-{version}-x86_64.rpm");
        Self {
            image: "centos".into(),
            profile: FLEET_PROFILE.into(),
            service: "centos-systemd".into(),
            tag: "latest".into(),
            binary_path: artifacts.join(&artifact_name),
            install_cmds: vec![
                "yum".into(),
                "localinstall".into(),
                format!("/{artifact_name}"),
                "-y".into(),
            ],
            artifact_name,
            post_install_cmds: systemd_start(),
        }
    }

    fn debian(artifacts: &Utf8PathBuf, version: &str) -> Self {
        let artifact_name = format!("elastic-agent-{version}-amd64.deb");
        Self {
            image: "debian".into(),
            profile: FLEET_PROFILE.into(),
            service: "debian-systemd".into(),
            tag: "stretch".into(),
            binary_path: artifacts.join(&artifact_name),
            install_cmds: vec!["dpkg".into(), "-i".into(), format!("/{artifact_name}")],
            artifact_name,
            post_install_cmds: systemd_start(),
        }
    }

    /// Name of the n-th agent container of this installer.
    pub fn container_name(&self, n: usize) -> String {
        format!("{}_{}_{n}", self.profile, self.service)
    }

    /// Compose variables for running this installer's service as `container_name`.
    pub fn compose_env(&self, container_name: &str) -> BTreeMap<String, String> {
        let prefix = env_prefix(&self.service);
        BTreeMap::from([
            (format!("{prefix}Tag"), self.tag.clone()),
            (format!("{prefix}ContainerName"), container_name.to_string()),
            (
                format!("{prefix}AgentBinarySrcPath"),
                self.binary_path.to_string(),
            ),
            (
                format!("{prefix}AgentBinaryTargetPath"),
                format!("/{}", self.artifact_name),
            ),
        ])
    }

    /// Start the agent host and install the agent in it.
    pub fn deploy(
        &self,
        manager: &ServiceManager,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        if !self.binary_path.exists() {
            warn!(path = %self.binary_path, "agent artifact not found on the host");
        }
        let composes = [self.service.as_str()];
        manager
            .add_services_to_compose(&self.profile, &composes, env)
            .inspect_err(|err| {
                error!(service = %self.service, tag = %self.tag, %err, "could not run the target box");
            })?;

        manager
            .exec_in_service(
                &self.profile,
                &composes,
                &self.service,
                &self.install_cmds,
                false,
                env,
            )
            .inspect_err(|err| {
                error!(
                    command = ?self.install_cmds,
                    image = %self.image,
                    service = %self.service,
                    %err,
                    "could not install the agent in the box"
                );
            })?;

        for cmd in &self.post_install_cmds {
            manager.exec_in_service(&self.profile, &composes, &self.service, cmd, false, env)?;
        }
        info!(image = %self.image, service = %self.service, "agent installed");
        Ok(())
    }

    pub fn enroll_command(enroll_url: &str, token: &str) -> Vec<String> {
        vec![
            AGENT_BINARY.into(),
            "enroll".into(),
            enroll_url.into(),
            token.into(),
            "-f".into(),
            "--insecure".into(),
        ]
    }

    pub fn enroll(
        &self,
        manager: &ServiceManager,
        enroll_url: &str,
        token: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        let cmd = Self::enroll_command(enroll_url, token);
        manager
            .exec_in_service(
                &self.profile,
                &[self.service.as_str()],
                &self.service,
                &cmd,
                false,
                env,
            )
            .inspect_err(|err| {
                error!(
                    image = %self.image,
                    service = %self.service,
                    tag = %self.tag,
                    %err,
                    "could not enroll the agent with the token"
                );
            })?;
        debug!(service = %self.service, "agent enrolled");
        Ok(())
    }
}

fn systemd_start() -> Vec<Vec<String>> {
    vec![
        vec!["systemctl".into(), "enable".into(), AGENT_BINARY.into()],
        vec!["systemctl".into(), "start".into(), AGENT_BINARY.into()],
    ]
}

/// Installers keyed by image name.
pub fn installers(config: &SuiteConfig) -> BTreeMap<String, AgentInstaller> {
    let artifacts = config
        .agent
        .binary_path
        .clone()
        .unwrap_or_else(|| config.artifacts.root.join("agent"));
    let version = config.stack.version.to_string();
    [
        AgentInstaller::centos(&artifacts, &version),
        AgentInstaller::debian(&artifacts, &version),
    ]
    .into_iter()
    .map(|installer| (installer.image.clone(), installer))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn centos() -> AgentInstaller {
        installers(&SuiteConfig::default())
            .remove("centos")
            .expect("centos installer")
    }

    #[test]
    fn builtin_installers_are_keyed_by_image() {
        let all = installers(&SuiteConfig::default());
        assert_eq!(all.keys().collect::<Vec<_>>(), ["centos", "debian"]);
        assert_eq!(all["debian"].service, "debian-systemd");
        assert!(all["debian"].artifact_name.ends_with("-amd64.deb"));
    }

    #[test]
    fn artifact_follows_stack_version_and_binary_path() {
        let mut config = SuiteConfig::default();
        config.stack.version = semver::Version::new(7, 9, 0);
        config.agent.binary_path = Some(Utf8PathBuf::from("/dist"));
        let installer = installers(&config).remove("centos").unwrap();
        assert_eq!(installer.artifact_name, "elastic-agent-7.9.0-x86_64.rpm");
        assert_eq!(installer.binary_path, "/dist/elastic-agent-7.9.0-x86_64.rpm");
        assert_eq!(installer.install_cmds[2], "/elastic-agent-7.9.0-x86_64.rpm");
    }

    #[test]
    fn container_names_are_numbered() {
        let installer = centos();
        assert_eq!(installer.container_name(1), "fleet_centos-systemd_1");
        assert_eq!(installer.container_name(2), "fleet_centos-systemd_2");
    }

    #[test]
    fn compose_env_uses_service_prefix() {
        let installer = centos();
        let env = installer.compose_env("fleet_centos-systemd_1");
        assert_eq!(env["centos_systemdTag"], "latest");
        assert_eq!(env["centos_systemdContainerName"], "fleet_centos-systemd_1");
        assert_eq!(
            env["centos_systemdAgentBinarySrcPath"],
            installer.binary_path.as_str()
        );
        assert_eq!(
            env["centos_systemdAgentBinaryTargetPath"],
            format!("/{}", installer.artifact_name)
        );
    }

    #[test]
    fn enroll_command_is_forced_and_insecure() {
        assert_eq!(
            AgentInstaller::enroll_command("http://kibana:5601", "tok"),
            [
                "elastic-agent",
                "enroll",
                "http://kibana:5601",
                "tok",
                "-f",
                "--insecure"
            ]
        );
    }
}
