//! Docker Compose backed service lifecycle.
//!
//! Compose files live under `<compose root>/profiles/<profile>/docker-compose.yml`
//! (the runtime dependencies of a suite, e.g. Elasticsearch + Kibana) and
//! `<compose root>/services/<service>/docker-compose.yml` (services started on
//! demand by scenarios). Versions and container names are handed to compose
//! through environment variables.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::de::IgnoredAny;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::SuiteConfig;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("docker is not available on this host")]
    DockerUnavailable,
    #[error("compose file not found at {0}")]
    ComposeFileMissing(PathBuf),
    #[error("invalid compose file {path}: {source}")]
    InvalidComposeFile {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
    #[error("service {service} is not declared in {file}")]
    UnknownService { service: String, file: PathBuf },
    #[error("`{command}` failed (code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// A service started from its own compose file, e.g. `mysql` at `8.0.13`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub version: String,
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Prefix of the compose variables of this service (`centos-systemd` -> `centos_systemd`).
    pub fn env_prefix(&self) -> String {
        env_prefix(&self.name)
    }

    /// `<prefix>Tag=<version>` plus the extra variables.
    pub fn compose_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert(format!("{}Tag", self.env_prefix()), self.version.clone());
        env
    }
}

pub fn env_prefix(service: &str) -> String {
    service.replace('-', "_")
}

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, IgnoredAny>,
}

/// Service names declared in a compose file.
pub fn declared_services(path: &Path) -> Result<BTreeSet<String>, ServiceError> {
    if !path.exists() {
        return Err(ServiceError::ComposeFileMissing(path.to_path_buf()));
    }
    let data = fs::read_to_string(path).map_err(|source| ServiceError::Io {
        context: format!("failed to read {}", path.display()),
        source,
    })?;
    let compose: ComposeFile =
        serde_yaml_bw::from_str(&data).map_err(|source| ServiceError::InvalidComposeFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(compose.services.into_keys().collect())
}

/// Arguments of a `docker compose` invocation over `files` in `project`.
pub fn compose_args(project: &str, files: &[PathBuf], args: &[&str]) -> Vec<String> {
    let mut out = vec!["compose".to_string(), "-p".to_string(), project.to_string()];
    for file in files {
        out.push("-f".into());
        out.push(file.display().to_string());
    }
    out.extend(args.iter().map(|arg| arg.to_string()));
    out
}

/// Quick check to see if the Docker CLI and daemon are reachable.
pub fn docker_available() -> bool {
    if which::which("docker").is_err() {
        return false;
    }
    Command::new("docker")
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct ServiceManager {
    compose_root: Utf8PathBuf,
    project_prefix: String,
    logs_dir: PathBuf,
}

impl ServiceManager {
    pub fn new(
        compose_root: Utf8PathBuf,
        project_prefix: impl Into<String>,
        logs_dir: impl Into<PathBuf>,
    ) -> Result<Self, ServiceError> {
        let logs_dir = logs_dir.into();
        fs::create_dir_all(&logs_dir).map_err(|source| ServiceError::Io {
            context: format!("failed to create logs dir at {}", logs_dir.display()),
            source,
        })?;
        Ok(Self {
            compose_root,
            project_prefix: project_prefix.into(),
            logs_dir,
        })
    }

    /// Manager for `suite`, logging under `<artifacts>/logs/<suite>`.
    pub fn from_config(config: &SuiteConfig, suite: &str) -> Result<Self, ServiceError> {
        Self::new(
            config.compose.root.clone(),
            config.compose.project_prefix.clone(),
            config.artifacts.root.join("logs").join(sanitize(suite)),
        )
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn profile_file(&self, profile: &str) -> PathBuf {
        self.compose_root
            .join("profiles")
            .join(profile)
            .join("docker-compose.yml")
            .into_std_path_buf()
    }

    pub fn service_file(&self, service: &str) -> PathBuf {
        self.compose_root
            .join("services")
            .join(service)
            .join("docker-compose.yml")
            .into_std_path_buf()
    }

    pub fn project_name(&self, scope: &str) -> String {
        sanitize(&format!("{}_{scope}", self.project_prefix))
    }

    /// Profile file first, then one file per service.
    pub fn compose_files(&self, profile: &str, services: &[&str]) -> Vec<PathBuf> {
        std::iter::once(self.profile_file(profile))
            .chain(services.iter().map(|service| self.service_file(service)))
            .collect()
    }

    /// Start a standalone service in its own project.
    pub fn run(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        info!(service = %spec.name, version = %spec.version, "starting service");
        let files = vec![self.service_file(&spec.name)];
        ensure_declared(&files[0], &spec.name)?;
        self.compose(
            &self.project_name(&spec.name),
            &files,
            &["up", "-d"],
            &spec.compose_env(),
        )?;
        Ok(())
    }

    pub fn stop(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        info!(service = %spec.name, "stopping service");
        let files = vec![self.service_file(&spec.name)];
        self.compose(
            &self.project_name(&spec.name),
            &files,
            &["down", "-v", "--remove-orphans"],
            &spec.compose_env(),
        )?;
        Ok(())
    }

    pub fn run_profile(
        &self,
        profile: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        info!(profile, "starting profile");
        let files = self.compose_files(profile, &[]);
        ensure_exists(&files[0])?;
        self.compose(
            &self.project_name(profile),
            &files,
            &["up", "-d", "--remove-orphans"],
            env,
        )?;
        Ok(())
    }

    pub fn stop_profile(
        &self,
        profile: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        info!(profile, "stopping profile");
        let files = self.compose_files(profile, &[]);
        self.compose(&self.project_name(profile), &files, &["down", "-v"], env)?;
        Ok(())
    }

    /// Start `services` inside the project of `profile`, sharing its network.
    pub fn add_services_to_compose(
        &self,
        profile: &str,
        services: &[&str],
        env: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        debug!(profile, ?services, "adding services to compose");
        let files = self.compose_files(profile, services);
        ensure_exists(&files[0])?;
        for (service, file) in services.iter().zip(&files[1..]) {
            ensure_declared(file, service)?;
        }
        let mut args = vec!["up", "-d"];
        args.extend_from_slice(services);
        self.compose(&self.project_name(profile), &files, &args, env)?;
        Ok(())
    }

    /// Run an arbitrary compose command, e.g. `restart elastic-agent`.
    pub fn run_command(
        &self,
        profile: &str,
        composes: &[&str],
        args: &[&str],
        env: &BTreeMap<String, String>,
    ) -> Result<String, ServiceError> {
        let files = self.compose_files(profile, composes);
        let output = self.compose(&self.project_name(profile), &files, args, env)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `docker compose exec` in a running service.
    pub fn exec_in_service(
        &self,
        profile: &str,
        composes: &[&str],
        service: &str,
        cmd: &[String],
        detach: bool,
        env: &BTreeMap<String, String>,
    ) -> Result<String, ServiceError> {
        let mut args = vec!["exec", "-T"];
        if detach {
            args.push("-d");
        }
        args.push(service);
        args.extend(cmd.iter().map(String::as_str));
        self.run_command(profile, composes, &args, env)
    }

    pub fn remove_services(
        &self,
        profile: &str,
        composes: &[&str],
        services: &[&str],
        env: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        let mut args = vec!["rm", "-fsv"];
        args.extend_from_slice(services);
        self.run_command(profile, composes, &args, env)?;
        Ok(())
    }

    pub fn capture_logs(
        &self,
        profile: &str,
        composes: &[&str],
        env: &BTreeMap<String, String>,
    ) -> Result<PathBuf, ServiceError> {
        let log_path = self.logs_dir.join(format!("compose-{}.log", sanitize(profile)));
        let contents = match self.run_command(profile, composes, &["logs", "--no-color"], env) {
            Ok(stdout) => stdout,
            Err(err) => format!("failed to capture compose logs: {err}\n"),
        };
        fs::write(&log_path, contents).map_err(|source| ServiceError::Io {
            context: format!("failed to write {}", log_path.display()),
            source,
        })?;
        Ok(log_path)
    }

    pub fn container_hostname(&self, container: &str) -> Result<String, ServiceError> {
        let output = self.docker(&["exec", container, "hostname"], &BTreeMap::new())?;
        let hostname = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container, hostname = %hostname, "container hostname retrieved");
        Ok(hostname)
    }

    fn compose(
        &self,
        project: &str,
        files: &[PathBuf],
        args: &[&str],
        env: &BTreeMap<String, String>,
    ) -> Result<Output, ServiceError> {
        let argv = compose_args(project, files, args);
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.docker(&argv, env)
    }

    fn docker(&self, args: &[&str], env: &BTreeMap<String, String>) -> Result<Output, ServiceError> {
        let command = format!("docker {}", args.join(" "));
        self.append_log(&command);
        let output = Command::new("docker")
            .args(args)
            .envs(env)
            .current_dir(self.compose_root.as_std_path())
            .output()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => ServiceError::DockerUnavailable,
                _ => ServiceError::Io {
                    context: "failed to execute docker".into(),
                    source,
                },
            })?;

        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        error!(%command, code = ?output.status.code(), %stderr, "docker command failed");
        self.append_log(&format!("failed ({:?}): {}", output.status.code(), stderr.trim()));
        Err(ServiceError::CommandFailed {
            command,
            code: output.status.code(),
            stderr,
        })
    }

    fn append_log(&self, line: &str) {
        let journal = self.logs_dir.join("harness.log");
        let written = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal)
            .and_then(|mut file| writeln!(file, "[{}] {line}", chrono::Utc::now().to_rfc3339()));
        if let Err(err) = written {
            debug!(?err, journal = %journal.display(), "could not append to harness journal");
        }
    }
}

fn ensure_exists(file: &Path) -> Result<(), ServiceError> {
    if file.exists() {
        Ok(())
    } else {
        Err(ServiceError::ComposeFileMissing(file.to_path_buf()))
    }
}

fn ensure_declared(file: &Path, service: &str) -> Result<(), ServiceError> {
    if declared_services(file)?.contains(service) {
        Ok(())
    } else {
        Err(ServiceError::UnknownService {
            service: service.to_string(),
            file: file.to_path_buf(),
        })
    }
}

pub fn sanitize(input: &str) -> String {
    let out: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    out.trim_matches('_').to_string()
}
