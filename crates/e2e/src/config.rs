use std::time::Duration;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use once_cell::sync::Lazy;
use semver::{BuildMetadata, Prerelease, Version};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::poll::BackoffPolicy;

static DEFAULT_CONFIG: Lazy<SuiteConfig> = Lazy::new(SuiteConfig::default);

/// Everything a suite run needs to reach the stack under test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub kibana: KibanaConfig,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KibanaConfig {
    #[serde(default = "default_kibana_url")]
    pub base_url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Value of the `kbn-xsrf` header Kibana requires on API calls.
    #[serde(default = "default_xsrf_token")]
    pub xsrf_token: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for KibanaConfig {
    fn default() -> Self {
        Self {
            base_url: default_kibana_url(),
            username: default_username(),
            password: default_password(),
            xsrf_token: default_xsrf_token(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_kibana_url() -> String {
    "http://localhost:5601".into()
}

fn default_username() -> String {
    "elastic".into()
}

fn default_password() -> String {
    "changeme".into()
}

fn default_xsrf_token() -> String {
    "e2e-tests".into()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "default_stack_version")]
    pub version: Version,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            version: default_stack_version(),
        }
    }
}

fn default_stack_version() -> Version {
    Version {
        major: 8,
        minor: 0,
        patch: 0,
        pre: Prerelease::new("SNAPSHOT").unwrap_or(Prerelease::EMPTY),
        build: BuildMetadata::EMPTY,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Local agent archive mounted into the target boxes.
    #[serde(default)]
    pub binary_path: Option<Utf8PathBuf>,
    /// Kibana URL as seen from inside the compose network.
    #[serde(default = "default_enroll_url")]
    pub enroll_url: String,
    #[serde(default = "default_image")]
    pub default_image: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            enroll_url: default_enroll_url(),
            default_image: default_image(),
        }
    }
}

fn default_enroll_url() -> String {
    "http://kibana:5601".into()
}

fn default_image() -> String {
    "centos".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    #[serde(default = "default_compose_root")]
    pub root: Utf8PathBuf,
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            root: default_compose_root(),
            project_prefix: default_project_prefix(),
        }
    }
}

fn default_compose_root() -> Utf8PathBuf {
    workspace_root().join("compose")
}

fn default_project_prefix() -> String {
    "e2e".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_poll_timeout_ms(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl PollingConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(self.timeout_ms))
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_multiplier(self.multiplier)
    }
}

fn default_poll_timeout_ms() -> u64 {
    60_000
}

fn default_initial_interval_ms() -> u64 {
    500
}

fn default_max_interval_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_root")]
    pub root: Utf8PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            root: default_artifacts_root(),
        }
    }
}

fn default_artifacts_root() -> Utf8PathBuf {
    workspace_root().join("target").join("e2e")
}

impl SuiteConfig {
    pub fn validate(&self) -> Result<()> {
        let url = self.kibana.base_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("kibana.base_url must be an http(s) URL, got {url:?}");
        }
        if self.kibana.xsrf_token.trim().is_empty() {
            bail!("kibana.xsrf_token must not be empty");
        }
        self.polling
            .policy()
            .validate()
            .context("invalid polling configuration")?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.kibana.request_timeout_ms)
    }
}

/// Defaults < TOML file < `E2E_*` environment variables (`__` separates sections).
///
/// The file is the explicit path when given, else `$E2E_CONFIG`, else
/// `config/e2e.toml` under the workspace root when it exists.
pub fn load_config(explicit_path: Option<&Utf8Path>) -> Result<SuiteConfig> {
    let mut figment = Figment::from(Serialized::defaults(DEFAULT_CONFIG.clone()));

    if let Some(path) = explicit_path {
        if !path.exists() {
            bail!("config file not found at {path}");
        }
        figment = figment.merge(Toml::file(path));
    } else if let Some(path) = resolve_default_config_path() {
        debug!(%path, "using config file");
        figment = figment.merge(Toml::file(path));
    } else {
        warn!("no config file found; relying on defaults + env overrides");
    }

    figment = figment.merge(Env::prefixed("E2E_").split("__").ignore(&["config"]));

    let config: SuiteConfig = figment
        .extract()
        .context("failed to load e2e suite configuration")?;
    config.validate()?;
    Ok(config)
}

fn resolve_default_config_path() -> Option<Utf8PathBuf> {
    if let Ok(path) = std::env::var("E2E_CONFIG") {
        let path = Utf8PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!(%path, "E2E_CONFIG points to a missing file; ignoring");
    }
    let candidate = workspace_root().join("config").join("e2e.toml");
    candidate.exists().then_some(candidate)
}

pub fn workspace_root() -> &'static Utf8Path {
    static ROOT: Lazy<Utf8PathBuf> = Lazy::new(|| {
        let manifest_dir = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir
            .parent()
            .and_then(|p| p.parent())
            .map(Utf8PathBuf::from)
            .unwrap_or(manifest_dir)
    });
    ROOT.as_path()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn defaults_point_at_local_kibana() {
        let config = SuiteConfig::default();
        assert_eq!(config.kibana.base_url, "http://localhost:5601");
        assert_eq!(config.kibana.username, "elastic");
        assert_eq!(config.kibana.password, "changeme");
        assert_eq!(config.kibana.xsrf_token, "e2e-tests");
        assert_eq!(config.agent.default_image, "centos");
        assert_eq!(config.stack.version.to_string(), "8.0.0-SNAPSHOT");
        assert!(config.compose.root.ends_with("compose"));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn polling_section_builds_policy() {
        let polling = PollingConfig {
            timeout_ms: 30_000,
            initial_interval_ms: 250,
            max_interval_ms: 2_000,
            multiplier: 1.5,
        };
        let policy = polling.policy();
        assert_eq!(policy.max_elapsed_time, Duration::from_secs(30));
        assert_eq!(policy.initial_interval, Duration::from_millis(250));
        assert_eq!(policy.max_interval, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 1.5);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("e2e.toml");
        fs::write(
            &path,
            r#"
            [kibana]
            base_url = "http://kibana.internal:5601"

            [stack]
            version = "7.9.0"

            [polling]
            timeout_ms = 5000
            "#,
        )
        .expect("write config");

        let path = Utf8PathBuf::from_path_buf(path).expect("utf8 path");
        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config.kibana.base_url, "http://kibana.internal:5601");
        assert_eq!(config.kibana.username, "elastic");
        assert_eq!(config.stack.version, Version::new(7, 9, 0));
        assert_eq!(config.polling.timeout_ms, 5000);
        assert_eq!(config.polling.initial_interval_ms, 500);
    }

    #[test]
    fn example_config_loads() {
        let path = workspace_root().join("config").join("e2e.example.toml");
        let config = load_config(Some(&path)).expect("example config loads");
        assert_eq!(config.kibana.request_timeout_ms, 30_000);
        assert_eq!(config.agent.enroll_url, "http://kibana:5601");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config(Some(Utf8Path::new("/nonexistent/e2e.toml")))
            .expect_err("missing file should fail");
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = SuiteConfig::default();
        config.kibana.base_url = "kibana:5601".into();
        assert!(config.validate().is_err());

        let mut config = SuiteConfig::default();
        config.polling.multiplier = 1.0;
        let err = config.validate().expect_err("flat multiplier is invalid");
        assert!(format!("{err:#}").contains("multiplier"));
    }
}
