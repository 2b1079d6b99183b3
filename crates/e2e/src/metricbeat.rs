//! Metricbeat fixtures: the monitored MySQL service, the metricbeat
//! configuration written for it, and scanning of metricbeat's file output.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Value, json};
use thiserror::Error;

use crate::services::ServiceSpec;

pub const MYSQL_SERVICE: &str = "mysql";
pub const METRICBEAT_SERVICE: &str = "metricbeat";
/// Where the output directory is mounted inside the metricbeat container.
pub const CONTAINER_OUTPUT_DIR: &str = "/tmp/metricbeat-output";
pub const CONTAINER_CONFIG_PATH: &str = "/usr/share/metricbeat/metricbeat.yml";

const MYSQL_ROOT_PASSWORD: &str = "secret";

pub fn mysql_service(version: &str) -> ServiceSpec {
    ServiceSpec::new(MYSQL_SERVICE, version).with_env("mysqlRootPassword", MYSQL_ROOT_PASSWORD)
}

/// Metricbeat monitoring `monitored`, writing events to `output_dir` on the host.
pub fn metricbeat_service(
    version: &str,
    monitored: &ServiceSpec,
    config_path: &Path,
    output_dir: &Path,
) -> ServiceSpec {
    ServiceSpec::new(METRICBEAT_SERVICE, version)
        .with_env("metricbeatConfigFile", config_path.display().to_string())
        .with_env("metricbeatOutputDir", output_dir.display().to_string())
        .with_env("serviceName", monitored.name.clone())
}

/// metricbeat.yml enabling `module` against `service` and the file output.
pub fn metricbeat_config(module: &str, service: &ServiceSpec, filename: &str) -> Value {
    let hosts = match module {
        "mysql" => vec![format!(
            "root:{MYSQL_ROOT_PASSWORD}@tcp({}:3306)/",
            service.name
        )],
        _ => vec![format!("{}:{}", service.name, default_port(module))],
    };
    json!({
        "metricbeat.modules": [{
            "module": module,
            "metricsets": default_metricsets(module),
            "hosts": hosts,
            "period": "10s",
            "enabled": true,
        }],
        "output.file": {
            "path": CONTAINER_OUTPUT_DIR,
            "filename": filename,
        },
        "logging.level": "info",
    })
}

fn default_metricsets(module: &str) -> Vec<&'static str> {
    match module {
        "mysql" => vec!["status"],
        _ => vec![],
    }
}

fn default_port(module: &str) -> u16 {
    match module {
        "mysql" => 3306,
        "redis" => 6379,
        _ => 80,
    }
}

pub fn write_metricbeat_config(path: &Path, config: &Value) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let yaml = serde_yaml_bw::to_string(config).context("failed to render metricbeat.yml")?;
    fs::write(path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt event at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl ScanError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, ScanError::Corrupt { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsScan {
    pub files: usize,
    pub events: usize,
    pub matching: usize,
}

/// Scan every file under `dir` named `file_prefix*` (metricbeat rotates and
/// may date-suffix its output) and count events, and those of `module`.
pub fn scan_metrics_dir(dir: &Path, file_prefix: &str, module: &str) -> Result<MetricsScan, ScanError> {
    let io = |path: &Path, source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|err| io(dir, err))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(file_prefix))
        })
        .collect();
    files.sort();

    let mut scan = MetricsScan {
        files: files.len(),
        ..MetricsScan::default()
    };
    for path in &files {
        let contents = fs::read_to_string(path).map_err(|err| io(path, err))?;
        let counts = count_events(&contents, module).map_err(|(line, source)| ScanError::Corrupt {
            path: path.clone(),
            line,
            source,
        })?;
        scan.events += counts.0;
        scan.matching += counts.1;
    }
    Ok(scan)
}

/// `(events, events of module)` in ndjson `contents`. An unterminated last
/// line is a write in progress and is skipped.
fn count_events(contents: &str, module: &str) -> Result<(usize, usize), (usize, serde_json::Error)> {
    let complete = contents.ends_with('\n');
    let lines: Vec<&str> = contents.lines().collect();
    let mut events = 0;
    let mut matching = 0;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) if !complete && idx + 1 == lines.len() => continue,
            Err(err) => return Err((idx + 1, err)),
        };
        events += 1;
        if event_module(&event) == Some(module) {
            matching += 1;
        }
    }
    Ok((events, matching))
}

fn event_module(event: &Value) -> Option<&str> {
    event
        .pointer("/event/module")
        .or_else(|| event.pointer("/metricset/module"))
        .and_then(Value::as_str)
}
