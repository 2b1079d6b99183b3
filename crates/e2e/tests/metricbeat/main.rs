//! MySQL metricbeat module scenarios. Skipped when Docker is not available.

mod steps;
mod world;

use std::path::Path;

use cucumber::{World, writer::Stats as _};
use elastic_e2e::{
    config::load_config, logging::init_tracing, scenario::MetricbeatSuite,
    services::docker_available,
};
use world::{MetricbeatWorld, SUITE};

#[tokio::main]
async fn main() {
    init_tracing();

    if !docker_available() {
        eprintln!("Skipping metricbeat scenarios: docker is not available");
        return;
    }

    let config = load_config(None).expect("e2e configuration should load");
    let suite = MetricbeatSuite::new(config).expect("metricbeat suite should initialise");
    SUITE.set(suite).expect("suite is set once");

    let features = Path::new(env!("CARGO_MANIFEST_DIR")).join("features/mysql.feature");
    let writer = MetricbeatWorld::cucumber()
        .max_concurrent_scenarios(1)
        .with_default_cli()
        .run(features)
        .await;

    if writer.execution_has_failed() {
        std::process::exit(1);
    }
}
