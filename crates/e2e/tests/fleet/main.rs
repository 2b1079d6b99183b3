//! Fleet mode scenarios against a Docker Compose stack (Elasticsearch, Kibana
//! and systemd agent hosts).
//!
//! Skipped when Docker is not available. Configuration comes from
//! `config/e2e.toml` and `E2E_*` variables.

mod steps;
mod world;

use std::path::Path;

use cucumber::{World, writer::Stats as _};
use elastic_e2e::{
    config::load_config, logging::init_tracing, scenario::FleetSuite,
    services::docker_available,
};
use world::{FleetWorld, SUITE};

#[tokio::main]
async fn main() {
    init_tracing();

    if !docker_available() {
        eprintln!("Skipping Fleet scenarios: docker is not available");
        return;
    }

    let config = load_config(None).expect("e2e configuration should load");
    let suite = match FleetSuite::bootstrap(config).await {
        Ok(suite) => suite,
        Err(err) => {
            eprintln!("Fleet suite could not start: {err:#}");
            std::process::exit(1);
        }
    };
    SUITE.set(suite.clone()).expect("suite is set once");

    let features = Path::new(env!("CARGO_MANIFEST_DIR")).join("features/fleet_mode.feature");
    let writer = FleetWorld::cucumber()
        .max_concurrent_scenarios(1)
        .with_default_cli()
        .run(features)
        .await;

    if let Err(err) = suite.teardown() {
        eprintln!("Fleet suite teardown failed: {err:#}");
    }
    if writer.execution_has_failed() {
        std::process::exit(1);
    }
}
