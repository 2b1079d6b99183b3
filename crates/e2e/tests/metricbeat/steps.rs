use cucumber::{given, then};

use crate::world::MetricbeatWorld;

#[given(regex = r#"^MySQL "([^"]*)" is running$"#)]
pub async fn mysql_is_running(world: &mut MetricbeatWorld, version: String) {
    world
        .ctx()
        .run_mysql(&version)
        .expect("MySQL should be running");
}

#[given(regex = r#"^metricbeat "([^"]*)" is installed and configured for MySQL module$"#)]
pub async fn metricbeat_configured_for_mysql(world: &mut MetricbeatWorld, version: String) {
    world
        .ctx()
        .run_metricbeat(&version)
        .expect("metricbeat should be running");
}

#[then(regex = r#"^metricbeat outputs metrics to the file "([^"]*)"$"#)]
pub async fn metricbeat_outputs_metrics(world: &mut MetricbeatWorld, file: String) {
    let events = world
        .ctx()
        .wait_metrics_file(&file)
        .await
        .expect("metricbeat should write MySQL metrics");
    assert!(events > 0, "no MySQL events in {file}");
}
