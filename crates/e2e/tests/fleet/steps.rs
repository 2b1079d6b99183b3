use cucumber::{given, then, when};

use crate::world::FleetWorld;

#[given(regex = r"^an agent is deployed to Fleet$")]
pub async fn an_agent_is_deployed(world: &mut FleetWorld) {
    let image = world.ctx().default_image().to_string();
    world
        .ctx()
        .deploy_agent(&image)
        .await
        .expect("agent should be deployed to Fleet");
}

#[when(regex = r#"^an agent running on "([^"]*)" is deployed to Fleet$"#)]
pub async fn an_agent_on_image_is_deployed(world: &mut FleetWorld, image: String) {
    world
        .ctx()
        .deploy_agent(&image)
        .await
        .expect("agent should be deployed to Fleet");
}

#[then(regex = r"^the agent is listed in Fleet as online$")]
pub async fn agent_listed_online(world: &mut FleetWorld) {
    world
        .ctx()
        .wait_agent_online(true)
        .await
        .expect("agent should be listed as online");
}

#[when(regex = r"^the host is restarted$")]
pub async fn host_restarted(world: &mut FleetWorld) {
    world.ctx().restart_host().expect("host should restart");
}

#[then(regex = r"^system package dashboards are listed in Fleet$")]
pub async fn system_dashboards_listed(world: &mut FleetWorld) {
    world
        .ctx()
        .wait_data_streams()
        .await
        .expect("datastreams should be listed");
}

#[when(regex = r"^the agent is un-enrolled$")]
pub async fn agent_unenrolled(world: &mut FleetWorld) {
    world
        .ctx()
        .unenroll()
        .await
        .expect("agent should be un-enrolled");
}

#[then(regex = r"^the agent is not listed as online in Fleet$")]
pub async fn agent_not_listed_online(world: &mut FleetWorld) {
    world
        .ctx()
        .wait_agent_online(false)
        .await
        .expect("agent should stop being listed as online");
}

#[when(regex = r"^the agent is re-enrolled on the host$")]
pub async fn agent_reenrolled(world: &mut FleetWorld) {
    world.ctx().reenroll().expect("agent should re-enroll");
}

#[when(regex = r"^the enrollment token is revoked$")]
pub async fn token_revoked(world: &mut FleetWorld) {
    world
        .ctx()
        .revoke_token()
        .await
        .expect("token should be revoked");
}

#[then(regex = r"^an attempt to enroll a new agent fails$")]
pub async fn enrollment_fails(world: &mut FleetWorld) {
    world
        .ctx()
        .expect_enrollment_rejected()
        .expect("enrollment with a revoked token should fail");
}
