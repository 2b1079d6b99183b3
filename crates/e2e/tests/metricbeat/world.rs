use cucumber::World;
use elastic_e2e::scenario::{MetricbeatContext, MetricbeatSuite};
use once_cell::sync::OnceCell;

pub static SUITE: OnceCell<MetricbeatSuite> = OnceCell::new();

#[derive(Debug, World, Default)]
pub struct MetricbeatWorld {
    context: Option<MetricbeatContext>,
}

impl MetricbeatWorld {
    pub fn ctx(&mut self) -> &mut MetricbeatContext {
        self.context.get_or_insert_with(|| {
            MetricbeatContext::new(SUITE.get().expect("metricbeat suite should be initialised"))
        })
    }
}
