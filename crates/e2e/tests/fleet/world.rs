use cucumber::World;
use elastic_e2e::scenario::{FleetContext, FleetSuite};
use once_cell::sync::OnceCell;

/// Set once by `main` before the first scenario runs.
pub static SUITE: OnceCell<FleetSuite> = OnceCell::new();

#[derive(Debug, World, Default)]
pub struct FleetWorld {
    context: Option<FleetContext>,
}

impl FleetWorld {
    pub fn ctx(&mut self) -> &mut FleetContext {
        self.context.get_or_insert_with(|| {
            FleetContext::new(SUITE.get().expect("Fleet suite should be bootstrapped"))
        })
    }
}
