use crate::{push::PushConnectionState, timeline::reducer::TimelineState};

pub trait StateUpdater: StateUpdaterFunctions + std::fmt::Debug + Send + Sync {}

/// The functions in charge of updating the front end stores from the engine state.
pub trait StateUpdaterFunctions {
    fn update_timeline(&self, state: &TimelineState) -> anyhow::Result<()>;
    fn update_push_connection(&self, state: PushConnectionState) -> anyhow::Result<()>;
}
