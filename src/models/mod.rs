//! ViewModels and contracts exposed to the adapter

pub(crate) mod async_requests;
pub mod errors;
pub mod event_bridge;
pub mod events;
pub mod item;
pub mod settings;
pub mod state_updater;
