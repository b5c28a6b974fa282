pub mod optimistic;
pub mod paginator;
pub mod reducer;
pub mod scroll;
pub mod view;
