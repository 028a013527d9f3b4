pub mod api;
pub mod coordinator;
pub mod core;
