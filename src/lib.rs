// Library crate: the binary in main.rs and the integration tests both use it.

pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod retry;
pub mod settings;
pub mod sink;
pub mod targets;
