pub mod config;
pub mod container;
pub mod db;
pub mod executor;
pub mod ingress;
pub mod log_transport;
pub mod orchestrator;
pub mod source;
pub mod steps;
pub mod types;
pub mod vault;

pub use types::*;
