// Core modules
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod risk;
pub mod strategy;
pub mod timing;

// Re-export commonly used types
pub use config::BotConfig;
pub use error::{BotError, ErrorKind, Result};
pub use gateway::Gateway;
pub use models::*;
pub use orchestrator::{BotHandle, Orchestrator, ShutdownReport};
pub use strategy::Strategy;
