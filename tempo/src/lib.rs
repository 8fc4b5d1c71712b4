//! Library surface of the `tempo` binary: configuration parsing and pass orchestration.

pub mod config;
pub mod orchestrator;

pub use config::{Config, ConfigError, PassConfig, PassKind};
pub use orchestrator::{execute, OrchestratorError};
