//! Real-user-monitoring agent: session tracking, bounded span buffering,
//! filtered export with retry, and main-loop stall detection.

pub mod config;
pub mod db;
pub mod error;
pub mod telemetry;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use telemetry::RumAgent;
