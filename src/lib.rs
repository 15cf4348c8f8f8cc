//! Stagemem - multi-stage agent memory and task dispatch
//!
//! Classifies work requests into agent tasks, runs them concurrently on
//! registered agents, and keeps their results in a memory store whose
//! entries move between working, short-term and long-term stages.

pub mod agents;
pub mod background;
pub mod config;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod memory;
pub mod orchestrator;
pub mod persist;
pub mod runtime;
pub mod scheduler;
pub mod types;

pub use agents::{AgentExecutor, AgentPool, ExecutionContext, ExecutionError};
pub use config::CoreConfig;
pub use error::{Result, StageMemError};
pub use memory::MemoryStore;
pub use orchestrator::Orchestrator;
pub use runtime::AgentCore;
pub use scheduler::StageScheduler;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
