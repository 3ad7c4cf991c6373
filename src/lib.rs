//! Supervises a pool of coding-agent subprocesses and drives them through
//! coordinate → work → evaluate cycles.
//!
//! [`AgentManager`] owns the pool, [`Orchestrator`] runs the cycle loop on
//! top of it, and the [`comms`] module carries guidance to agents and events
//! to observers.

pub mod agent;
pub mod comms;
pub mod config;
pub mod error;
pub mod git;
pub mod orchestrator;
pub mod usage;
pub mod watch;

pub use agent::{AgentManager, AgentSnapshot, AgentStatus, AgentType, BulkAction};
pub use comms::{Event, EventBus, GuidanceChannel};
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Cycle, CyclePhase, Orchestrator, OrchestratorStatus, RunOptions, TaskType};
pub use usage::{DailyUsage, UsageAggregator, UsageMetrics};
pub use watch::StateWatcher;
