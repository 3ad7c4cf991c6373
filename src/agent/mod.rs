mod agent;
mod manager;
mod relationships;
mod runner;

pub use agent::{
    Agent, AgentSnapshot, AgentStatus, AgentType, LineType, OutputBuffer, OutputLine, ToolUse, Trigger,
};
pub use manager::{AgentManager, BatchOutcome, BulkAction, PoolSummary, SpawnOptions};
pub use relationships::{AgentRelationship, RelationshipGraph, RelationshipType};
pub use runner::{parse_stream_line, AgentProcess, RunOutcome, RunSignals, StreamItem};
