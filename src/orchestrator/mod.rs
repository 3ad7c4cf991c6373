mod cycle;
mod decision;
mod engine;
mod prompts;

pub use cycle::{Cycle, CycleHistory, CyclePage, CyclePhase, TaskType};
pub use decision::{parse_decision, parse_verdict, Decision, Verdict};
pub use engine::{Orchestrator, OrchestratorStatus, RunOptions};
pub use prompts::{PromptLibrary, PromptTemplate};
