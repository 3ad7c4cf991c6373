use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::UsageMetrics;

/// Role an agent plays within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Coordinator,
    Worker,
    Evaluator,
}

impl AgentType {
    pub const ALL: [AgentType; 3] = [Self::Coordinator, Self::Worker, Self::Evaluator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
            Self::Evaluator => "evaluator",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "coordinator" => Some(Self::Coordinator),
            "worker" => Some(Self::Worker),
            "evaluator" => Some(Self::Evaluator),
            _ => None,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an agent slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

/// Anything that can move an agent between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Operator or orchestrator asked for a new run
    Start,
    /// Subprocess was launched successfully
    Launched,
    Pause,
    Resume,
    Kill,
    /// Subprocess exited cleanly, or a kill finished tearing it down
    Exited,
    /// Subprocess crashed, timed out or could not be launched
    Crashed,
}

impl AgentStatus {
    /// Stopped and failed runs are finished; the slot can be started again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Statuses that own a subprocess
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Failed)
    }

    /// Apply a trigger, returning the next status or `None` when the
    /// transition is not part of the lifecycle graph.
    pub fn next(self, trigger: Trigger) -> Option<AgentStatus> {
        use AgentStatus::*;
        match (self, trigger) {
            (Idle | Stopped | Failed, Trigger::Start) => Some(Starting),
            (Starting, Trigger::Launched) => Some(Running),
            (Running, Trigger::Pause) => Some(Paused),
            (Paused, Trigger::Resume) => Some(Running),
            (Idle | Starting | Running | Paused, Trigger::Kill) => Some(Stopping),
            (Running | Paused | Stopping, Trigger::Exited) => Some(Stopped),
            (Starting | Running | Paused, Trigger::Crashed) => Some(Failed),
            // A crash while tearing down still lands where the kill was heading
            (Stopping, Trigger::Crashed) => Some(Stopped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a single output record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Thinking,
    Text,
    ThinkingDelta,
    TextDelta,
    ToolUse,
    ToolResult,
    Result,
    Stderr,
    Error,
}

/// A single line of agent output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    /// Absolute position in the agent's output history
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(rename = "type")]
    pub line_type: LineType,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Bounded output history. Oldest lines are evicted first, sequence
/// numbers keep growing so pagination offsets stay meaningful.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    next_seq: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    pub fn push(
        &mut self,
        content: impl Into<String>,
        line_type: LineType,
        metadata: serde_json::Value,
    ) -> OutputLine {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        let line = OutputLine {
            seq: self.next_seq,
            timestamp: Utc::now(),
            content: content.into(),
            line_type,
            metadata,
        };
        self.next_seq += 1;
        self.lines.push_back(line.clone());
        line
    }

    /// Lines with `seq >= offset`, at most `limit` of them
    pub fn page(&self, offset: u64, limit: Option<usize>) -> Vec<OutputLine> {
        let iter = self.lines.iter().filter(|l| l.seq >= offset).cloned();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Total lines ever written, including evicted ones
    pub fn total(&self) -> u64 {
        self.next_seq
    }

    pub fn retained(&self) -> usize {
        self.lines.len()
    }

    /// Text and result content written at or after `from_seq`
    pub fn text_since(&self, from_seq: u64) -> String {
        self.lines
            .iter()
            .filter(|l| l.seq >= from_seq)
            .filter(|l| matches!(l.line_type, LineType::Text | LineType::Result))
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Record of a tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool: String,
    pub input: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

const FILE_EDITING_TOOLS: [&str; 3] = ["Edit", "Write", "MultiEdit"];

/// Supervised agent slot state
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub goal: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Reset on every start
    pub files_modified: BTreeSet<String>,
    /// Reset on every start
    pub tools_used: Vec<ToolUse>,
    pub error: Option<String>,
    /// Accumulates across runs of the slot
    pub usage: UsageMetrics,
    pub model: Option<String>,
    pub assigned_by: Option<String>,
    pub delegated_to: Vec<String>,
    pub waiting_for: Option<String>,
    /// Accumulates across runs of the slot
    pub output: OutputBuffer,
    /// First output sequence number of the current run
    pub run_output_start: u64,
}

impl Agent {
    pub fn new(id: impl Into<String>, agent_type: AgentType, output_capacity: usize) -> Self {
        Self {
            id: id.into(),
            agent_type,
            status: AgentStatus::Idle,
            current_task: None,
            goal: None,
            started_at: None,
            finished_at: None,
            files_modified: BTreeSet::new(),
            tools_used: Vec::new(),
            error: None,
            usage: UsageMetrics::default(),
            model: None,
            assigned_by: None,
            delegated_to: Vec::new(),
            waiting_for: None,
            output: OutputBuffer::new(output_capacity),
            run_output_start: 0,
        }
    }

    /// Reset per-run bookkeeping before a new start
    pub fn begin_run(&mut self) {
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.error = None;
        self.tools_used.clear();
        self.files_modified.clear();
        self.run_output_start = self.output.total();
    }

    pub fn record_tool_use(&mut self, tool: ToolUse) {
        if FILE_EDITING_TOOLS.contains(&tool.tool.as_str()) {
            let name = tool
                .input
                .get("file_path")
                .and_then(|v| v.as_str())
                .and_then(|p| Path::new(p).file_name())
                .map(|n| n.to_string_lossy().into_owned());
            if let Some(name) = name {
                self.files_modified.insert(name);
            }
        }
        self.tools_used.push(tool);
    }

    /// Tool invocation counts for the current run
    pub fn tool_counts(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for tool in &self.tools_used {
            *counts.entry(tool.tool.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Text produced by the current run, used to parse decisions and verdicts
    pub fn run_text(&self) -> String {
        self.output.text_since(self.run_output_start)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            agent_type: self.agent_type,
            status: self.status,
            current_task: self.current_task.clone(),
            goal: self.goal.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            files_modified: self.files_modified.iter().cloned().collect(),
            tools_used: self.tools_used.len() as u64,
            output_lines: self.output.total(),
            error: self.error.clone(),
            usage: self.usage.clone(),
            model: self.model.clone(),
            assigned_by: self.assigned_by.clone(),
            delegated_to: self.delegated_to.clone(),
            waiting_for: self.waiting_for.clone(),
        }
    }
}

/// Read-only view of an agent handed to the query surface and events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub goal: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files_modified: Vec<String>,
    pub tools_used: u64,
    pub output_lines: u64,
    pub error: Option<String>,
    pub usage: UsageMetrics,
    pub model: Option<String>,
    pub assigned_by: Option<String>,
    pub delegated_to: Vec<String>,
    pub waiting_for: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_start_reenters_from_finished_states() {
        for status in [AgentStatus::Idle, AgentStatus::Stopped, AgentStatus::Failed] {
            assert_eq!(status.next(Trigger::Start), Some(AgentStatus::Starting));
        }
        assert_eq!(AgentStatus::Running.next(Trigger::Start), None);
        assert_eq!(AgentStatus::Stopping.next(Trigger::Start), None);
    }

    #[test]
    fn test_pause_resume_edges() {
        assert_eq!(AgentStatus::Running.next(Trigger::Pause), Some(AgentStatus::Paused));
        assert_eq!(AgentStatus::Paused.next(Trigger::Resume), Some(AgentStatus::Running));
        assert_eq!(AgentStatus::Idle.next(Trigger::Pause), None);
        assert_eq!(AgentStatus::Running.next(Trigger::Resume), None);
    }

    #[test]
    fn test_kill_only_from_non_terminal() {
        assert_eq!(AgentStatus::Paused.next(Trigger::Kill), Some(AgentStatus::Stopping));
        assert_eq!(AgentStatus::Stopped.next(Trigger::Kill), None);
        assert_eq!(AgentStatus::Failed.next(Trigger::Kill), None);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&AgentStatus::Paused).unwrap(), "\"paused\"");
        let t: AgentType = serde_json::from_str("\"evaluator\"").unwrap();
        assert_eq!(t, AgentType::Evaluator);
    }

    fn arb_trigger() -> impl Strategy<Value = Trigger> {
        prop_oneof![
            Just(Trigger::Start),
            Just(Trigger::Launched),
            Just(Trigger::Pause),
            Just(Trigger::Resume),
            Just(Trigger::Kill),
            Just(Trigger::Exited),
            Just(Trigger::Crashed),
        ]
    }

    fn is_declared_edge(from: AgentStatus, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (from, to),
            (Idle | Stopped | Failed, Starting)
                | (Starting, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Idle | Starting | Running | Paused, Stopping)
                | (Running | Paused | Stopping, Stopped)
                | (Starting | Running | Paused, Failed)
        )
    }

    proptest! {
        #[test]
        fn prop_status_stays_on_lifecycle_graph(triggers in prop::collection::vec(arb_trigger(), 0..64)) {
            let mut status = AgentStatus::Idle;
            for trigger in triggers {
                if let Some(next) = status.next(trigger) {
                    prop_assert!(is_declared_edge(status, next), "{status} -> {next}");
                    status = next;
                }
            }
        }
    }

    #[test]
    fn test_output_buffer_evicts_oldest() {
        let mut buf = OutputBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line {i}"), LineType::Text, serde_json::Value::Null);
        }
        assert_eq!(buf.total(), 5);
        assert_eq!(buf.retained(), 3);

        let page = buf.page(0, None);
        assert_eq!(page.first().unwrap().seq, 2);
        assert_eq!(page.last().unwrap().content, "line 4");
    }

    #[test]
    fn test_output_buffer_pages_from_offset() {
        let mut buf = OutputBuffer::new(10);
        for i in 0..6 {
            buf.push(format!("line {i}"), LineType::Text, serde_json::Value::Null);
        }
        let page = buf.page(2, Some(2));
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "line 2");
        assert_eq!(page[1].content, "line 3");
        assert!(buf.page(6, None).is_empty());
    }

    #[test]
    fn test_record_tool_use_tracks_edited_files() {
        let mut agent = Agent::new("worker-1", AgentType::Worker, 10);
        agent.record_tool_use(ToolUse {
            tool: "Edit".into(),
            input: json!({"file_path": "/repo/src/lib.rs"}),
            timestamp: Utc::now(),
        });
        agent.record_tool_use(ToolUse {
            tool: "Read".into(),
            input: json!({"file_path": "/repo/src/main.rs"}),
            timestamp: Utc::now(),
        });
        agent.record_tool_use(ToolUse {
            tool: "Write".into(),
            input: json!({"file_path": "/repo/src/lib.rs"}),
            timestamp: Utc::now(),
        });

        assert_eq!(agent.files_modified.len(), 1);
        assert!(agent.files_modified.contains("lib.rs"));
        assert_eq!(agent.tool_counts().get("Edit"), Some(&1));
        assert_eq!(agent.snapshot().tools_used, 3);
    }

    #[test]
    fn test_run_text_only_covers_current_run() {
        let mut agent = Agent::new("coordinator-1", AgentType::Coordinator, 10);
        agent.output.push("EVOLVE: old run", LineType::Text, serde_json::Value::Null);
        agent.begin_run();
        agent.output.push("thinking...", LineType::Thinking, serde_json::Value::Null);
        agent.output.push("DONE: nothing left", LineType::Result, serde_json::Value::Null);

        assert_eq!(agent.run_text(), "DONE: nothing left");
        assert_eq!(agent.snapshot().output_lines, 3);
    }
}
