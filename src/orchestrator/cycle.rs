use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of work the coordinator picked for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    Evolve,
    Cleanup,
    Bugfix,
    Done,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [Self::Evolve, Self::Cleanup, Self::Bugfix, Self::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evolve => "EVOLVE",
            Self::Cleanup => "CLEANUP",
            Self::Bugfix => "BUGFIX",
            Self::Done => "DONE",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CyclePhase {
    #[default]
    Idle,
    Coordinating,
    Working,
    Evaluating,
    Completed,
    Failed,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Coordinating => "COORDINATING",
            Self::Working => "WORKING",
            Self::Evaluating => "EVALUATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one cycle attempt. Never modified after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cycle {
    pub cycle: u64,
    pub task_type: TaskType,
    pub description: String,
    pub success: bool,
    pub files_modified: Vec<String>,
    pub tools_used: BTreeMap<String, u64>,
    pub duration_seconds: f64,
    pub commit_hash: Option<String>,
    pub error: Option<String>,
}

impl Cycle {
    pub fn failed(
        cycle: u64,
        task_type: TaskType,
        description: impl Into<String>,
        error: impl Into<String>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            cycle,
            task_type,
            description: description.into(),
            success: false,
            files_modified: Vec::new(),
            tools_used: BTreeMap::new(),
            duration_seconds,
            commit_hash: None,
            error: Some(error.into()),
        }
    }
}

/// A page of cycles, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CyclePage {
    pub cycles: Vec<Cycle>,
    pub total: usize,
}

/// Most recent cycles, oldest evicted first
#[derive(Debug, Clone)]
pub struct CycleHistory {
    cycles: VecDeque<Cycle>,
    limit: usize,
}

impl CycleHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            cycles: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, cycle: Cycle) {
        if self.cycles.len() >= self.limit {
            self.cycles.pop_front();
        }
        self.cycles.push_back(cycle);
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    pub fn get(&self, cycle: u64) -> Option<&Cycle> {
        self.cycles.iter().find(|c| c.cycle == cycle)
    }

    /// Last `n` cycles in the order they ran
    pub fn recent(&self, n: usize) -> Vec<Cycle> {
        let skip = self.cycles.len().saturating_sub(n);
        self.cycles.iter().skip(skip).cloned().collect()
    }

    /// Newest first; `offset` counts back from the newest cycle
    pub fn page(&self, limit: usize, offset: usize) -> CyclePage {
        CyclePage {
            cycles: self.cycles.iter().rev().skip(offset).take(limit).cloned().collect(),
            total: self.cycles.len(),
        }
    }
}
