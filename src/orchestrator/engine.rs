//! The coordinate → work → evaluate loop.
//!
//! One background task drives the cycles. It suspends on agent status
//! watches and wakes on a terminal status or on a force-stop cancellation.
//! A stop request is honored at the next phase boundary.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::{Local, Utc};
use parking_lot::Mutex;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cycle::{Cycle, CycleHistory, CyclePage, CyclePhase, TaskType};
use super::decision::{parse_decision, parse_verdict, Decision, Verdict};
use super::prompts::{
    feedback_section, guidance_section, recent_log_entries, render, PromptLibrary, PromptTemplate,
};
use crate::agent::{AgentManager, AgentSnapshot, AgentStatus, AgentType, BulkAction, PoolSummary, RelationshipType, SpawnOptions};
use crate::comms::Event;
use crate::config::OrchestratorSettings;
use crate::error::{Error, Result};
use crate::git::GitWorkspace;

/// Log entries shown to the coordinator
const LOG_ENTRIES_IN_PROMPT: usize = 10;
const DRY_RUN_DESCRIPTION: &str = "Dry run - no action";

/// How one `start` runs
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Cycle limit; falls back to the configured one
    pub max_cycles: Option<u64>,
    /// Build the coordinator prompt but launch no agents
    pub dry_run: bool,
}

/// Snapshot returned by status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub running: bool,
    pub cycle: u64,
    pub phase: CyclePhase,
    pub agent_pool: PoolSummary,
    pub recent_cycles: Vec<Cycle>,
}

struct LoopState {
    cycle: u64,
    phase: CyclePhase,
    stop_requested: bool,
    consecutive_failures: u32,
    history: CycleHistory,
    /// Agents acquired by the cycle in flight
    cycle_agents: Vec<String>,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A decision being carried out, possibly on a retry
#[derive(Debug, Clone)]
struct Plan {
    decision: Decision,
    coordinator_id: String,
    feedback: Option<String>,
    attempt: u32,
}

/// Why a cycle ended early
enum Abort {
    /// Stop or force stop
    Halted(String),
    Failed { error: String, feedback: Option<String> },
}

impl Abort {
    fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            feedback: None,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Halted(reason) => reason,
            Self::Failed { error, .. } => error,
        }
    }
}

enum Next {
    Continue,
    Retry(Plan),
    Done,
}

pub struct Orchestrator {
    agents: Arc<AgentManager>,
    prompts: PromptLibrary,
    workspace: GitWorkspace,
    settings: OrchestratorSettings,
    running: watch::Sender<bool>,
    state: Mutex<LoopState>,
    handle: Mutex<Option<LoopHandle>>,
}

impl Orchestrator {
    pub fn new(agents: Arc<AgentManager>) -> Self {
        let config = agents.config();
        let settings = config.orchestrator.clone();
        let prompts = PromptLibrary::new(config.prompts_dir());
        let workspace = GitWorkspace::new(config.project_root.clone());
        let (running, _) = watch::channel(false);
        Self {
            state: Mutex::new(LoopState {
                cycle: 0,
                phase: CyclePhase::Idle,
                stop_requested: false,
                consecutive_failures: 0,
                history: CycleHistory::new(settings.history_limit),
                cycle_agents: Vec::new(),
            }),
            agents,
            prompts,
            workspace,
            settings,
            running,
            handle: Mutex::new(None),
        }
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Start the loop. Returns false if it is already running.
    pub fn start(self: &Arc<Self>, options: RunOptions) -> bool {
        let started = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !started {
            debug!("Orchestrator already running");
            return false;
        }

        {
            let mut state = self.state.lock();
            state.stop_requested = false;
            state.consecutive_failures = 0;
        }
        let options = RunOptions {
            max_cycles: options.max_cycles.or(self.settings.max_cycles),
            ..options
        };
        info!(max_cycles = ?options.max_cycles, dry_run = options.dry_run, "Orchestrator started");
        self.agents.events().publish(Event::OrchestratorStarted {
            max_cycles: options.max_cycles,
        });

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let task = tokio::spawn(this.run_loop(cancel.clone(), options));
        *self.handle.lock() = Some(LoopHandle { cancel, task });
        true
    }

    /// Finish at the next phase boundary
    pub fn stop(&self) {
        if self.is_running() {
            info!("Stop requested");
            self.state.lock().stop_requested = true;
        }
    }

    /// Kill the cycle's agents and wait for the loop to exit
    pub async fn force_stop(&self) {
        self.state.lock().stop_requested = true;
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        info!("Force stopping orchestrator");
        handle.cancel.cancel();

        let agents = self.state.lock().cycle_agents.clone();
        let outcome = self.agents.bulk_action(&agents, BulkAction::Kill).await;
        if !outcome.is_success() {
            warn!(result = %outcome.message(&BulkAction::Kill), "Some cycle agents could not be killed");
        }
        if let Err(e) = handle.task.await {
            warn!(error = %e, "Orchestrator loop ended abnormally");
        }
    }

    /// Resolves once the loop is no longer running
    pub async fn wait_stopped(&self) {
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|r| !*r).await;
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let (cycle, phase, recent_cycles) = {
            let state = self.state.lock();
            (state.cycle, state.phase, state.history.recent(self.settings.recent_cycles))
        };
        OrchestratorStatus {
            running: self.is_running(),
            cycle,
            phase,
            agent_pool: self.agents.pool_summary(),
            recent_cycles,
        }
    }

    pub fn list_cycles(&self, limit: usize, offset: usize) -> CyclePage {
        self.state.lock().history.page(limit, offset)
    }

    pub fn get_cycle(&self, cycle: u64) -> Result<Cycle> {
        self.state
            .lock()
            .history
            .get(cycle)
            .cloned()
            .ok_or_else(|| Error::cycle_not_found(cycle))
    }

    pub fn get_prompt(&self, name: &str) -> Result<PromptTemplate> {
        self.prompts.load(name)
    }

    pub fn list_prompts(&self) -> Result<Vec<PromptTemplate>> {
        self.prompts.list()
    }

    /// Save a custom template; used from the next cycle on
    pub fn update_prompt(&self, name: &str, content: &str) -> Result<()> {
        self.prompts.save(name, content)?;
        info!(name, "Prompt updated");
        self.agents.events().publish(Event::PromptUpdated {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken, options: RunOptions) {
        let mut attempted = 0u64;
        let mut retry: Option<Plan> = None;

        let end_phase = loop {
            if cancel.is_cancelled() {
                break CyclePhase::Failed;
            }
            {
                let state = self.state.lock();
                if state.stop_requested {
                    break CyclePhase::Idle;
                }
                if state.consecutive_failures >= self.settings.max_consecutive_failures {
                    warn!(failures = state.consecutive_failures, "Too many consecutive failures");
                    break CyclePhase::Failed;
                }
            }
            if options.max_cycles.is_some_and(|max| attempted >= max) {
                info!(cycles = attempted, "Cycle limit reached");
                break CyclePhase::Completed;
            }

            attempted += 1;
            let cycle = self.begin_cycle();
            let (record, next) = self.run_cycle(cycle, retry.take(), options.dry_run, &cancel).await;
            self.record(record).await;

            match next {
                Next::Continue => {}
                Next::Retry(plan) => retry = Some(plan),
                Next::Done => break CyclePhase::Completed,
            }
        };

        let current = self.state.lock().phase;
        if end_phase != CyclePhase::Idle && end_phase != current {
            self.set_phase(end_phase);
        }
        self.set_phase(CyclePhase::Idle);
        let cycle = self.state.lock().cycle;
        info!(cycle, phase = %end_phase, "Orchestrator stopped");
        self.agents.events().publish(Event::OrchestratorStopped {
            cycle,
            phase: end_phase,
        });
        self.running.send_replace(false);
    }

    /// Next cycle number; never reused, even across restarts
    fn begin_cycle(&self) -> u64 {
        let cycle = {
            let mut state = self.state.lock();
            state.cycle += 1;
            state.cycle_agents.clear();
            state.cycle
        };
        info!(cycle, "Cycle started");
        self.agents.events().publish(Event::CycleStarted { cycle });
        cycle
    }

    async fn run_cycle(
        &self,
        cycle: u64,
        retry: Option<Plan>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> (Cycle, Next) {
        let started = Instant::now();

        let plan = match retry {
            Some(plan) => plan,
            None => match self.coordinate(dry_run, cancel).await {
                Ok(plan) => plan,
                Err(abort) => {
                    let record = Cycle::failed(
                        cycle,
                        TaskType::Evolve,
                        "Unknown",
                        abort.message(),
                        started.elapsed().as_secs_f64(),
                    );
                    return (record, Next::Continue);
                }
            },
        };
        let decision = &plan.decision;

        if decision.task_type == TaskType::Done {
            info!(cycle, reason = %decision.description, "Coordinator reports nothing left to do");
            let record = Cycle {
                cycle,
                task_type: TaskType::Done,
                description: decision.description.clone(),
                success: true,
                files_modified: Vec::new(),
                tools_used: BTreeMap::new(),
                duration_seconds: started.elapsed().as_secs_f64(),
                commit_hash: None,
                error: None,
            };
            return (record, Next::Done);
        }

        match self.implement(&plan, cancel).await {
            Ok(worker) => {
                let tools_used = self.agents.tool_counts(&worker.id).unwrap_or_default();
                let record = Cycle {
                    cycle,
                    task_type: decision.task_type,
                    description: decision.description.clone(),
                    success: true,
                    files_modified: worker.files_modified,
                    tools_used,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    commit_hash: self.head_commit().await,
                    error: None,
                };
                self.set_phase(CyclePhase::Completed);
                (record, Next::Continue)
            }
            Err(abort) => {
                self.rollback().await;
                let record = Cycle::failed(
                    cycle,
                    decision.task_type,
                    decision.description.clone(),
                    abort.message(),
                    started.elapsed().as_secs_f64(),
                );
                let next = match abort {
                    Abort::Failed { feedback, .. } if plan.attempt < self.settings.max_worker_retries => {
                        info!(cycle, attempt = plan.attempt + 1, "Retrying work phase");
                        Next::Retry(Plan {
                            feedback,
                            attempt: plan.attempt + 1,
                            ..plan.clone()
                        })
                    }
                    _ => Next::Continue,
                };
                (record, next)
            }
        }
    }

    async fn coordinate(&self, dry_run: bool, cancel: &CancellationToken) -> std::result::Result<Plan, Abort> {
        self.set_phase(CyclePhase::Coordinating);
        let config = self.agents.config();
        let template = self.template(AgentType::Coordinator)?;

        let log = read_or_empty(&config.log_file()).await;
        let mut vars = BTreeMap::new();
        vars.insert("STATE", read_or_empty(&config.state_file()).await);
        vars.insert("LOG", recent_log_entries(&log, LOG_ENTRIES_IN_PROMPT));
        vars.insert("PROJECT", read_or_empty(&config.project_file()).await);
        vars.insert(
            "INJECTED_GUIDANCE",
            guidance_section(self.guidance_for(AgentType::Coordinator).await.as_deref()),
        );

        let prompt = render(&template, &vars);
        if dry_run {
            info!(bytes = prompt.len(), "Dry run, coordinator not launched");
            debug!(%prompt, "Coordinator prompt");
            return Ok(Plan {
                decision: Decision {
                    task_type: TaskType::Done,
                    description: DRY_RUN_DESCRIPTION.into(),
                    task_xml: DRY_RUN_DESCRIPTION.into(),
                    files: Vec::new(),
                    skills: Vec::new(),
                },
                coordinator_id: String::new(),
                feedback: None,
                attempt: 0,
            });
        }

        let id = self.acquire(AgentType::Coordinator, SpawnOptions::default())?;
        self.run_agent(&id, &prompt, cancel).await?;

        let output = self.agents.run_text(&id).map_err(|e| Abort::failed(e.to_string()))?;
        let decision = parse_decision(&output)
            .ok_or_else(|| Abort::failed("Could not parse coordinator decision"))?;
        info!(task_type = %decision.task_type, description = %decision.description, "Coordinator decided");
        Ok(Plan {
            decision,
            coordinator_id: id,
            feedback: None,
            attempt: 0,
        })
    }

    /// Work then evaluate. Returns the worker's record on a passing verdict.
    async fn implement(&self, plan: &Plan, cancel: &CancellationToken) -> std::result::Result<AgentSnapshot, Abort> {
        let decision = &plan.decision;
        let config = self.agents.config();
        let project = read_or_empty(&config.project_file()).await;

        self.check_boundary("work")?;
        self.set_phase(CyclePhase::Working);
        let template = self.template(AgentType::Worker)?;
        let mut vars = BTreeMap::new();
        vars.insert("PROJECT", project.clone());
        vars.insert("TASK_TYPE", decision.task_type.to_string());
        vars.insert("TASK_XML", decision.task_xml.clone());
        vars.insert("FEEDBACK", feedback_section(plan.feedback.as_deref()));
        vars.insert(
            "INJECTED_GUIDANCE",
            guidance_section(self.guidance_for(AgentType::Worker).await.as_deref()),
        );

        let worker_id = self.acquire(
            AgentType::Worker,
            SpawnOptions {
                assigned_by: Some(plan.coordinator_id.clone()),
                current_task: Some(decision.description.clone()),
                ..SpawnOptions::default()
            },
        )?;
        let worker = self.run_agent(&worker_id, &render(&template, &vars), cancel).await?;
        let report = self.agents.run_text(&worker_id).unwrap_or_default();

        self.check_boundary("evaluation")?;
        self.set_phase(CyclePhase::Evaluating);
        let template = self.template(AgentType::Evaluator)?;
        let mut vars = BTreeMap::new();
        vars.insert("PROJECT", project);
        vars.insert("TASK_TYPE", decision.task_type.to_string());
        vars.insert("TASK_XML", decision.task_xml.clone());
        vars.insert("RESULT", report);
        vars.insert(
            "INJECTED_GUIDANCE",
            guidance_section(self.guidance_for(AgentType::Evaluator).await.as_deref()),
        );

        let evaluator_id = self.acquire(
            AgentType::Evaluator,
            SpawnOptions {
                assigned_by: Some(plan.coordinator_id.clone()),
                current_task: Some(format!("Review: {}", decision.description)),
                ..SpawnOptions::default()
            },
        )?;
        if let Err(e) = self.agents.add_relationship(
            &worker_id,
            &evaluator_id,
            RelationshipType::DataFlow,
            Some("work result".into()),
        ) {
            warn!(error = %e, "Failed to record data flow");
        }
        self.run_agent(&evaluator_id, &render(&template, &vars), cancel).await?;

        let review = self.agents.run_text(&evaluator_id).unwrap_or_default();
        match parse_verdict(&review) {
            Some(Verdict::Passed) => Ok(worker),
            Some(Verdict::Failed) => Err(Abort::Failed {
                error: "Evaluation failed".into(),
                feedback: Some(review),
            }),
            None => Err(Abort::Failed {
                error: "Evaluator gave no verdict".into(),
                feedback: Some(review),
            }),
        }
    }

    fn check_boundary(&self, next_phase: &str) -> std::result::Result<(), Abort> {
        if self.state.lock().stop_requested {
            info!(next_phase, "Stopping at phase boundary");
            return Err(Abort::Halted(format!("Stopped before {} phase", next_phase)));
        }
        Ok(())
    }

    fn acquire(&self, agent_type: AgentType, options: SpawnOptions) -> std::result::Result<String, Abort> {
        let id = self
            .agents
            .acquire_agent(agent_type, options)
            .map_err(|e| Abort::failed(e.to_string()))?;
        self.state.lock().cycle_agents.push(id.clone());
        Ok(id)
    }

    /// Start `id` and wait for it to finish. A crashed agent aborts the cycle.
    async fn run_agent(
        &self,
        id: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<AgentSnapshot, Abort> {
        self.agents
            .start_agent(id, prompt)
            .await
            .map_err(|e| Abort::failed(e.to_string()))?;

        let finished = tokio::select! {
            _ = cancel.cancelled() => None,
            snapshot = self.agents.wait_for_terminal(id) => Some(snapshot),
        };
        let Some(snapshot) = finished else {
            if let Err(e) = self.agents.kill_agent(id).await {
                warn!(agent_id = %id, error = %e, "Failed to kill agent");
            }
            return Err(Abort::Halted("Force stopped".into()));
        };

        let snapshot = snapshot.map_err(|e| Abort::failed(e.to_string()))?;
        if snapshot.status == AgentStatus::Failed {
            let error = snapshot
                .error
                .clone()
                .unwrap_or_else(|| format!("{} failed", snapshot.agent_type));
            return Err(Abort::Failed {
                feedback: Some(error.clone()),
                error,
            });
        }
        Ok(snapshot)
    }

    fn template(&self, role: AgentType) -> std::result::Result<String, Abort> {
        self.prompts
            .load(role.as_str())
            .map(|t| t.content)
            .map_err(|e| Abort::failed(e.to_string()))
    }

    async fn guidance_for(&self, role: AgentType) -> Option<String> {
        match self.agents.guidance().read_for_type(role.as_str()).await {
            Ok(guidance) => guidance,
            Err(e) => {
                warn!(role = %role, error = %e, "Failed to read guidance");
                None
            }
        }
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.state.lock().phase = phase;
        debug!(phase = %phase, "Phase changed");
        self.agents.events().publish(Event::PhaseChanged { phase });
    }

    async fn record(&self, record: Cycle) {
        {
            let mut state = self.state.lock();
            if record.success {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
            }
            state.history.push(record.clone());
        }
        self.agents.usage().record_cycle(record.success, Utc::now());

        let cycle = record.cycle;
        if record.success {
            info!(cycle, duration = record.duration_seconds, "Cycle completed");
            if record.task_type != TaskType::Done {
                if let Err(e) = self.write_state_files(&record).await {
                    warn!(cycle, error = %e, "Failed to update state files");
                }
            }
            self.agents.events().publish(Event::CycleCompleted { cycle, result: record });
        } else {
            warn!(cycle, error = record.error.as_deref().unwrap_or_default(), "Cycle failed");
            self.agents.events().publish(Event::CycleFailed { cycle, result: record });
        }
    }

    async fn write_state_files(&self, record: &Cycle) -> std::io::Result<()> {
        static CYCLE_LINE: OnceLock<Regex> = OnceLock::new();
        static UPDATED_LINE: OnceLock<Regex> = OnceLock::new();
        let cycle_line = CYCLE_LINE.get_or_init(|| Regex::new(r"\*\*Cycle\*\*: \d+").expect("valid cycle regex"));
        let updated_line =
            UPDATED_LINE.get_or_init(|| Regex::new(r"\*\*Last Updated\*\*: .*").expect("valid timestamp regex"));

        let config = self.agents.config();
        let state_file = config.state_file();
        if let Ok(content) = tokio::fs::read_to_string(&state_file).await {
            let cycle = format!("**Cycle**: {}", record.cycle);
            let updated = format!("**Last Updated**: {}", Local::now().to_rfc3339());
            let content = cycle_line.replace(&content, NoExpand(&cycle));
            let content = updated_line.replace(&content, NoExpand(&updated));
            tokio::fs::write(&state_file, content.as_bytes()).await?;
        }

        tokio::fs::create_dir_all(config.state_dir()).await?;
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_file())
            .await?;
        log.write_all(log_entry(record).as_bytes()).await?;
        log.flush().await
    }

    async fn head_commit(&self) -> Option<String> {
        let workspace = self.workspace.clone();
        match tokio::task::spawn_blocking(move || workspace.head_commit()).await {
            Ok(Ok(hash)) => Some(hash),
            Ok(Err(e)) => {
                debug!(error = %e, "No commit hash for cycle");
                None
            }
            Err(_) => None,
        }
    }

    /// Discard uncommitted work when the project is a git repository
    async fn rollback(&self) {
        let workspace = self.workspace.clone();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<bool>> {
            if !workspace.is_git_repo() {
                return Ok(None);
            }
            if !workspace.has_changes()? {
                return Ok(Some(false));
            }
            workspace.rollback()?;
            Ok(Some(true))
        })
        .await;
        let root = self.workspace.root().display();
        match &result {
            Ok(Ok(Some(true))) => info!(root = %root, "Rolled back workspace"),
            Ok(Ok(Some(false))) => debug!(root = %root, "Workspace clean, nothing to roll back"),
            Ok(Ok(None)) => debug!(root = %root, "Not a git repository, nothing to roll back"),
            Ok(Err(e)) => warn!(root = %root, error = %e, "Rollback failed"),
            Err(e) => warn!(error = %e, "Rollback task failed"),
        }
    }
}

async fn read_or_empty(path: &std::path::Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

fn log_entry(record: &Cycle) -> String {
    let summary = record.description.lines().next().unwrap_or_default();
    let mut entry = format!(
        "\n## Cycle {}: {} - {}\n\n- **Duration**: {:.1}s\n",
        record.cycle, record.task_type, summary, record.duration_seconds
    );
    if !record.files_modified.is_empty() {
        entry.push_str(&format!("- **Files**: {}\n", record.files_modified.join(", ")));
    }
    if let Some(hash) = &record.commit_hash {
        entry.push_str(&format!("- **Commit**: {}\n", hash));
    }
    entry
}
