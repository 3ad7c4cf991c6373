//! Agent pool: a registry of supervised slots keyed by id.
//!
//! Every mutating operation on one id takes that slot's operation lock, so
//! transitions for a single agent are totally ordered while different agents
//! never wait on each other. Record reads only take the short state lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::agent::{Agent, AgentSnapshot, AgentStatus, AgentType, LineType, OutputLine, ToolUse, Trigger};
use super::relationships::{AgentRelationship, RelationshipGraph, RelationshipType};
use super::runner::{AgentProcess, RunOutcome, RunSignals, StreamItem};
use crate::comms::{Event, EventBus, GuidanceChannel, GuidanceEntry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::usage::{UsageAggregator, UsageMetrics};

/// Attempts at drawing an unused id before giving up
const ID_ATTEMPTS: usize = 16;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Optional fields for a new slot
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Agent that asked for this one; recorded as a delegation
    pub assigned_by: Option<String>,
    pub model: Option<String>,
    pub current_task: Option<String>,
    pub goal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Pause,
    Resume,
    Kill,
    Stop,
    Guidance(String),
}

impl BulkAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Kill => "kill",
            Self::Stop => "stop",
            Self::Guidance(_) => "guidance",
        }
    }
}

/// Per-id results of a bulk action
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: BTreeMap<String, Result<()>>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.results.values().all(|r| r.is_ok())
    }

    /// Operator-facing summary, e.g. `pause executed on 2/3 agents`
    pub fn message(&self, action: &BulkAction) -> String {
        format!(
            "{} executed on {}/{} agents",
            action.name(),
            self.succeeded().len(),
            self.results.len()
        )
    }

    /// Ids that succeeded, or [`Error::PartialBatchFailure`] naming each failed id
    pub fn into_result(self) -> Result<Vec<String>> {
        let mut succeeded = Vec::new();
        let mut failed = BTreeMap::new();
        for (id, result) in self.results {
            match result {
                Ok(()) => succeeded.push(id),
                Err(e) => {
                    failed.insert(id, e.to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(succeeded)
        } else {
            Err(Error::PartialBatchFailure { failed })
        }
    }
}

/// Pool overview for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub total_agents: usize,
    pub running_agents: usize,
    pub agents: BTreeMap<String, Vec<AgentSnapshot>>,
    pub relationships: Vec<AgentRelationship>,
    pub total_usage: UsageMetrics,
}

struct RunControl {
    cancel: CancellationToken,
    terminate: CancellationToken,
    pause: watch::Sender<bool>,
}

struct AgentHandle {
    id: String,
    /// Serializes transitions for this id
    ops: tokio::sync::Mutex<()>,
    state: Mutex<Agent>,
    status: watch::Sender<AgentStatus>,
    run: Mutex<Option<RunControl>>,
}

impl AgentHandle {
    fn new(agent: Agent) -> Self {
        let (status, _) = watch::channel(agent.status);
        Self {
            id: agent.id.clone(),
            ops: tokio::sync::Mutex::new(()),
            state: Mutex::new(agent),
            status,
            run: Mutex::new(None),
        }
    }

    fn status(&self) -> AgentStatus {
        self.state.lock().status
    }

    fn snapshot(&self) -> AgentSnapshot {
        self.state.lock().snapshot()
    }

    /// Apply `trigger` or fail with `InvalidState`. Events for one agent are
    /// published under its state lock so observers see them in order.
    fn transition(&self, trigger: Trigger, operation: &'static str, events: &EventBus) -> Result<AgentStatus> {
        let mut agent = self.state.lock();
        let next = agent.status.next(trigger).ok_or_else(|| Error::InvalidState {
            id: agent.id.clone(),
            status: agent.status,
            operation,
        })?;
        debug!(agent_id = %agent.id, from = %agent.status, to = %next, "Agent transition");
        agent.status = next;
        if next.is_terminal() {
            agent.finished_at = Some(Utc::now());
        }
        self.status.send_replace(next);
        events.publish(Event::AgentStatus {
            agent_id: agent.id.clone(),
            status: next,
            error: agent.error.clone(),
        });
        Ok(next)
    }

    fn push_output(&self, content: String, line_type: LineType, events: &EventBus) -> OutputLine {
        let mut agent = self.state.lock();
        let line = agent.output.push(content, line_type, serde_json::Value::Null);
        events.publish(Event::AgentOutput {
            agent_id: agent.id.clone(),
            line: line.clone(),
        });
        line
    }
}

type Registry = Arc<DashMap<String, Arc<AgentHandle>>>;

/// Permanently complete the edges `agent_id` finishing closes, and announce them
fn settle_relationships(
    agents: &Registry,
    relationships: &Mutex<RelationshipGraph>,
    events: &EventBus,
    agent_id: &str,
) {
    let live: HashSet<String> = agents
        .iter()
        .filter(|entry| entry.value().status().is_live())
        .map(|entry| entry.key().clone())
        .collect();
    let changed = relationships.lock().complete_finished(agent_id, &live);
    for relationship in changed {
        events.publish(Event::RelationshipChanged { relationship });
    }
}

/// Owns the agent pool
pub struct AgentManager {
    config: Arc<Config>,
    agents: Registry,
    relationships: Arc<Mutex<RelationshipGraph>>,
    events: EventBus,
    guidance: Arc<GuidanceChannel>,
    usage: Arc<UsageAggregator>,
}

impl AgentManager {
    pub fn new(config: Arc<Config>, events: EventBus) -> Result<Self> {
        let guidance = Arc::new(GuidanceChannel::from_config(&config)?);
        let usage = Arc::new(UsageAggregator::with_offset_minutes(
            config.usage.utc_offset_minutes,
        ));
        Ok(Self::with_parts(config, events, guidance, usage))
    }

    pub fn with_parts(
        config: Arc<Config>,
        events: EventBus,
        guidance: Arc<GuidanceChannel>,
        usage: Arc<UsageAggregator>,
    ) -> Self {
        Self {
            config,
            agents: Arc::new(DashMap::new()),
            relationships: Arc::new(Mutex::new(RelationshipGraph::new())),
            events,
            guidance,
            usage,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn guidance(&self) -> &Arc<GuidanceChannel> {
        &self.guidance
    }

    pub fn usage(&self) -> &Arc<UsageAggregator> {
        &self.usage
    }

    fn handle(&self, id: &str) -> Result<Arc<AgentHandle>> {
        self.agents
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::agent_not_found(id))
    }

    fn handles(&self) -> Vec<Arc<AgentHandle>> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn spawn_agent(&self, agent_type: AgentType) -> Result<String> {
        self.spawn_agent_with(agent_type, SpawnOptions::default())
    }

    /// Register a new idle slot under a fresh id
    pub fn spawn_agent_with(&self, agent_type: AgentType, options: SpawnOptions) -> Result<String> {
        let handle = (0..ID_ATTEMPTS)
            .find_map(|_| {
                let suffix = Uuid::new_v4().simple().to_string();
                let id = format!("{}-{}", agent_type, &suffix[..8]);
                match self.agents.entry(id) {
                    Entry::Occupied(_) => None,
                    Entry::Vacant(slot) => {
                        let mut agent = Agent::new(
                            slot.key().clone(),
                            agent_type,
                            self.config.output_buffer_capacity,
                        );
                        agent.model = options.model.clone();
                        agent.current_task = options.current_task.clone();
                        agent.goal = options.goal.clone();
                        let handle = Arc::new(AgentHandle::new(agent));
                        slot.insert(handle.clone());
                        Some(handle)
                    }
                }
            })
            .ok_or_else(|| Error::IdSpaceExhausted(agent_type.to_string()))?;

        let id = handle.id.clone();
        info!(agent_id = %id, agent_type = %agent_type, "Agent spawned");
        self.events.publish(Event::AgentSpawned {
            agent: handle.snapshot(),
        });
        if let Some(assigner) = options.assigned_by {
            self.assign(&handle, &assigner);
        }
        Ok(id)
    }

    /// Record `assigner` as the agent that delegated work to `handle`
    fn assign(&self, handle: &AgentHandle, assigner: &str) {
        handle.state.lock().assigned_by = Some(assigner.to_string());
        if let Ok(assigner_handle) = self.handle(assigner) {
            let mut assigner_agent = assigner_handle.state.lock();
            if !assigner_agent.delegated_to.contains(&handle.id) {
                assigner_agent.delegated_to.push(handle.id.clone());
            }
        }
        let description = handle.state.lock().current_task.clone();
        let (relationship, added) = self.relationships.lock().add(AgentRelationship::new(
            assigner,
            handle.id.clone(),
            RelationshipType::Delegation,
            description,
        ));
        if added {
            self.events.publish(Event::RelationshipChanged { relationship });
        }
    }

    /// Reuse a finished slot of `agent_type`, or spawn one
    pub fn acquire_agent(&self, agent_type: AgentType, options: SpawnOptions) -> Result<String> {
        let reusable = self.handles().into_iter().find(|h| {
            let agent = h.state.lock();
            agent.agent_type == agent_type && agent.status.can_start()
        });
        let Some(handle) = reusable else {
            return self.spawn_agent_with(agent_type, options);
        };

        {
            let mut agent = handle.state.lock();
            if options.model.is_some() {
                agent.model = options.model;
            }
            agent.current_task = options.current_task;
            agent.goal = options.goal;
            agent.assigned_by = None;
        }
        if let Some(assigner) = options.assigned_by {
            self.assign(&handle, &assigner);
        }
        debug!(agent_id = %handle.id, "Reusing agent slot");
        Ok(handle.id.clone())
    }

    pub fn set_task(&self, id: &str, task: Option<String>) -> Result<()> {
        self.handle(id)?.state.lock().current_task = task;
        Ok(())
    }

    /// Launch a run of `prompt` on an idle, stopped or failed slot
    pub async fn start_agent(&self, id: &str, prompt: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let _op = handle.ops.lock().await;

        let (agent_type, model) = {
            let mut agent = handle.state.lock();
            if !agent.status.can_start() {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    status: agent.status,
                    operation: "start",
                });
            }
            agent.begin_run();
            (agent.agent_type, agent.model.clone())
        };
        handle.transition(Trigger::Start, "start", &self.events)?;

        let mut spec = self.config.agents.spec(agent_type).clone();
        if model.is_some() {
            spec.model = model;
        }

        let process = match AgentProcess::spawn(&spec, prompt, &self.config.project_root) {
            Ok(process) => process,
            Err(e) => {
                let message = format!("Failed to start {}: {}", spec.command, e);
                warn!(agent_id = %id, error = %message, "Agent launch failed");
                handle.state.lock().error = Some(message.clone());
                handle.push_output(format!("Agent failed: {message}"), LineType::Error, &self.events);
                handle.transition(Trigger::Crashed, "start", &self.events)?;
                self.persist(&handle).await;
                return Err(Error::SubprocessFailure {
                    id: id.to_string(),
                    message,
                });
            }
        };

        let (pause_tx, pause_rx) = watch::channel(false);
        let signals = RunSignals::new(pause_rx, self.config.stop_grace());
        *handle.run.lock() = Some(RunControl {
            cancel: signals.cancel.clone(),
            terminate: signals.terminate.clone(),
            pause: pause_tx,
        });
        handle.transition(Trigger::Launched, "start", &self.events)?;
        info!(agent_id = %id, agent_type = %agent_type, command = %spec.command, "Agent started");
        self.persist(&handle).await;

        let run = RunDriver {
            handle: handle.clone(),
            events: self.events.clone(),
            usage: self.usage.clone(),
            guidance: self.guidance.clone(),
            agents: self.agents.clone(),
            relationships: self.relationships.clone(),
        };
        tokio::spawn(run.drive(process, signals, spec.timeout()));
        Ok(())
    }

    /// Stop reading the agent's output. The subprocess stalls once its pipe fills.
    pub async fn pause_agent(&self, id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let _op = handle.ops.lock().await;
        handle.transition(Trigger::Pause, "pause", &self.events)?;
        if let Some(run) = handle.run.lock().as_ref() {
            run.pause.send_replace(true);
        }
        info!(agent_id = %id, "Agent paused");
        Ok(())
    }

    pub async fn resume_agent(&self, id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let _op = handle.ops.lock().await;
        handle.transition(Trigger::Resume, "resume", &self.events)?;
        if let Some(run) = handle.run.lock().as_ref() {
            run.pause.send_replace(false);
        }
        info!(agent_id = %id, "Agent resumed");
        Ok(())
    }

    /// Tear down the agent's run at once and wait until it has stopped.
    /// Killing a stopped or failed agent succeeds without doing anything.
    pub async fn kill_agent(&self, id: &str) -> Result<()> {
        self.shut_down(id, false).await?;
        info!(agent_id = %id, "Agent killed");
        Ok(())
    }

    /// Send the agent SIGTERM and give it the configured grace period to
    /// exit before it is killed. Ends in `stopped` either way.
    pub async fn stop_agent(&self, id: &str) -> Result<()> {
        self.shut_down(id, true).await?;
        info!(agent_id = %id, "Agent stopped");
        Ok(())
    }

    pub async fn stop_all(&self) -> BatchOutcome {
        let ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        self.bulk_action(&ids, BulkAction::Stop).await
    }

    async fn shut_down(&self, id: &str, graceful: bool) -> Result<()> {
        let operation = if graceful { "stop" } else { "kill" };
        let handle = self.handle(id)?;
        let mut status_rx = handle.status.subscribe();
        {
            let _op = handle.ops.lock().await;
            match handle.status() {
                status if status.is_terminal() => {
                    debug!(agent_id = %id, %status, operation, "Agent already finished");
                    return Ok(());
                }
                AgentStatus::Stopping => {}
                AgentStatus::Idle => {
                    handle.transition(Trigger::Kill, operation, &self.events)?;
                    settle_relationships(&self.agents, &self.relationships, &self.events, id);
                    handle.transition(Trigger::Exited, operation, &self.events)?;
                }
                _ => {
                    handle.transition(Trigger::Kill, operation, &self.events)?;
                    if let Some(run) = handle.run.lock().as_ref() {
                        if graceful {
                            run.terminate.cancel();
                        } else {
                            run.cancel.cancel();
                        }
                    }
                }
            }
        }
        let _ = status_rx.wait_for(|s| s.is_terminal()).await;
        Ok(())
    }

    /// Durably queue guidance, then notify observers
    pub async fn inject_guidance(&self, id: &str, content: &str) -> Result<GuidanceEntry> {
        let handle = self.handle(id)?;
        let status = handle.status();
        if !matches!(status, AgentStatus::Running | AgentStatus::Paused) {
            return Err(Error::InvalidState {
                id: id.to_string(),
                status,
                operation: "inject guidance into",
            });
        }
        let entry = self.guidance.append(id, content, "user").await?;
        self.events.publish(Event::GuidanceInjected {
            agent_id: id.to_string(),
            content_length: content.len(),
        });
        info!(agent_id = %id, bytes = content.len(), "Guidance injected");
        Ok(entry)
    }

    pub async fn read_guidance(&self, id: &str) -> Result<Option<String>> {
        self.handle(id)?;
        self.guidance.read_guidance(id).await
    }

    pub async fn clear_guidance(&self, id: &str) -> Result<()> {
        self.handle(id)?;
        self.guidance.clear_guidance(id).await
    }

    /// Apply `action` to every id independently; one failure never stops the rest
    pub async fn bulk_action(&self, ids: &[String], action: BulkAction) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            let result = match &action {
                BulkAction::Pause => self.pause_agent(id).await,
                BulkAction::Resume => self.resume_agent(id).await,
                BulkAction::Kill => self.kill_agent(id).await,
                BulkAction::Stop => self.stop_agent(id).await,
                BulkAction::Guidance(content) => self.inject_guidance(id, content).await.map(|_| ()),
            };
            if let Err(e) = &result {
                debug!(agent_id = %id, action = action.name(), error = %e, "Bulk action failed for agent");
            }
            outcome.results.insert(id.clone(), result);
        }
        outcome
    }

    pub async fn kill_all(&self) -> BatchOutcome {
        let ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        self.bulk_action(&ids, BulkAction::Kill).await
    }

    /// Drop a slot that has no running subprocess
    pub async fn remove_agent(&self, id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let _op = handle.ops.lock().await;
        let status = handle.status();
        if status.is_live() || status == AgentStatus::Stopping {
            return Err(Error::InvalidState {
                id: id.to_string(),
                status,
                operation: "remove",
            });
        }
        self.agents.remove(id);
        self.relationships.lock().forget(id);
        self.guidance.clear_agent_state(id).await?;
        self.events.publish(Event::AgentKilled {
            agent_id: id.to_string(),
        });
        info!(agent_id = %id, "Agent removed");
        Ok(())
    }

    /// Resolves once the agent is no longer running. Returns at once for an
    /// agent that was never started.
    pub async fn wait_for_terminal(&self, id: &str) -> Result<AgentSnapshot> {
        let handle = self.handle(id)?;
        let mut status_rx = handle.status.subscribe();
        let _ = status_rx
            .wait_for(|s| !s.is_live() && *s != AgentStatus::Stopping)
            .await;
        Ok(handle.snapshot())
    }

    pub fn get(&self, id: &str) -> Result<AgentSnapshot> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Text output of the agent's latest run
    pub fn run_text(&self, id: &str) -> Result<String> {
        Ok(self.handle(id)?.state.lock().run_text())
    }

    /// Tool counts of the agent's latest run
    pub fn tool_counts(&self, id: &str) -> Result<BTreeMap<String, u64>> {
        Ok(self.handle(id)?.state.lock().tool_counts())
    }

    pub fn list(&self, agent_type: Option<AgentType>) -> Vec<AgentSnapshot> {
        let mut agents: Vec<AgentSnapshot> = self
            .handles()
            .iter()
            .map(|h| h.snapshot())
            .filter(|a| agent_type.map_or(true, |t| a.agent_type == t))
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Output lines with `seq >= offset`, at most `limit`
    pub fn get_output(&self, id: &str, limit: Option<usize>, offset: u64) -> Result<Vec<OutputLine>> {
        Ok(self.handle(id)?.state.lock().output.page(offset, limit))
    }

    pub fn add_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: RelationshipType,
        description: Option<String>,
    ) -> Result<AgentRelationship> {
        let source = self.handle(source_id)?;
        self.handle(target_id)?;
        if relationship_type == RelationshipType::Waiting {
            source.state.lock().waiting_for = Some(target_id.to_string());
        }
        let (relationship, added) = self.relationships.lock().add(AgentRelationship::new(
            source_id,
            target_id,
            relationship_type,
            description,
        ));
        if added {
            self.events.publish(Event::RelationshipChanged {
                relationship: relationship.clone(),
            });
        }
        Ok(relationship)
    }

    pub fn clear_waiting(&self, id: &str) -> Result<()> {
        self.handle(id)?.state.lock().waiting_for = None;
        let changed = self.relationships.lock().complete_waiting(id);
        for relationship in changed {
            self.events.publish(Event::RelationshipChanged { relationship });
        }
        Ok(())
    }

    pub fn list_relationships(&self, active_only: bool) -> Vec<AgentRelationship> {
        let agents = self.list(None);
        self.relationships.lock().derive(&agents, active_only)
    }

    pub fn pool_summary(&self) -> PoolSummary {
        let agents = self.list(None);
        let relationships = self.relationships.lock().derive(&agents, false);
        let running_agents = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Running)
            .count();
        let mut by_type: BTreeMap<String, Vec<AgentSnapshot>> = AgentType::ALL
            .iter()
            .map(|t| (t.to_string(), Vec::new()))
            .collect();
        let total_agents = agents.len();
        for agent in agents {
            by_type.entry(agent.agent_type.to_string()).or_default().push(agent);
        }
        PoolSummary {
            total_agents,
            running_agents,
            agents: by_type,
            relationships,
            total_usage: self.usage.total(),
        }
    }

    async fn persist(&self, handle: &AgentHandle) {
        if let Err(e) = self.guidance.save_agent_state(&handle.snapshot()).await {
            warn!(agent_id = %handle.id, error = %e, "Failed to save agent state");
        }
    }
}

/// Background half of a run: folds subprocess output into the slot and
/// settles its final status.
struct RunDriver {
    handle: Arc<AgentHandle>,
    events: EventBus,
    usage: Arc<UsageAggregator>,
    guidance: Arc<GuidanceChannel>,
    agents: Registry,
    relationships: Arc<Mutex<RelationshipGraph>>,
}

impl RunDriver {
    async fn drive(self, process: AgentProcess, signals: RunSignals, timeout: Duration) {
        let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let supervisor = tokio::spawn(process.supervise(tx, signals, timeout));
        while let Some(item) = rx.recv().await {
            self.apply(item);
        }
        let outcome = supervisor
            .await
            .unwrap_or_else(|e| RunOutcome::Failed(format!("Supervisor task failed: {e}")));
        self.finish(outcome).await;
    }

    fn apply(&self, item: StreamItem) {
        let mut agent = self.handle.state.lock();
        match item {
            StreamItem::Output {
                content,
                line_type,
                metadata,
            } => {
                let line = agent.output.push(content, line_type, metadata);
                self.events.publish(Event::AgentOutput {
                    agent_id: agent.id.clone(),
                    line,
                });
            }
            StreamItem::ToolUse { tool, input } => {
                agent.record_tool_use(ToolUse {
                    tool,
                    input,
                    timestamp: Utc::now(),
                });
            }
            StreamItem::Model(model) => agent.model = Some(model),
            StreamItem::Usage(metrics) => {
                agent.usage.add(&metrics);
                self.usage.record(
                    &agent.id,
                    agent.agent_type,
                    agent.model.clone(),
                    metrics.clone(),
                    Utc::now(),
                );
                self.events.publish(Event::UsageUpdate {
                    agent_id: agent.id.clone(),
                    metrics,
                });
            }
        }
    }

    async fn finish(self, outcome: RunOutcome) {
        let _op = self.handle.ops.lock().await;
        self.handle.run.lock().take();

        let trigger = match outcome {
            RunOutcome::Exited | RunOutcome::Killed => Trigger::Exited,
            RunOutcome::Failed(_) | RunOutcome::TimedOut(_) => Trigger::Crashed,
        };
        if let Some(error) = outcome.error() {
            if self.handle.status() != AgentStatus::Stopping {
                warn!(agent_id = %self.handle.id, %error, "Agent run failed");
                self.handle.state.lock().error = Some(error.clone());
                self.handle
                    .push_output(format!("Agent failed: {error}"), LineType::Error, &self.events);
            }
        }
        // Settled before the terminal status is visible to waiters
        settle_relationships(&self.agents, &self.relationships, &self.events, &self.handle.id);
        match self.handle.transition(trigger, "finish", &self.events) {
            Ok(status) => info!(agent_id = %self.handle.id, %status, "Agent run finished"),
            Err(e) => warn!(agent_id = %self.handle.id, error = %e, "Unexpected run completion"),
        }

        let snapshot = self.handle.snapshot();
        if let Err(e) = self.guidance.save_agent_state(&snapshot).await {
            warn!(agent_id = %snapshot.id, error = %e, "Failed to save agent state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSpec, AgentsConfig};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn test_manager(events: EventBus) -> (TempDir, AgentManager) {
        test_manager_with(events, |_| {})
    }

    /// Every role runs its prompt as a shell script
    fn test_manager_with(events: EventBus, tune: impl FnOnce(&mut Config)) -> (TempDir, AgentManager) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_project(dir.path());
        config.agents = AgentsConfig::uniform(AgentSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "eval \"$0\"".into()],
            timeout_minutes: 1,
            model: None,
        });
        tune(&mut config);
        let manager = AgentManager::new(Arc::new(config), events).unwrap();
        (dir, manager)
    }

    async fn wait_until(manager: &AgentManager, id: &str, pred: impl Fn(&AgentSnapshot) -> bool) {
        for _ in 0..200 {
            if pred(&manager.get(id).unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached for {id}");
    }

    #[tokio::test]
    async fn test_spawn_registers_idle_agent() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();

        assert!(id.starts_with("worker-"));
        let agent = manager.get(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(manager.list(Some(AgentType::Worker)).len(), 1);
        assert!(manager.list(Some(AgentType::Evaluator)).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let (_dir, manager) = test_manager(EventBus::default());
        let err = manager.start_agent("worker-missing", "true").await.unwrap_err();
        assert_eq!(err.code(), "NotFound");
        assert!(manager.get("worker-missing").is_err());
    }

    #[tokio::test]
    async fn test_run_collects_output_tools_and_usage() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        let script = r#"echo '{"type":"assistant","message":{"model":"m1","content":[{"type":"tool_use","name":"Write","input":{"file_path":"/tmp/x/notes.md"}}],"usage":{"input_tokens":7,"output_tokens":3}}}'
echo 'all done'"#;

        manager.start_agent(&id, script).await.unwrap();
        let agent = manager.wait_for_terminal(&id).await.unwrap();

        assert_eq!(agent.status, AgentStatus::Stopped);
        assert_eq!(agent.files_modified, vec!["notes.md".to_string()]);
        assert_eq!(agent.tools_used, 1);
        assert_eq!(agent.model.as_deref(), Some("m1"));
        assert_eq!(agent.usage.input_tokens, 7);
        assert_eq!(manager.usage().today().by_model["m1"].output_tokens, 3);
        assert!(manager.run_text(&id).unwrap().contains("all done"));

        let page = manager.get_output(&id, Some(1), 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].seq, 1);
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();

        manager.start_agent(&id, "exit 4").await.unwrap();
        let agent = manager.wait_for_terminal(&id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Failed);
        assert_eq!(agent.error.as_deref(), Some("Exit code: 4"));

        // the slot is reusable and the error is cleared on the next run
        manager.start_agent(&id, "true").await.unwrap();
        let agent = manager.wait_for_terminal(&id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert!(agent.error.is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_is_subprocess_failure() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_project(dir.path());
        config.agents = AgentsConfig::uniform(AgentSpec {
            command: "definitely-not-an-agent-binary".into(),
            args: vec![],
            timeout_minutes: 1,
            model: None,
        });
        let manager = AgentManager::new(Arc::new(config), EventBus::default()).unwrap();
        let id = manager.spawn_agent(AgentType::Coordinator).unwrap();

        let err = manager.start_agent(&id, "prompt").await.unwrap_err();
        assert_eq!(err.code(), "SubprocessFailure");
        let agent = manager.get(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Failed);
        assert!(agent.error.unwrap().starts_with("Failed to start"));
    }

    #[tokio::test]
    async fn test_start_while_running_is_invalid() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&id, "sleep 5").await.unwrap();

        let err = manager.start_agent(&id, "true").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { status: AgentStatus::Running, .. }));
        manager.kill_agent(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_idle_is_invalid() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        let err = manager.pause_agent(&id).await.unwrap_err();
        assert_eq!(err.code(), "InvalidState");
        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&id, "true").await.unwrap();
        manager.wait_for_terminal(&id).await.unwrap();

        manager.kill_agent(&id).await.unwrap();
        manager.kill_agent(&id).await.unwrap();
        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_kill_running_and_idle_agents() {
        let (_dir, manager) = test_manager(EventBus::default());
        let running = manager.spawn_agent(AgentType::Worker).unwrap();
        let idle = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&running, "sleep 30").await.unwrap();

        manager.kill_agent(&running).await.unwrap();
        manager.kill_agent(&idle).await.unwrap();

        let agent = manager.get(&running).unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert!(agent.error.is_none());
        assert_eq!(manager.get(&idle).unwrap().status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pause_resume_restores_state() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&id, "echo ready; sleep 30").await.unwrap();
        wait_until(&manager, &id, |a| a.output_lines == 1).await;

        let before = manager.get(&id).unwrap();
        manager.pause_agent(&id).await.unwrap();
        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Paused);
        manager.resume_agent(&id).await.unwrap();

        assert_eq!(manager.get(&id).unwrap(), before);
        manager.kill_agent(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_paused_agent() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&id, "sleep 30").await.unwrap();
        manager.pause_agent(&id).await.unwrap();

        manager.kill_agent(&id).await.unwrap();
        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_agent_lets_it_exit_cleanly() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager
            .start_agent(&id, "trap 'echo bye; exit 0' TERM; echo ready; while true; do sleep 0.05; done")
            .await
            .unwrap();
        wait_until(&manager, &id, |a| a.output_lines >= 1).await;

        manager.stop_agent(&id).await.unwrap();
        let agent = manager.get(&id).unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert!(agent.error.is_none());
        assert!(manager.run_text(&id).unwrap().contains("bye"));
    }

    #[tokio::test]
    async fn test_stop_agent_kills_after_grace_period() {
        let (_dir, manager) = test_manager_with(EventBus::default(), |c| c.stop_grace_ms = 200);
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager
            .start_agent(&id, "trap '' TERM; echo ready; while true; do sleep 0.05; done")
            .await
            .unwrap();
        wait_until(&manager, &id, |a| a.output_lines >= 1).await;

        let started = std::time::Instant::now();
        manager.stop_agent(&id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(manager.get(&id).unwrap().status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let (_dir, manager) = test_manager_with(EventBus::default(), |c| c.stop_grace_ms = 200);
        let running = manager.spawn_agent(AgentType::Worker).unwrap();
        let idle = manager.spawn_agent(AgentType::Evaluator).unwrap();
        manager.start_agent(&running, "sleep 30").await.unwrap();

        let outcome = manager.stop_all().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.message(&BulkAction::Stop), "stop executed on 2/2 agents");
        assert_eq!(manager.get(&running).unwrap().status, AgentStatus::Stopped);
        assert_eq!(manager.get(&idle).unwrap().status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_bulk_pause_reports_each_id() {
        let (_dir, manager) = test_manager(EventBus::default());
        let a = manager.spawn_agent(AgentType::Worker).unwrap();
        let c = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&a, "sleep 30").await.unwrap();
        manager.start_agent(&c, "sleep 30").await.unwrap();

        let ids = vec![a.clone(), "worker-missing".to_string(), c.clone()];
        let outcome = manager.bulk_action(&ids, BulkAction::Pause).await;

        assert!(outcome.results[&a].is_ok());
        assert!(matches!(outcome.results["worker-missing"], Err(Error::NotFound { .. })));
        assert!(outcome.results[&c].is_ok());
        assert_eq!(outcome.message(&BulkAction::Pause), "pause executed on 2/3 agents");
        assert_eq!(manager.get(&a).unwrap().status, AgentStatus::Paused);
        assert_eq!(manager.get(&c).unwrap().status, AgentStatus::Paused);

        match outcome.into_result() {
            Err(Error::PartialBatchFailure { failed }) => {
                assert_eq!(failed.keys().collect::<Vec<_>>(), vec!["worker-missing"]);
            }
            other => panic!("expected partial failure, got {:?}", other),
        }

        assert!(manager.kill_all().await.is_success());
    }

    #[tokio::test]
    async fn test_guidance_works_with_bus_disabled() {
        let (_dir, manager) = test_manager(EventBus::disabled());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&id, "sleep 30").await.unwrap();

        for i in 0..5 {
            manager.inject_guidance(&id, &format!("hint {i}")).await.unwrap();
        }
        let entries = manager.guidance().entries(&id).await.unwrap();
        let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["hint 0", "hint 1", "hint 2", "hint 3", "hint 4"]);

        manager.kill_agent(&id).await.unwrap();
        let err = manager.inject_guidance(&id, "late").await.unwrap_err();
        assert_eq!(err.code(), "InvalidState");
    }

    #[tokio::test]
    async fn test_agent_events_arrive_in_order() {
        let bus = EventBus::default();
        let (_dir, manager) = test_manager(bus.clone());
        let id = manager.spawn_agent(AgentType::Evaluator).unwrap();
        let mut receiver = bus.subscribe_agent(&id);

        manager.start_agent(&id, "echo PASSED").await.unwrap();
        manager.wait_for_terminal(&id).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await
        {
            match &envelope.event {
                Event::AgentStatus { status, .. } => seen.push(status.to_string()),
                Event::AgentOutput { line, .. } => seen.push(line.content.clone()),
                _ => {}
            }
        }
        assert_eq!(seen, vec!["starting", "running", "PASSED", "stopped"]);
    }

    #[tokio::test]
    async fn test_delegation_and_relationships() {
        let (_dir, manager) = test_manager(EventBus::default());
        let coordinator = manager.spawn_agent(AgentType::Coordinator).unwrap();
        let worker = manager
            .spawn_agent_with(
                AgentType::Worker,
                SpawnOptions {
                    assigned_by: Some(coordinator.clone()),
                    current_task: Some("add tests".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(manager.get(&coordinator).unwrap().delegated_to, vec![worker.clone()]);
        assert_eq!(manager.get(&worker).unwrap().assigned_by, Some(coordinator.clone()));

        let evaluator = manager.spawn_agent(AgentType::Evaluator).unwrap();
        manager
            .add_relationship(&evaluator, &worker, RelationshipType::Waiting, None)
            .unwrap();
        assert_eq!(manager.get(&evaluator).unwrap().waiting_for, Some(worker.clone()));
        assert_eq!(manager.list_relationships(true).len(), 2);

        manager.clear_waiting(&evaluator).unwrap();
        let active = manager.list_relationships(true);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].relationship_type, RelationshipType::Delegation);

        // a finished coordinator completes its delegation edge
        manager.start_agent(&coordinator, "true").await.unwrap();
        manager.wait_for_terminal(&coordinator).await.unwrap();
        assert!(manager.list_relationships(true).is_empty());
        assert_eq!(manager.list_relationships(false).len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_reuses_finished_slot() {
        let (_dir, manager) = test_manager(EventBus::default());
        let first = manager.acquire_agent(AgentType::Worker, SpawnOptions::default()).unwrap();
        manager.start_agent(&first, "echo one").await.unwrap();
        manager.wait_for_terminal(&first).await.unwrap();

        let second = manager.acquire_agent(AgentType::Worker, SpawnOptions::default()).unwrap();
        assert_eq!(first, second);

        // output concatenates across runs of the same slot
        manager.start_agent(&second, "echo two").await.unwrap();
        let agent = manager.wait_for_terminal(&second).await.unwrap();
        assert_eq!(agent.output_lines, 2);
        assert_eq!(manager.run_text(&second).unwrap(), "two");
    }

    #[tokio::test]
    async fn test_reused_slot_keeps_earlier_edges_completed() {
        let (_dir, manager) = test_manager(EventBus::default());
        let coordinator = manager.spawn_agent(AgentType::Coordinator).unwrap();
        manager.start_agent(&coordinator, "true").await.unwrap();
        manager.wait_for_terminal(&coordinator).await.unwrap();

        let task = |description: &str| SpawnOptions {
            assigned_by: Some(coordinator.clone()),
            current_task: Some(description.into()),
            ..Default::default()
        };

        let worker = manager.acquire_agent(AgentType::Worker, task("cycle 1 task")).unwrap();
        manager.start_agent(&worker, "true").await.unwrap();
        manager.wait_for_terminal(&worker).await.unwrap();
        assert!(manager.list_relationships(true).is_empty());

        // the coordinator runs again before the slot is reused
        manager.start_agent(&coordinator, "true").await.unwrap();
        manager.wait_for_terminal(&coordinator).await.unwrap();
        assert!(manager.list_relationships(true).is_empty());

        let reused = manager.acquire_agent(AgentType::Worker, task("cycle 2 task")).unwrap();
        assert_eq!(reused, worker);
        let active = manager.list_relationships(true);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].description.as_deref(), Some("cycle 2 task"));

        // same assignment again does not add a second active edge
        manager.acquire_agent(AgentType::Worker, task("cycle 2 task")).unwrap();
        assert_eq!(manager.list_relationships(true).len(), 1);

        manager.start_agent(&worker, "true").await.unwrap();
        manager.wait_for_terminal(&worker).await.unwrap();
        assert!(manager.list_relationships(true).is_empty());
        let all = manager.list_relationships(false);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.relationship_type == RelationshipType::Completed));
    }

    #[tokio::test]
    async fn test_kill_idle_agent_completes_its_edges() {
        let (_dir, manager) = test_manager(EventBus::default());
        let coordinator = manager.spawn_agent(AgentType::Coordinator).unwrap();
        let worker = manager.spawn_agent(AgentType::Worker).unwrap();
        manager
            .add_relationship(&coordinator, &worker, RelationshipType::Delegation, None)
            .unwrap();

        manager.kill_agent(&coordinator).await.unwrap();
        assert!(manager.list_relationships(true).is_empty());
    }

    #[tokio::test]
    async fn test_remove_agent() {
        let (_dir, manager) = test_manager(EventBus::default());
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        manager.start_agent(&id, "sleep 30").await.unwrap();

        let err = manager.remove_agent(&id).await.unwrap_err();
        assert_eq!(err.code(), "InvalidState");

        manager.kill_agent(&id).await.unwrap();
        manager.remove_agent(&id).await.unwrap();
        assert!(manager.get(&id).is_err());
        assert!(manager.guidance().load_agent_state(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_summary_groups_by_type() {
        let (_dir, manager) = test_manager(EventBus::default());
        manager.spawn_agent(AgentType::Worker).unwrap();
        manager.spawn_agent(AgentType::Worker).unwrap();
        manager.spawn_agent(AgentType::Coordinator).unwrap();

        let summary = manager.pool_summary();
        assert_eq!(summary.total_agents, 3);
        assert_eq!(summary.running_agents, 0);
        assert_eq!(summary.agents["worker"].len(), 2);
        assert!(summary.agents["evaluator"].is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(&'static str),
        Pause,
        Resume,
        Kill,
        Stop,
        Guide,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::sample::select(vec!["sleep 0.2", "echo hi", "exit 2"]).prop_map(Op::Start),
            Just(Op::Pause),
            Just(Op::Resume),
            Just(Op::Kill),
            Just(Op::Stop),
            Just(Op::Guide),
        ]
    }

    /// The agent lifecycle graph, written out edge by edge
    fn lifecycle_edge(from: AgentStatus, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (from, to),
            (Idle, Starting)
                | (Stopped, Starting)
                | (Failed, Starting)
                | (Starting, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Idle, Stopping)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Stopping, Stopped)
                | (Starting, Failed)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }

    /// Drive one agent through `ops`, then kill it, and return every status it announced
    async fn announced_statuses(ops: Vec<Op>) -> Vec<AgentStatus> {
        let events = EventBus::default();
        let (_dir, manager) = test_manager_with(events.clone(), |c| c.stop_grace_ms = 100);
        let id = manager.spawn_agent(AgentType::Worker).unwrap();
        let mut receiver = events.subscribe_agent(id.clone());

        for op in ops {
            // Rejected operations are part of the sequence too
            let _ = match op {
                Op::Start(script) => manager.start_agent(&id, script).await,
                Op::Pause => manager.pause_agent(&id).await,
                Op::Resume => manager.resume_agent(&id).await,
                Op::Kill => manager.kill_agent(&id).await,
                Op::Stop => manager.stop_agent(&id).await,
                Op::Guide => manager.inject_guidance(&id, "focus on tests").await.map(|_| ()),
            };
        }
        manager.kill_agent(&id).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(Some(envelope)) = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await {
            if let Event::AgentStatus { status, .. } = &envelope.event {
                statuses.push(*status);
            }
        }
        statuses
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_operations_only_announce_lifecycle_edges(ops in prop::collection::vec(arb_op(), 0..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let statuses = runtime.block_on(announced_statuses(ops));

            let mut previous = AgentStatus::Idle;
            for status in statuses {
                prop_assert!(lifecycle_edge(previous, status), "{} -> {}", previous, status);
                previous = status;
            }
            prop_assert!(previous.is_terminal(), "ended in {}", previous);
        }
    }
}
