//! Event bus: best-effort fan-out of lifecycle and output events.
//!
//! Built on a tokio broadcast channel. Nothing is replayed: a subscriber that
//! lags or reconnects has to pull a fresh snapshot from the query surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentRelationship, AgentSnapshot, AgentStatus, OutputLine};
use crate::orchestrator::{Cycle, CyclePhase};
use crate::usage::UsageMetrics;

/// Every event an observer can receive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Connected { connection_count: usize },
    AgentSpawned { agent: AgentSnapshot },
    #[serde(rename_all = "camelCase")]
    AgentOutput { agent_id: String, line: OutputLine },
    #[serde(rename_all = "camelCase")]
    AgentStatus {
        agent_id: String,
        status: AgentStatus,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AgentKilled { agent_id: String },
    CycleStarted { cycle: u64 },
    CycleCompleted { cycle: u64, result: Cycle },
    CycleFailed { cycle: u64, result: Cycle },
    PhaseChanged { phase: CyclePhase },
    #[serde(rename_all = "camelCase")]
    GuidanceInjected { agent_id: String, content_length: usize },
    PromptUpdated { name: String },
    #[serde(rename_all = "camelCase")]
    OrchestratorStarted { max_cycles: Option<u64> },
    OrchestratorStopped { cycle: u64, phase: CyclePhase },
    #[serde(rename_all = "camelCase")]
    UsageUpdate { agent_id: String, metrics: UsageMetrics },
    RelationshipChanged { relationship: AgentRelationship },
    StateFileChanged { path: PathBuf },
    Error { message: String },
}

impl Event {
    /// Agent the event is about, if any
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Event::AgentSpawned { agent } => Some(&agent.id),
            Event::AgentOutput { agent_id, .. }
            | Event::AgentStatus { agent_id, .. }
            | Event::AgentKilled { agent_id }
            | Event::GuidanceInjected { agent_id, .. }
            | Event::UsageUpdate { agent_id, .. } => Some(agent_id),
            Event::RelationshipChanged { relationship } => Some(&relationship.source_id),
            Event::Connected { .. }
            | Event::CycleStarted { .. }
            | Event::CycleCompleted { .. }
            | Event::CycleFailed { .. }
            | Event::PhaseChanged { .. }
            | Event::PromptUpdated { .. }
            | Event::OrchestratorStarted { .. }
            | Event::OrchestratorStopped { .. }
            | Event::StateFileChanged { .. }
            | Event::Error { .. } => None,
        }
    }
}

/// Event plus the time it was published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    pub fn now(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// What a subscription yields
#[derive(Debug, Clone)]
pub enum Frame {
    Event(Arc<EventEnvelope>),
    /// Keep-alive; the observer must answer with [`Subscription::pong`]
    Ping { seq: u64 },
}

/// Publisher side of the push channel
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Arc<EventEnvelope>>>,
    enabled: bool,
    heartbeat: Duration,
    /// Cancelled to drop every current subscription
    epoch: Arc<Mutex<CancellationToken>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber
    pub fn new(capacity: usize, heartbeat: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            enabled: true,
            heartbeat,
            epoch: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000, Duration::from_secs(30))
    }

    /// A bus that drops everything it is handed
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::with_default_capacity()
        }
    }

    /// Fire-and-forget publish; never waits on subscribers
    pub fn publish(&self, event: Event) {
        if !self.enabled {
            return;
        }
        let envelope = Arc::new(EventEnvelope::now(event));
        if self.sender.send(envelope).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let receiver = self.sender.subscribe();
        let connected = EventEnvelope::now(Event::Connected {
            connection_count: self.sender.receiver_count(),
        });
        Subscription {
            receiver,
            heartbeat: self.heartbeat,
            closed: self.epoch.lock().clone(),
            pending: Some(Frame::Event(Arc::new(connected))),
            ping_seq: 0,
            awaiting_pong: None,
        }
    }

    /// Only events about one agent, without heartbeats
    pub fn subscribe_agent(&self, agent_id: impl Into<String>) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id: agent_id.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Drop every open subscription, as a server restart would
    pub fn disconnect_all(&self) {
        let mut epoch = self.epoch.lock();
        epoch.cancel();
        *epoch = CancellationToken::new();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// One observer connection
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<EventEnvelope>>,
    heartbeat: Duration,
    closed: CancellationToken,
    pending: Option<Frame>,
    ping_seq: u64,
    awaiting_pong: Option<u64>,
}

impl Subscription {
    /// Next frame, or `None` once the connection is gone.
    ///
    /// A ping is produced whenever `heartbeat` passes without an event. If
    /// the previous ping was never answered the connection counts as dead.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        if let Some(frame) = self.pending.take() {
            return Some(frame);
        }
        loop {
            let recv = tokio::select! {
                _ = self.closed.cancelled() => return None,
                recv = tokio::time::timeout(self.heartbeat, self.receiver.recv()) => recv,
            };
            match recv {
                Ok(Ok(envelope)) => return Some(Frame::Event(envelope)),
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!("Event subscriber lagged by {} events", n);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => {
                    if let Some(seq) = self.awaiting_pong {
                        debug!(seq, "Heartbeat unanswered, dropping subscriber");
                        return None;
                    }
                    self.ping_seq += 1;
                    self.awaiting_pong = Some(self.ping_seq);
                    return Some(Frame::Ping { seq: self.ping_seq });
                }
            }
        }
    }

    /// Echo of a ping; returns false for a stale or unknown sequence number
    pub fn pong(&mut self, seq: u64) -> bool {
        if self.awaiting_pong == Some(seq) {
            self.awaiting_pong = None;
            true
        } else {
            false
        }
    }

    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong.is_some()
    }
}

/// Receiver filtered to a single agent's events, in that agent's order
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<Arc<EventEnvelope>>,
    agent_id: String,
}

impl AgentEventReceiver {
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if envelope.event.agent_id() == Some(self.agent_id.as_str()) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(agent_id = %self.agent_id, "Agent event receiver lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
