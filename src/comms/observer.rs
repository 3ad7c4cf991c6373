//! Observer side of the push channel.
//!
//! Answers heartbeats, reconnects with backoff when the connection drops
//! unexpectedly, and tells the caller to resynchronize from a snapshot
//! afterwards, since missed events are never redelivered.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event_bus::{Event, EventBus, EventEnvelope, Frame, Subscription};

/// Backoff schedule for reconnect attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^attempt`, capped at `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Dropped without being asked to; a reconnect is pending
    Reconnecting { attempt: u32 },
    /// Closed by the caller; never reconnects
    ClosedIntentionally,
    /// Reconnect attempts exhausted
    Failed,
}

/// What the caller sees
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Event(Arc<EventEnvelope>),
    /// The connection was re-established; pull a full status snapshot
    Resync,
}

/// Handle that closes an observer from another task
#[derive(Clone)]
pub struct CloseHandle(CancellationToken);

impl CloseHandle {
    pub fn close(&self) {
        self.0.cancel();
    }
}

pub struct Observer {
    bus: EventBus,
    policy: ReconnectPolicy,
    subscription: Option<Subscription>,
    state: ConnectionState,
    close: CancellationToken,
    /// Unexpected closures since the last application event
    drops: u32,
}

impl Observer {
    pub fn connect(bus: EventBus, policy: ReconnectPolicy) -> Self {
        let subscription = Some(bus.subscribe());
        Self {
            bus,
            policy,
            subscription,
            state: ConnectionState::Open,
            close: CancellationToken::new(),
            drops: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.close.clone())
    }

    /// Close on purpose. Any pending reconnect is abandoned.
    pub fn close(&mut self) {
        self.close.cancel();
        self.subscription = None;
        self.state = ConnectionState::ClosedIntentionally;
    }

    /// Next event, or `None` once the observer is closed or has given up
    pub async fn recv(&mut self) -> Option<ObserverEvent> {
        loop {
            if self.close.is_cancelled() {
                self.subscription = None;
                self.state = ConnectionState::ClosedIntentionally;
                return None;
            }
            match self.state {
                ConnectionState::ClosedIntentionally | ConnectionState::Failed => return None,
                ConnectionState::Open => {
                    let Some(subscription) = self.subscription.as_mut() else {
                        self.state = ConnectionState::Reconnecting { attempt: 0 };
                        continue;
                    };
                    let frame = tokio::select! {
                        _ = self.close.cancelled() => continue,
                        frame = subscription.next_frame() => frame,
                    };
                    match frame {
                        Some(Frame::Event(envelope)) => {
                            if !matches!(envelope.event, Event::Connected { .. }) {
                                self.drops = 0;
                            }
                            return Some(ObserverEvent::Event(envelope));
                        }
                        Some(Frame::Ping { seq }) => {
                            subscription.pong(seq);
                        }
                        None => {
                            warn!("Event stream closed unexpectedly");
                            self.subscription = None;
                            self.state = ConnectionState::Reconnecting {
                                attempt: self.drops,
                            };
                            self.drops += 1;
                        }
                    }
                }
                ConnectionState::Reconnecting { attempt } => {
                    if self.policy.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!(attempt, "Giving up on event stream");
                        self.state = ConnectionState::Failed;
                        return None;
                    }
                    let delay = self.policy.delay(attempt);
                    debug!(attempt, ?delay, "Scheduling event stream reconnect");
                    tokio::select! {
                        _ = self.close.cancelled() => continue,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.subscription = Some(self.bus.subscribe());
                    self.state = ConnectionState::Open;
                    info!(attempt = attempt + 1, "Event stream reconnected");
                    return Some(ObserverEvent::Resync);
                }
            }
        }
    }
}
