mod event_bus;
mod guidance;
mod observer;

pub use event_bus::{AgentEventReceiver, Event, EventBus, EventEnvelope, Frame, Subscription};
pub use guidance::{GuidanceChannel, GuidanceEntry};
pub use observer::{CloseHandle, ConnectionState, Observer, ObserverEvent, ReconnectPolicy};
