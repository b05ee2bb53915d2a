//! aion-events: Typed publish/subscribe for UI-facing events.
//!
//! Services publish [`events::AppEvent`]s on the [`registry::EventBus`];
//! listeners subscribe to its broadcast stream (the gateway forwards that
//! stream to WebSocket clients).

pub mod events;
pub mod registry;

pub use events::AppEvent;
pub use registry::EventBus;
