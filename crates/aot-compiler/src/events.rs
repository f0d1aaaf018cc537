//! System events that drive admission control.
//!
//! The platform publishes power, screen and thermal notifications on an
//! event bus. The service subscribes to the three it cares about when it
//! starts and unsubscribes when it stops. Delivery is fire-and-forget.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub use crate::protocol::SystemEvent;

/// Subscription key for a [`SystemEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PowerDisconnected,
    ScreenOn,
    ThermalLevelChanged,
}

impl EventKind {
    pub fn of(event: &SystemEvent) -> Self {
        match event {
            SystemEvent::PowerDisconnected => Self::PowerDisconnected,
            SystemEvent::ScreenOn => Self::ScreenOn,
            SystemEvent::ThermalLevelChanged(_) => Self::ThermalLevelChanged,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("already subscribed to {0:?}")]
    AlreadySubscribed(EventKind),

    #[error("not subscribed to {0:?}")]
    NotSubscribed(EventKind),

    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// Subscription side of the platform event bus.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Result<(), EventBusError>;
    fn unsubscribe(&self, kind: EventKind) -> Result<(), EventBusError>;
}

/// In-process event bus, one handler per event kind.
///
/// The daemon feeds it from `SystemEvent` IPC frames.
#[derive(Default)]
pub struct LocalEventBus {
    handlers: RwLock<HashMap<EventKind, EventHandler>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to its subscriber. Returns whether anyone listened.
    pub fn publish(&self, event: SystemEvent) -> bool {
        let kind = EventKind::of(&event);
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        match handler {
            Some(handler) => {
                debug!("dispatching {event:?}");
                handler(&event);
                true
            }
            None => {
                warn!("no subscriber for {event:?}, dropping");
                false
            }
        }
    }

    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }
}

impl EventBus for LocalEventBus {
    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Result<(), EventBusError> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&kind) {
            return Err(EventBusError::AlreadySubscribed(kind));
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    fn unsubscribe(&self, kind: EventKind) -> Result<(), EventBusError> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .map(|_| ())
            .ok_or(EventBusError::NotSubscribed(kind))
    }
}
