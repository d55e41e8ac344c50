//! Presence notifications from the session worker to any number of observers.

use chrono::NaiveDate;
use rollcall_core::Identity;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

/// A person was marked present for the first time on `date`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEvent {
    pub identity: Identity,
    pub date: NaiveDate,
    /// Distance of the live encoding to the matched reference.
    pub distance: f32,
}

/// Receives presence confirmations. Called on the session worker thread,
/// so implementations must return quickly.
pub trait PresenceObserver: Send + Sync {
    fn on_presence_confirmed(&self, event: &PresenceEvent);
}

/// Registration point for observers.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<Arc<dyn PresenceObserver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn PresenceObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn emit(&self, event: &PresenceEvent) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer.on_presence_confirmed(event);
        }
    }
}

/// Logs each confirmation.
pub struct LogObserver;

impl PresenceObserver for LogObserver {
    fn on_presence_confirmed(&self, event: &PresenceEvent) {
        tracing::info!(
            identity = %event.identity,
            date = %event.date,
            distance = event.distance,
            "attendance marked"
        );
    }
}

/// Keeps the most recent confirmations for status queries.
pub struct RecentObserver {
    capacity: usize,
    events: Mutex<VecDeque<PresenceEvent>>,
}

impl RecentObserver {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<PresenceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl PresenceObserver for RecentObserver {
    fn on_presence_confirmed(&self, event: &PresenceEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if self.capacity == 0 {
            return;
        }
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> PresenceEvent {
        PresenceEvent {
            identity: Identity::new(name).unwrap(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            distance: 0.1,
        }
    }

    #[test]
    fn test_bus_reaches_every_observer() {
        let bus = EventBus::new();
        let a = Arc::new(RecentObserver::new(4));
        let b = Arc::new(RecentObserver::new(4));
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());
        bus.subscribe(Arc::new(LogObserver));

        bus.emit(&event("alice"));
        assert_eq!(a.recent(), vec![event("alice")]);
        assert_eq!(b.recent(), vec![event("alice")]);
    }

    #[test]
    fn test_recent_observer_is_bounded() {
        let recent = RecentObserver::new(2);
        for name in ["alice", "bob", "carol"] {
            recent.on_presence_confirmed(&event(name));
        }
        let names: Vec<String> = recent.recent().iter().map(|e| e.identity.to_string()).collect();
        assert_eq!(names, vec!["bob", "carol"]);
    }
}
