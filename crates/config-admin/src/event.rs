//! Configuration events and listener fan-out.
//!
//! Synchronous listeners run inline on the thread that changed the
//! configuration. Asynchronous listeners are snapshotted when the event is
//! fired and called from the event queue.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::ListenerError;
use crate::queue::TaskRunner;

/// Listener identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub uuid::Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigurationEventKind {
    Updated,
    Deleted,
    LocationChanged,
}

impl fmt::Display for ConfigurationEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigurationEventKind::Updated => "CM_UPDATED",
            ConfigurationEventKind::Deleted => "CM_DELETED",
            ConfigurationEventKind::LocationChanged => "CM_LOCATION_CHANGED",
        };
        f.write_str(name)
    }
}

/// Notification about a configuration change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationEvent {
    pub kind: ConfigurationEventKind,
    pub pid: String,
    pub factory_pid: Option<String>,
}

impl ConfigurationEvent {
    pub fn new(kind: ConfigurationEventKind, pid: impl Into<String>, factory_pid: Option<String>) -> Self {
        Self {
            kind,
            pid: pid.into(),
            factory_pid,
        }
    }
}

/// Listener called from the event queue.
#[async_trait]
pub trait ConfigurationListener: Send + Sync {
    async fn configuration_event(&self, event: &ConfigurationEvent) -> Result<(), ListenerError>;
}

/// Listener called inline, before the triggering call returns.
pub trait SynchronousConfigurationListener: Send + Sync {
    fn configuration_event(&self, event: &ConfigurationEvent);
}

type AsyncEntry = (ListenerId, Arc<dyn ConfigurationListener>);
type SyncEntry = (ListenerId, Arc<dyn SynchronousConfigurationListener>);

/// Registered listeners of both flavors.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<AsyncEntry>>,
    sync_listeners: RwLock<Vec<SyncEntry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ConfigurationListener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.write().push((id, listener));
        debug!(listener_id = ?id.0, "Configuration listener registered");
        id
    }

    pub fn add_sync(&self, listener: Arc<dyn SynchronousConfigurationListener>) -> ListenerId {
        let id = ListenerId::new();
        self.sync_listeners.write().push((id, listener));
        debug!(listener_id = ?id.0, "Synchronous configuration listener registered");
        id
    }

    /// Remove a listener of either flavor.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.listeners.write().retain(|(l, _)| {
            let keep = *l != id;
            removed |= !keep;
            keep
        });
        self.sync_listeners.write().retain(|(l, _)| {
            let keep = *l != id;
            removed |= !keep;
            keep
        });
        removed
    }

    /// Run the synchronous listeners on the calling thread. A panicking
    /// listener is logged and does not stop the others.
    pub fn notify_sync(&self, event: &ConfigurationEvent) {
        let listeners: Vec<SyncEntry> = self.sync_listeners.read().clone();
        for (id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.configuration_event(event)));
            if outcome.is_err() {
                error!(listener_id = ?id.0, kind = %event.kind, pid = %event.pid, "Synchronous listener panicked");
            }
        }
    }

    /// Freeze the asynchronous listener set for one event, or `None` if
    /// nobody is listening.
    pub fn dispatch(&self, event: ConfigurationEvent) -> Option<EventDispatch> {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return None;
        }
        Some(EventDispatch { event, listeners })
    }
}

/// One event with the listeners it goes to.
pub struct EventDispatch {
    event: ConfigurationEvent,
    listeners: Vec<AsyncEntry>,
}

impl EventDispatch {
    pub fn event(&self) -> &ConfigurationEvent {
        &self.event
    }
}

impl fmt::Display for EventDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fire ConfigurationEvent: kind={}, pid={}, listeners={}",
            self.event.kind,
            self.event.pid,
            self.listeners.len()
        )
    }
}

/// Delivers queued events to their listeners.
pub struct EventDispatcher;

#[async_trait]
impl TaskRunner<EventDispatch> for EventDispatcher {
    async fn run(&self, dispatch: EventDispatch) {
        for (id, listener) in &dispatch.listeners {
            if let Err(e) = listener.configuration_event(&dispatch.event).await {
                error!(
                    listener_id = ?id.0,
                    kind = %dispatch.event.kind,
                    pid = %dispatch.event.pid,
                    error = %e,
                    "Configuration listener failed"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub events: Mutex<Vec<ConfigurationEvent>>,
        pub fail: bool,
    }

    #[async_trait]
    impl ConfigurationListener for RecordingListener {
        async fn configuration_event(&self, event: &ConfigurationEvent) -> Result<(), ListenerError> {
            self.events.lock().push(event.clone());
            if self.fail {
                return Err(ListenerError("rejected".into()));
            }
            Ok(())
        }
    }

    impl SynchronousConfigurationListener for RecordingListener {
        fn configuration_event(&self, event: &ConfigurationEvent) {
            self.events.lock().push(event.clone());
        }
    }

    struct Panicking;

    impl SynchronousConfigurationListener for Panicking {
        fn configuration_event(&self, _: &ConfigurationEvent) {
            panic!("listener bug");
        }
    }

    fn event() -> ConfigurationEvent {
        ConfigurationEvent::new(ConfigurationEventKind::Updated, "svc", None)
    }

    #[test]
    fn sync_listeners_run_inline_and_survive_panics() {
        let registry = ListenerRegistry::new();
        registry.add_sync(Arc::new(Panicking));
        let recorder = Arc::new(RecordingListener::default());
        registry.add_sync(recorder.clone());

        registry.notify_sync(&event());
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn dispatch_snapshots_listeners() {
        let registry = ListenerRegistry::new();
        assert!(registry.dispatch(event()).is_none());

        let id = registry.add(Arc::new(RecordingListener::default()));
        let dispatch = registry.dispatch(event()).unwrap();
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(dispatch.listeners.len(), 1);
        assert!(dispatch.to_string().contains("CM_UPDATED"));
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_others() {
        let registry = ListenerRegistry::new();
        let failing = Arc::new(RecordingListener {
            fail: true,
            ..Default::default()
        });
        let ok = Arc::new(RecordingListener::default());
        registry.add(failing.clone());
        registry.add(ok.clone());

        let dispatch = registry.dispatch(event()).unwrap();
        EventDispatcher.run(dispatch).await;
        assert_eq!(failing.events.lock().len(), 1);
        assert_eq!(ok.events.lock().len(), 1);
    }
}
