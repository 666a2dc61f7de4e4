use crate::signal::Target;
use crate::types::media::MediaKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize)]
pub struct Connected {
    pub connection_id: String,
    pub endpoint_id: String,
    pub at: DateTime<Utc>,
}

/// Emitted after a connection is re-established following a transport loss.
/// Never emitted for the first connection of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Reconnected {
    pub connection_id: String,
    pub endpoint_id: String,
    pub rejoined_groups: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Disconnected {
    pub will_reconnect: bool,
}

/// The server refused our credentials. The client stops reconnecting.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationFailed {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CallEventKind {
    Answer,
    Approve,
    /// Local media acquisition started.
    RequestingMedia,
    /// Local media is available (for previewing before `approve`).
    LocalMedia,
    Connect,
    /// The remote side started a new round. The application decides whether
    /// to answer it.
    Modify {
        direct_connection: Option<bool>,
    },
    ModifyAccepted,
    ModifyRejected {
        reason: String,
    },
    Mute {
        kind: MediaKind,
        muted: bool,
    },
    DirectConnectionOpen,
    DirectConnectionClosed,
    DirectMessage {
        message: String,
    },
    Error {
        message: String,
    },
    Hangup {
        reason: String,
        sent_signal: bool,
        duration_secs: Option<i64>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    pub session_id: String,
    pub target: Target,
    pub kind: CallEventKind,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Connected(Connected),
    Reconnected(Reconnected),
    Disconnected(Disconnected),
    AuthorizationFailed(AuthorizationFailed),
    Call(CallEvent),
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

/// Two subscriber lists. Internal handlers maintain the client's own
/// bookkeeping (session registry) and always run before external handlers,
/// which belong to the application.
#[derive(Default, Clone)]
pub struct EventBus {
    internal: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    external: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_internal_handler(&self, handler: Arc<dyn EventHandler>) {
        self.internal
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.external
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn dispatch(&self, event: &Event) {
        // Snapshot so a handler may register another handler without deadlocking.
        let internal = self
            .internal
            .read()
            .expect("RwLock should not be poisoned")
            .clone();
        for handler in internal {
            handler.handle_event(event);
        }
        let external = self
            .external
            .read()
            .expect("RwLock should not be poisoned")
            .clone();
        for handler in external {
            handler.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EventHandler for Recorder {
        fn handle_event(&self, _event: &Event) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    #[test]
    fn test_internal_handlers_run_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.add_handler(Arc::new(Recorder {
            name: "external",
            log: log.clone(),
        }));
        bus.add_internal_handler(Arc::new(Recorder {
            name: "internal",
            log: log.clone(),
        }));

        bus.dispatch(&Event::Disconnected(Disconnected {
            will_reconnect: true,
        }));
        assert_eq!(*log.lock().unwrap(), vec!["internal", "external"]);
    }
}
