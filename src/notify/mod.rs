//! Security notifications.
//!
//! The gateway raises events (rate-limit violations, circuits opening,
//! authentication failures) through a [`SecurityNotifier`]. Delivery is the
//! implementation's concern; calls must return immediately.

use serde::Serialize;

/// Event raised toward the security / audit sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEvent {
    RateLimitExceeded {
        policy: String,
        identity: String,
        path: String,
        request_id: Option<String>,
    },
    CircuitOpened {
        service: String,
    },
    AuthenticationFailed {
        service: String,
        reason: String,
        client_ip: String,
        request_id: Option<String>,
    },
}

/// Fire-and-forget sink for security events
pub trait SecurityNotifier: Send + Sync {
    fn notify(&self, event: SecurityEvent);
}

/// Notifier that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl SecurityNotifier for NoopNotifier {
    fn notify(&self, _event: SecurityEvent) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Notifier that keeps every event for assertions
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<SecurityEvent>>,
    }

    impl RecordingNotifier {
        pub fn events(&self) -> Vec<SecurityEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl SecurityNotifier for RecordingNotifier {
        fn notify(&self, event: SecurityEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
