//! Single-slot status of the in-flight request, with ordered listeners.
//!
//! Not persisted. The channel is owned by whatever drives the UI lifecycle;
//! there is no module-level instance.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Idle,
    Thinking,
    Streaming,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub kind: RequestKind,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current non-idle stretch; `None` while idle.
    pub request_started_at: Option<DateTime<Utc>>,
}

impl RequestStatus {
    fn idle(now: DateTime<Utc>) -> Self {
        Self {
            kind: RequestKind::Idle,
            detail: None,
            updated_at: now,
            request_started_at: None,
        }
    }

    /// Time since the request started, measured at `now`.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.request_started_at.map(|start| now - start)
    }
}

pub type StatusListener = Arc<dyn Fn(&RequestStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registry {
    next_id: u64,
    listeners: Vec<(SubscriptionId, StatusListener)>,
}

pub struct RequestStatusChannel {
    state: Mutex<RequestStatus>,
    registry: Mutex<Registry>,
}

impl Default for RequestStatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStatusChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RequestStatus::idle(Utc::now())),
            registry: Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> RequestStatus {
        self.state.lock().clone()
    }

    /// Register a listener; it is called on every later change, after the
    /// listeners registered before it.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&RequestStatus) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Safe to call from inside a listener; the removal
    /// takes effect from the next change.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    pub fn set(&self, kind: RequestKind, detail: Option<String>) -> RequestStatus {
        self.set_at(kind, detail, Utc::now())
    }

    /// Transition to `kind` at `now` and notify listeners.
    pub fn set_at(
        &self,
        kind: RequestKind,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> RequestStatus {
        let next = {
            let mut state = self.state.lock();
            let request_started_at = match kind {
                RequestKind::Idle => None,
                _ => state.request_started_at.or(Some(now)),
            };
            *state = RequestStatus {
                kind,
                detail,
                updated_at: now,
                request_started_at,
            };
            state.clone()
        };

        // Dispatch from a snapshot so listeners may (un)subscribe freely.
        let listeners: Vec<StatusListener> = self
            .registry
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&next);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_starts_idle() {
        let channel = RequestStatusChannel::new();
        let status = channel.current();
        assert_eq!(status.kind, RequestKind::Idle);
        assert!(status.request_started_at.is_none());
    }

    #[test]
    fn test_start_time_survives_non_idle_transitions() {
        let channel = RequestStatusChannel::new();
        channel.set_at(RequestKind::Thinking, None, at(0));
        channel.set_at(RequestKind::Tool, Some("bash".into()), at(5));
        let status = channel.set_at(RequestKind::Streaming, None, at(9));

        assert_eq!(status.request_started_at, Some(at(0)));
        assert_eq!(status.updated_at, at(9));
        assert_eq!(status.elapsed_at(at(10)), Some(chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_idle_clears_start_time() {
        let channel = RequestStatusChannel::new();
        channel.set_at(RequestKind::Thinking, None, at(0));
        let idle = channel.set_at(RequestKind::Idle, None, at(3));
        assert!(idle.request_started_at.is_none());

        let again = channel.set_at(RequestKind::Tool, None, at(7));
        assert_eq!(again.request_started_at, Some(at(7)));
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let channel = RequestStatusChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let seen = Arc::clone(&seen);
            channel.subscribe(move |status| seen.lock().push((name, status.kind)));
        }
        channel.set_at(RequestKind::Thinking, None, at(0));
        channel.set_at(RequestKind::Idle, None, at(1));

        assert_eq!(
            *seen.lock(),
            vec![
                ("first", RequestKind::Thinking),
                ("second", RequestKind::Thinking),
                ("first", RequestKind::Idle),
                ("second", RequestKind::Idle),
            ]
        );
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let channel = Arc::new(RequestStatusChannel::new());
        let calls = Arc::new(Mutex::new(0));
        let own_id = Arc::new(Mutex::new(None));

        let id = {
            let inner = Arc::clone(&channel);
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            channel.subscribe(move |_| {
                *calls.lock() += 1;
                if let Some(id) = *own_id.lock() {
                    inner.unsubscribe(id);
                }
            })
        };
        *own_id.lock() = Some(id);

        channel.set_at(RequestKind::Thinking, None, at(0));
        channel.set_at(RequestKind::Tool, None, at(1));
        assert_eq!(*calls.lock(), 1);
        assert!(!channel.unsubscribe(id));
    }
}
