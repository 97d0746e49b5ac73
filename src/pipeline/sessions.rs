//! Session lifecycle and the `session_id -> active session` map.
//!
//! Session-key resolution follows the usual "explicit id wins,
//! otherwise the active session for the producer's context" rule,
//! narrowed here to at most one active session per device id.
//! Reference counting for subsystems a session shares with another
//! (log tailer, recorder, proxy reverse, device monitor) is modeled
//! here too, since `EndSession` must only stop what this session itself
//! started.

use crate::error::{CoreError, CoreResult};
use crate::events::{generate_event_id, Event, EventSource, Session, SessionConfig, SessionStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Event sources allowed to be emitted with no session bound; every
    /// other source is dropped when no active session exists for its device.
    pub allow_unbound_sources: HashSet<EventSource>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        let mut allow = HashSet::new();
        allow.insert(EventSource::System);
        SessionManagerConfig {
            allow_unbound_sources: allow,
        }
    }
}

struct Inner {
    active_by_device: HashMap<String, Session>,
    resource_refs: HashMap<String, u32>,
}

pub struct SessionManager {
    config: SessionManagerConfig,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        SessionManager {
            config,
            inner: Mutex::new(Inner {
                active_by_device: HashMap::new(),
                resource_refs: HashMap::new(),
            }),
        }
    }

    /// `StartSession` fails with `AlreadyActive` if the device already
    /// has one running.
    pub fn start_session(
        &self,
        id: impl Into<String>,
        device_id: impl Into<String>,
        session_type: impl Into<String>,
        name: impl Into<String>,
        now_ms: i64,
        config: SessionConfig,
    ) -> CoreResult<Session> {
        let device_id = device_id.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.active_by_device.contains_key(&device_id) {
            return Err(CoreError::already_active(format!(
                "device {device_id} already has an active session"
            )));
        }
        let session = Session::new(id, device_id.clone(), session_type, name, now_ms, config.clone());

        // Claim shared resources this session is starting.
        if config.log_tailing {
            self.bump_ref(&mut inner, &format!("log:{device_id}"));
        }
        if config.screen_recording {
            self.bump_ref(&mut inner, &format!("video:{device_id}"));
        }
        if config.intercepting_proxy {
            self.bump_ref(&mut inner, &format!("proxy:{device_id}"));
        }
        if config.device_state_poller {
            self.bump_ref(&mut inner, &format!("poller:{device_id}"));
        }

        inner.active_by_device.insert(device_id, session.clone());
        Ok(session)
    }

    fn bump_ref(&self, inner: &mut Inner, key: &str) {
        *inner.resource_refs.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Returns the set of resource keys this session should actually
    /// tear down: the ones it started, each decremented, torn down only
    /// when the ref count reaches zero.
    fn release_refs(&self, inner: &mut Inner, device_id: &str, config: &SessionConfig) -> Vec<String> {
        let mut to_stop = Vec::new();
        let mut maybe_release = |flag: bool, kind: &str| {
            if !flag {
                return;
            }
            let key = format!("{kind}:{device_id}");
            if let Some(count) = inner.resource_refs.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.resource_refs.remove(&key);
                    to_stop.push(key);
                }
            }
        };
        maybe_release(config.log_tailing, "log");
        maybe_release(config.screen_recording, "video");
        maybe_release(config.intercepting_proxy, "proxy");
        maybe_release(config.device_state_poller, "poller");
        to_stop
    }

    /// `EndSession`: idempotent. A second call on an already-closed
    /// session is a no-op returning the stored state, not an error.
    pub fn end_session(&self, id: &str, status: SessionStatus, now_ms: i64) -> CoreResult<(Session, Vec<String>)> {
        let mut inner = self.inner.lock().unwrap();
        let device_id = inner
            .active_by_device
            .iter()
            .find(|(_, s)| s.id == id)
            .map(|(d, _)| d.clone());

        let Some(device_id) = device_id else {
            return Err(CoreError::not_found(format!("no active session {id}")));
        };

        let mut session = inner.active_by_device.remove(&device_id).unwrap();
        session.status = status;
        session.end_time = now_ms;
        session.updated_at = now_ms;
        let to_stop = self.release_refs(&mut inner, &device_id, &session.config);
        Ok((session, to_stop))
    }

    pub fn active_for_device(&self, device_id: &str) -> Option<Session> {
        self.inner.lock().unwrap().active_by_device.get(device_id).cloned()
    }

    /// Resolves the event's session (explicit id, or the active session
    /// for its device), assigns `id`/`timestamp`/`relative_time`.
    /// Returns `false` when the event must be dropped (unbound source
    /// with no active session).
    pub fn resolve_and_stamp(&self, event: &mut Event) -> bool {
        let inner = self.inner.lock().unwrap();

        if event.session_id.is_empty() {
            match inner.active_by_device.get(&event.device_id) {
                Some(session) => event.session_id = session.id.clone(),
                None => {
                    if !self.config.allow_unbound_sources.contains(&event.source) {
                        return false;
                    }
                    event.session_id = "none".to_string();
                }
            }
        }

        let start_time = inner
            .active_by_device
            .values()
            .find(|s| s.id == event.session_id)
            .map(|s| s.start_time)
            .unwrap_or(event.timestamp);

        if event.id.is_empty() {
            event.id = generate_event_id();
        }
        if event.timestamp == 0 {
            event.timestamp = chrono::Utc::now().timestamp_millis();
        }
        event.relative_time = (event.timestamp - start_time).max(0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCategory, EventLevel};

    #[test]
    fn second_start_on_same_device_fails() {
        let mgr = SessionManager::new(SessionManagerConfig::default());
        mgr.start_session("s1", "D1", "manual", "a", 1000, SessionConfig::default()).unwrap();
        let err = mgr
            .start_session("s2", "D1", "manual", "b", 1000, SessionConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), "already_active");
    }

    #[test]
    fn end_session_is_idempotent() {
        let mgr = SessionManager::new(SessionManagerConfig::default());
        mgr.start_session("s1", "D1", "manual", "a", 1000, SessionConfig::default()).unwrap();
        mgr.end_session("s1", SessionStatus::Closed, 2000).unwrap();
        let err = mgr.end_session("s1", SessionStatus::Closed, 2000).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn unbound_non_system_event_is_dropped() {
        let mgr = SessionManager::new(SessionManagerConfig::default());
        let mut e = Event::new("D1", EventSource::Touch, EventCategory::Interaction, "tap", EventLevel::Info, "tap");
        assert!(!mgr.resolve_and_stamp(&mut e));
    }

    #[test]
    fn bound_event_gets_relative_time() {
        let mgr = SessionManager::new(SessionManagerConfig::default());
        mgr.start_session("s1", "D1", "manual", "a", 1000, SessionConfig::default()).unwrap();
        let mut e = Event::new("D1", EventSource::Touch, EventCategory::Interaction, "tap", EventLevel::Info, "tap");
        e.timestamp = 1150;
        assert!(mgr.resolve_and_stamp(&mut e));
        assert_eq!(e.session_id, "s1");
        assert_eq!(e.relative_time, 150);
    }
}
