//! Relay session registry
//!
//! One entry per live socket or event-stream relay. Entries are owned by a
//! [`SessionGuard`]; dropping the guard is the only way a session ends, so
//! teardown runs exactly once no matter which side closed first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use canopy_config::ProtocolClass;
use canopy_observability::RelayMetrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Open,
    /// One side has closed; waiting out the grace period for the other.
    Draining,
}

/// Observable session record.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub class: ProtocolClass,
    pub path: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    sessions: DashMap<String, SessionInfo>,
    active: AtomicUsize,
    max_sessions: usize,
}

/// Shared registry of live sessions.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                active: AtomicUsize::new(0),
                max_sessions,
            }),
        }
    }

    /// Reserve a slot for a new session.
    pub fn open(&self, class: ProtocolClass, path: &str) -> Result<SessionGuard> {
        let previous = self.inner.active.fetch_add(1, Ordering::SeqCst);
        if previous >= self.inner.max_sessions {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(
                class = class.as_str(),
                max = self.inner.max_sessions,
                "Session limit reached, rejecting"
            );
            return Err(GatewayError::AtCapacity(self.inner.max_sessions));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.inner.sessions.insert(
            id.clone(),
            SessionInfo {
                id: id.clone(),
                class,
                path: path.to_string(),
                state: SessionState::Connecting,
                created_at: Utc::now(),
            },
        );
        RelayMetrics::session_opened(class.as_str());
        tracing::debug!(session_id = %id, class = class.as_str(), path, "Session opened");

        Ok(SessionGuard {
            id,
            class,
            registry: self.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.inner.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn set_state(&self, id: &str, state: SessionState) {
        if let Some(mut entry) = self.inner.sessions.get_mut(id) {
            entry.state = state;
        }
    }

    fn release(&self, id: &str) -> Option<SessionInfo> {
        let removed = self.inner.sessions.remove(id).map(|(_, info)| info);
        if removed.is_some() {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }
}

/// Ownership of one registry slot.
#[derive(Debug)]
pub struct SessionGuard {
    id: String,
    class: ProtocolClass,
    registry: SessionRegistry,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> ProtocolClass {
        self.class
    }

    pub fn set_state(&self, state: SessionState) {
        self.registry.set_state(&self.id, state);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(info) = self.registry.release(&self.id) {
            let lifetime_ms = (Utc::now() - info.created_at).num_milliseconds();
            RelayMetrics::session_closed(self.class.as_str());
            tracing::debug!(
                session_id = %self.id,
                class = self.class.as_str(),
                lifetime_ms,
                "Session closed"
            );
        }
    }
}
