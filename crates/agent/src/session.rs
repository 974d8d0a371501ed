// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle: continuity decision, per-tab persistence, and
//! advisory cross-tab notification.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::UserIdentity;
use crate::epoch_ms;
use crate::store::{StateStore, SESSION_STATE_KEY};

/// Cross-tab broadcast channel name.
pub const SESSION_CHANNEL: &str = "perceptr_session";

const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_MAX_SESSION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-tab session identity. Replaced, never mutated, when continuity fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub start_time: u64,
    pub last_activity_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<UserIdentity>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub inactivity_timeout: Option<Duration>,
    /// Legacy name for `inactivity_timeout`; consulted only when the
    /// latter is unset.
    pub stale_threshold: Option<Duration>,
    pub max_session_duration: Option<Duration>,
}

impl SessionOptions {
    fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
            .or(self.stale_threshold)
            .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT)
    }

    fn max_session_duration(&self) -> Duration {
        self.max_session_duration.unwrap_or(DEFAULT_MAX_SESSION_DURATION)
    }
}

/// Advisory messages posted on the cross-tab channel. Lossy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    SessionStart { session_id: String, start_time: u64 },
    Activity { session_id: String, last_activity_time: u64 },
}

/// Decides whether a tab's session continues or a new one starts, and is
/// the sole writer of session state.
pub struct SessionManager {
    options: SessionOptions,
    store: Arc<dyn StateStore>,
    current: RwLock<Option<SessionState>>,
    channel: Option<broadcast::Sender<SessionMessage>>,
}

impl SessionManager {
    /// `channel` is the cross-tab broadcast sender; pass `None` where the
    /// host has no such channel.
    pub fn new(
        options: SessionOptions,
        store: Arc<dyn StateStore>,
        channel: Option<broadcast::Sender<SessionMessage>>,
    ) -> Self {
        Self { options, store, current: RwLock::new(None), channel }
    }

    /// Whether a session with the given timestamps continues at `now`.
    ///
    /// Continues iff activity is strictly within the inactivity window
    /// AND age is strictly within the maximum duration.
    pub fn should_continue(&self, last_activity_time: u64, start_time: u64, now: u64) -> bool {
        let inactivity = self.options.inactivity_timeout().as_millis() as u64;
        let max_duration = self.options.max_session_duration().as_millis() as u64;
        now.saturating_sub(last_activity_time) < inactivity
            && now.saturating_sub(start_time) < max_duration
    }

    /// Adopt the prior session when it continues, otherwise mint a fresh
    /// one, persist it, and announce it. Idempotent within a tab.
    pub fn get_or_create_session(&self) -> SessionState {
        let now = epoch_ms();

        let prior = self.current.read().clone().or_else(|| self.read_persisted());
        if let Some(state) = prior {
            if self.should_continue(state.last_activity_time, state.start_time, now) {
                *self.current.write() = Some(state.clone());
                return state;
            }
            debug!(session_id = %state.session_id, "session expired, starting a new one");
        }

        let fresh = SessionState {
            session_id: Uuid::new_v4().to_string(),
            start_time: now,
            last_activity_time: now,
            user_identity: None,
        };
        self.persist(&fresh);
        *self.current.write() = Some(fresh.clone());
        self.post(SessionMessage::SessionStart {
            session_id: fresh.session_id.clone(),
            start_time: fresh.start_time,
        });
        fresh
    }

    /// Record activity now. No-op when no session is bound.
    pub fn update_activity(&self) {
        let snapshot = {
            let mut guard = self.current.write();
            let Some(state) = guard.as_mut() else {
                return;
            };
            state.last_activity_time = epoch_ms();
            state.clone()
        };
        self.persist(&snapshot);
        self.post(SessionMessage::Activity {
            session_id: snapshot.session_id,
            last_activity_time: snapshot.last_activity_time,
        });
    }

    pub fn set_current_state(&self, state: SessionState) {
        *self.current.write() = Some(state);
    }

    pub fn get_current_state(&self) -> Option<SessionState> {
        self.current.read().clone()
    }

    fn read_persisted(&self) -> Option<SessionState> {
        let raw = self.store.get(SESSION_STATE_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(err = %e, "discarding unreadable persisted session state");
                None
            }
        }
    }

    fn persist(&self, state: &SessionState) {
        let Ok(json) = serde_json::to_string(state) else {
            return;
        };
        if let Err(e) = self.store.set(SESSION_STATE_KEY, &json) {
            warn!(err = %e, "failed to persist session state");
        }
    }

    fn post(&self, message: SessionMessage) {
        if let Some(ref tx) = self.channel {
            let _ = tx.send(message);
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
