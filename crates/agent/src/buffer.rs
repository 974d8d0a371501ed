// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The batching engine.
//!
//! Events accumulate in memory until size, age, or the flush timer
//! triggers an upload. Failed uploads back off exponentially with the
//! events kept in order; unload-time persistence parks unsent events in
//! the durable store; replay drains them on the next load. Successive
//! batches of a session form a contiguous chronology: each flush's
//! `start_time` equals the previous flush's `end_time`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::ApiClient;
use crate::batch::{Batch, BatchMetadata, UserIdentity};
use crate::epoch_ms;
use crate::error::{ErrorChannel, ErrorKind};
use crate::events::{EventRecord, CONSOLE_PLUGIN, EVENT_PLUGIN};
use crate::session::{SessionManager, SessionState};
use crate::store::{StateStore, BUFFER_DATA_KEY};

// Internal tuning; none of this is host-configurable.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;
const FLUSH_THRESHOLD_RATIO: f64 = 0.9;
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const MAX_BUFFER_AGE_MS: u64 = 300_000;
const BACKOFF_INTERVAL_MS: u64 = 5_000;
const MAX_BACKOFF_INTERVAL_MS: u64 = 300_000;
const HARD_DROP_THRESHOLD: usize = 140 * 1024 * 1024;
const DROP_KEEP_RATIO: f64 = 0.8;
const MAX_PERSISTED_SESSIONS: usize = 3;

/// Marker prefixed to the SDK's own console output. Console-plugin
/// records carrying it are dropped to break the capture feedback loop.
pub const SDK_LOG_MARKER: &str = "[Perceptr]";

/// An unsent buffer parked in the durable store across unloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedBuffer {
    pub session_id: String,
    pub batch_id: String,
    pub start_time: u64,
    pub end_time: u64,
    pub last_activity_time: u64,
    pub size: u64,
    pub events: Vec<EventRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<UserIdentity>,
}

/// Whether buffered bytes/age warrant a flush.
pub(crate) fn should_flush(size: usize, age_ms: u64) -> bool {
    size >= (MAX_BUFFER_SIZE as f64 * FLUSH_THRESHOLD_RATIO) as usize || age_ms > MAX_BUFFER_AGE_MS
}

/// Deadline before which no non-terminal flush may run after `failures`
/// consecutive failures.
pub(crate) fn backoff_deadline(now: u64, failures: u32) -> u64 {
    let exp = BACKOFF_INTERVAL_MS.saturating_mul(2u64.saturating_pow(failures.saturating_sub(1)));
    now + exp.min(MAX_BACKOFF_INTERVAL_MS)
}

/// A console-plugin record produced by the SDK's own logging.
pub(crate) fn is_internal_log(event: &EventRecord) -> bool {
    let EventRecord::Dom(e) = event else {
        return false;
    };
    if e.kind != EVENT_PLUGIN || e.plugin_name() != Some(CONSOLE_PLUGIN) {
        return false;
    }
    e.first_console_arg().map(|s| s.contains(SDK_LOG_MARKER)).unwrap_or(false)
}

#[derive(Default)]
struct BufferState {
    events: Vec<EventRecord>,
    size: usize,
    /// When the oldest unsent event was enqueued.
    buffer_started_ms: Option<u64>,
    session: Option<SessionState>,
    user_identity: Option<UserIdentity>,
    last_batch_end_time: Option<u64>,
    flush_failures: u32,
    backoff_until: Option<u64>,
}

#[derive(Clone)]
pub struct EventBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    api: Arc<ApiClient>,
    store: Arc<dyn StateStore>,
    sessions: Arc<SessionManager>,
    errors: ErrorChannel,
    compress: bool,
    state: Mutex<BufferState>,
    flush_in_progress: AtomicBool,
    cancel: CancellationToken,
}

/// Clears the in-progress guard however the flush exits.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EventBuffer {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<dyn StateStore>,
        sessions: Arc<SessionManager>,
        errors: ErrorChannel,
        compress: bool,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                api,
                store,
                sessions,
                errors,
                compress,
                state: Mutex::new(BufferState::default()),
                flush_in_progress: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Bind the buffer to a session. A changed session id parks the old
    /// session's events for replay and resets chronology.
    pub fn set_session_state(&self, session: SessionState) {
        let changed = {
            let state = self.inner.state.lock();
            state
                .session
                .as_ref()
                .map(|s| s.session_id != session.session_id)
                .unwrap_or(false)
        };
        if changed {
            self.persist_now();
            let mut state = self.inner.state.lock();
            state.events.clear();
            state.size = 0;
            state.buffer_started_ms = None;
            state.last_batch_end_time = None;
            state.session = Some(session);
            return;
        }
        self.inner.state.lock().session = Some(session);
    }

    pub fn set_user_identity(&self, identity: UserIdentity) {
        self.inner.state.lock().user_identity = Some(identity);
    }

    pub fn pending_events(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.inner.state.lock().size
    }

    pub fn last_batch_end_time(&self) -> Option<u64> {
        self.inner.state.lock().last_batch_end_time
    }

    /// Enqueue one event. Synchronous — producers never await.
    pub fn add_event(&self, event: EventRecord) {
        if is_internal_log(&event) {
            return;
        }
        let interactive = event.is_interactive();
        let size = event.estimated_size();
        let now = epoch_ms();

        let wants_flush = {
            let mut state = self.inner.state.lock();
            if state.events.is_empty() {
                state.buffer_started_ms = Some(now);
            }
            state.size += size;
            state.events.push(event);

            let age = now.saturating_sub(state.buffer_started_ms.unwrap_or(now));
            should_flush(state.size, age)
                && !self.inner.flush_in_progress.load(Ordering::SeqCst)
                && state.backoff_until.map(|until| now >= until).unwrap_or(true)
        };

        if interactive {
            self.inner.sessions.update_activity();
        }
        if wants_flush {
            self.schedule_flush();
        }
    }

    /// Queue a flush on the runtime when one is available; producers in
    /// runtime-less contexts simply wait for the next timer tick.
    fn schedule_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let buffer = self.clone();
        handle.spawn(async move {
            tokio::task::yield_now().await;
            if let Err(e) = buffer.flush(false).await {
                debug!(err = %e, "scheduled flush failed");
            }
        });
    }

    /// Periodic flush driver; stops when the buffer is destroyed.
    pub fn spawn_flush_timer(&self) {
        let buffer = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = buffer.flush(false).await {
                    debug!(err = %e, "timed flush failed");
                }
            }
        });
    }

    /// Upload everything buffered as one batch (split as needed).
    ///
    /// Serialized: a second flush while one is in flight is a no-op.
    /// Non-terminal flushes also respect the backoff deadline; a terminal
    /// flush (`is_session_ended`) ignores it.
    pub async fn flush(&self, is_session_ended: bool) -> anyhow::Result<()> {
        if self.inner.flush_in_progress.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = FlushGuard(&self.inner.flush_in_progress);
        let now = epoch_ms();

        let batch = {
            let mut state = self.inner.state.lock();
            if !is_session_ended {
                if let Some(until) = state.backoff_until {
                    if now < until {
                        return Ok(());
                    }
                }
            }
            if state.events.is_empty() {
                return Ok(());
            }
            let Some(session) = state.session.clone() else {
                debug!("no session bound, skipping flush");
                return Ok(());
            };

            let events = std::mem::take(&mut state.events);
            let size = std::mem::replace(&mut state.size, 0);
            state.buffer_started_ms = None;
            let start_time = state.last_batch_end_time.unwrap_or(session.start_time);

            Batch {
                session_id: session.session_id.clone(),
                batch_id: Uuid::new_v4().to_string(),
                is_session_ended,
                start_time,
                end_time: now,
                size: size as u64,
                metadata: BatchMetadata {
                    event_count: events.len(),
                    compressed: self.inner.compress,
                    extra: Default::default(),
                },
                data: events,
                user_identity: state.user_identity.clone().or(session.user_identity),
            }
        };
        let end_time = batch.end_time;

        // Network I/O happens outside the lock; enqueues continue meanwhile.
        let mut failure: Option<anyhow::Error> = None;
        let mut unsent: Vec<EventRecord> = Vec::new();
        let mut sent_any = false;
        for piece in batch.split() {
            if failure.is_some() {
                unsent.extend(piece.data);
                continue;
            }
            match self.inner.api.send_events(&piece).await {
                Ok(()) => sent_any = true,
                Err(e) => {
                    unsent.extend(piece.data);
                    failure = Some(e);
                }
            }
        }

        match failure {
            None => {
                let mut state = self.inner.state.lock();
                state.last_batch_end_time = Some(end_time);
                state.flush_failures = 0;
                state.backoff_until = None;
                Ok(())
            }
            Some(e) => {
                {
                    let mut state = self.inner.state.lock();
                    // Delivered pieces went out with this window's end
                    // time; the retry must open after them to keep batch
                    // boundaries contiguous.
                    if sent_any {
                        state.last_batch_end_time = Some(end_time);
                    }
                    // Unsent events go back in front of anything enqueued
                    // during the attempt, preserving order.
                    let restored: usize = unsent.iter().map(EventRecord::estimated_size).sum();
                    let mut newer = std::mem::replace(&mut state.events, unsent);
                    state.events.append(&mut newer);
                    state.size += restored;
                    if state.buffer_started_ms.is_none() {
                        state.buffer_started_ms = Some(now);
                    }
                    state.flush_failures += 1;
                    state.backoff_until = Some(backoff_deadline(epoch_ms(), state.flush_failures));
                    enforce_hard_cap(&mut state);
                }
                self.inner
                    .errors
                    .report(ErrorKind::UploadFailure, format!("batch upload failed: {e:#}"));
                if is_session_ended {
                    self.persist_now();
                    self.inner.errors.report(
                        ErrorKind::ExportFailure,
                        "terminal flush failed, buffer persisted for next load",
                    );
                }
                Err(e)
            }
        }
    }

    /// Synchronously park unsent events in the durable store. Called on
    /// hidden-visibility and unload, and after a failed terminal flush.
    pub fn persist_now(&self) {
        let entry = {
            let state = self.inner.state.lock();
            let Some(session) = state.session.clone() else {
                return;
            };
            if state.events.is_empty() {
                return;
            }
            PersistedBuffer {
                session_id: session.session_id.clone(),
                batch_id: Uuid::new_v4().to_string(),
                start_time: state.last_batch_end_time.unwrap_or(session.start_time),
                end_time: epoch_ms(),
                last_activity_time: session.last_activity_time,
                size: state.size as u64,
                events: state.events.clone(),
                user_identity: state.user_identity.clone(),
            }
        };

        let mut entries = self.load_entries();
        entries.retain(|e| e.session_id != entry.session_id);
        entries.push(entry);
        // Keep only the most recent sessions.
        if entries.len() > MAX_PERSISTED_SESSIONS {
            entries.sort_by_key(|e| e.end_time);
            let excess = entries.len() - MAX_PERSISTED_SESSIONS;
            entries.drain(..excess);
        }
        self.save_entries(&entries);
        debug!(sessions = entries.len(), "buffer persisted");
    }

    /// Replay buffers parked by earlier loads.
    ///
    /// Same-session entries keep the live chronology (`start_time`
    /// overridden by `last_batch_end_time` when set) and stay non-terminal;
    /// carryovers from other sessions are by definition terminal for their
    /// owner. Sent and empty entries are removed; failures stay parked.
    pub async fn flush_persisted_buffers(&self) {
        let entries = self.load_entries();
        if entries.is_empty() {
            return;
        }
        let (current_session, last_end) = {
            let state = self.inner.state.lock();
            (
                state.session.as_ref().map(|s| s.session_id.clone()),
                state.last_batch_end_time,
            )
        };

        let mut remaining: Vec<PersistedBuffer> = Vec::new();
        for entry in entries {
            if entry.events.is_empty() {
                continue;
            }
            let same_session = current_session.as_deref() == Some(entry.session_id.as_str());
            let start_time = if same_session {
                last_end.unwrap_or(entry.start_time)
            } else {
                entry.start_time
            };
            let batch = Batch {
                session_id: entry.session_id.clone(),
                batch_id: entry.batch_id.clone(),
                is_session_ended: !same_session,
                start_time,
                end_time: entry.end_time,
                size: entry.size,
                metadata: BatchMetadata {
                    event_count: entry.events.len(),
                    compressed: self.inner.compress,
                    extra: Default::default(),
                },
                data: entry.events.clone(),
                user_identity: entry.user_identity.clone(),
            };

            let mut sent = true;
            for piece in batch.split() {
                if let Err(e) = self.inner.api.send_events(&piece).await {
                    self.inner.errors.report(
                        ErrorKind::UploadFailure,
                        format!("persisted buffer replay failed: {e:#}"),
                    );
                    sent = false;
                    break;
                }
            }

            if sent {
                debug!(session_id = %entry.session_id, "persisted buffer replayed");
                if same_session {
                    let mut state = self.inner.state.lock();
                    if state.last_batch_end_time.unwrap_or(0) < entry.end_time {
                        state.last_batch_end_time = Some(entry.end_time);
                    }
                }
            } else {
                remaining.push(entry);
            }
        }
        self.save_entries(&remaining);
    }

    /// Terminal teardown: stop the timer and flush whatever remains with
    /// the session-ended flag. A failed terminal flush persists instead.
    pub async fn destroy(&self) {
        self.inner.cancel.cancel();
        let has_events = !self.inner.state.lock().events.is_empty();
        if has_events {
            // flush() persists on terminal failure.
            let _ = self.flush(true).await;
        }
    }

    pub(crate) fn load_entries(&self) -> Vec<PersistedBuffer> {
        self.inner
            .store
            .get(BUFFER_DATA_KEY)
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    warn!(err = %e, "discarding unreadable persisted buffers");
                    None
                }
            })
            .unwrap_or_default()
    }

    fn save_entries(&self, entries: &[PersistedBuffer]) {
        let Ok(json) = serde_json::to_string(entries) else {
            return;
        };
        if let Err(e) = self.inner.store.set(BUFFER_DATA_KEY, &json) {
            warn!(err = %e, "failed to persist buffers");
        }
    }

    #[cfg(test)]
    pub(crate) fn force_backoff(&self, until: u64, failures: u32) {
        let mut state = self.inner.state.lock();
        state.backoff_until = Some(until);
        state.flush_failures = failures;
    }

    #[cfg(test)]
    pub(crate) fn backoff_until(&self) -> Option<u64> {
        self.inner.state.lock().backoff_until
    }

    #[cfg(test)]
    pub(crate) fn flush_failures(&self) -> u32 {
        self.inner.state.lock().flush_failures
    }
}

/// Past the hard threshold, keep only the newest events. This is the
/// pipeline's single intentional data-loss path.
fn enforce_hard_cap(state: &mut BufferState) {
    enforce_cap_at(state, HARD_DROP_THRESHOLD);
}

fn enforce_cap_at(state: &mut BufferState, threshold: usize) {
    if state.size <= threshold {
        return;
    }
    let keep = (state.events.len() as f64 * DROP_KEEP_RATIO) as usize;
    let dropped = state.events.len() - keep;
    state.events.drain(..dropped);
    state.size = state.events.iter().map(EventRecord::estimated_size).sum();
    warn!(dropped, kept = keep, "buffer over hard threshold, dropped oldest events");
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
