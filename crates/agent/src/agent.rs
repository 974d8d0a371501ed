// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline orchestration.
//!
//! The orchestrator owns every singleton, gates the public operations on
//! the async initialization, and composes the visibility handlers: the
//! buffer saves on hidden, the orchestrator replays on visible.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::api::ApiClient;
use crate::batch::UserIdentity;
use crate::buffer::EventBuffer;
use crate::config::AgentConfig;
use crate::error::{AgentError, ErrorChannel, ErrorKind};
use crate::events::EventRecord;
use crate::memwatch::{MemoryProbe, MemoryWatch};
use crate::network::{DispatcherSlot, NetworkTap, NetworkTapOptions};
use crate::recorder::{DomRecorder, HrefProbe, RecorderOptions, RecordingPrimitive};
use crate::session::{SessionManager, SessionMessage};
use crate::store::StateStore;

const VISIBILITY_DEBOUNCE: Duration = Duration::from_millis(400);

/// Host tab visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// The host-environment seams the agent is wired into.
pub struct Platform {
    pub store: Arc<dyn StateStore>,
    pub recording: Arc<dyn RecordingPrimitive>,
    pub fetch_slot: DispatcherSlot,
    pub xhr_slot: DispatcherSlot,
    pub memory_probes: Vec<Arc<dyn MemoryProbe>>,
    pub href_probe: Option<HrefProbe>,
    /// Cross-tab broadcast sender; `None` when the host has none.
    pub session_channel: Option<broadcast::Sender<SessionMessage>>,
}

struct Components {
    tap: Arc<NetworkTap>,
    recorder: DomRecorder,
    memory: Arc<MemoryWatch>,
    sessions: Arc<SessionManager>,
    buffer: EventBuffer,
}

#[derive(Clone, Debug)]
enum InitStatus {
    Pending,
    Ready,
    Failed(String),
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    errors: ErrorChannel,
    init_rx: watch::Receiver<InitStatus>,
    components: RwLock<Option<Arc<Components>>>,
    running: AtomicBool,
    paused: AtomicBool,
    visibility_epoch: AtomicU64,
}

impl Orchestrator {
    /// Construction kicks off async initialization; the public operations
    /// await it. Must be called within a tokio runtime.
    pub fn new(config: AgentConfig, platform: Platform) -> Self {
        let (init_tx, init_rx) = watch::channel(InitStatus::Pending);
        let inner = Arc::new(AgentInner {
            config,
            errors: ErrorChannel::new(),
            init_rx,
            components: RwLock::new(None),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            visibility_epoch: AtomicU64::new(0),
        });

        let init_inner = inner.clone();
        tokio::spawn(async move {
            match build_components(&init_inner, platform).await {
                Ok(components) => {
                    *init_inner.components.write() = Some(Arc::new(components));
                    let _ = init_tx.send(InitStatus::Ready);
                    info!("agent initialized");
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    init_inner.errors.report(ErrorKind::InitializationFailure, message.clone());
                    let _ = init_tx.send(InitStatus::Failed(message));
                }
            }
        });

        Self { inner }
    }

    /// Subscribe to the agent's error channel.
    pub fn errors(&self) -> broadcast::Receiver<AgentError> {
        self.inner.errors.subscribe()
    }

    fn components(&self) -> Option<Arc<Components>> {
        self.inner.components.read().clone()
    }

    async fn await_init(&self) -> anyhow::Result<Arc<Components>> {
        let mut rx = self.inner.init_rx.clone();
        loop {
            match rx.borrow().clone() {
                InitStatus::Ready => break,
                InitStatus::Failed(message) => anyhow::bail!("initialization failed: {message}"),
                InitStatus::Pending => {}
            }
            if rx.changed().await.is_err() {
                anyhow::bail!("initialization task dropped");
            }
        }
        self.components().ok_or_else(|| anyhow::anyhow!("components missing after init"))
    }

    /// Start capturing. The recorder starts immediately (the initial full
    /// snapshot must not be missed); the network tap enables on the next
    /// idle slot.
    pub async fn start(&self) -> anyhow::Result<()> {
        let c = self.await_init().await?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let buffer = c.buffer.clone();
        c.recorder.subscribe(Arc::new(move |event| buffer.add_event(EventRecord::Dom(event))));
        let buffer = c.buffer.clone();
        c.tap.subscribe(Arc::new(move |record| buffer.add_event(EventRecord::Network(record))));

        c.memory.start();

        if let Err(e) = c.recorder.start_session() {
            self.inner
                .errors
                .report(ErrorKind::RecordingFailure, format!("recorder failed to start: {e:#}"));
        }

        let tap = c.tap.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            // The pipeline may have paused or stopped before this ran.
            if inner.paused.load(Ordering::SeqCst) || !inner.running.load(Ordering::SeqCst) {
                return;
            }
            tap.enable();
        });

        c.buffer.spawn_flush_timer();
        info!("agent started");
        Ok(())
    }

    /// Stop capturing: terminal flush first, teardown on the next idle slot.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let c = self.await_init().await?;
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        c.buffer.destroy().await;

        tokio::task::yield_now().await;
        c.recorder.stop_session();
        c.tap.disable();
        c.memory.stop();
        info!("agent stopped");
        Ok(())
    }

    /// Pause capture without ending the session. Also invoked by the
    /// memory watch when the heap limit is hit.
    pub fn pause(&self) {
        let Some(c) = self.components() else {
            return;
        };
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        c.recorder.pause();
        c.tap.disable();
        c.memory.stop();
        info!("agent paused");
    }

    pub fn resume(&self) {
        let Some(c) = self.components() else {
            return;
        };
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        c.recorder.resume();
        c.tap.enable();
        c.memory.start();
        info!("agent resumed");
    }

    /// Attach a user identity to subsequent batches and drop a marker
    /// event into the chronology.
    pub async fn identify(
        &self,
        distinct_id: &str,
        traits: serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<()> {
        let c = self.await_init().await?;
        c.buffer.set_user_identity(UserIdentity {
            distinct_id: distinct_id.to_owned(),
            traits: traits.clone(),
        });
        c.recorder
            .emit_custom("$identify", json!({ "distinctId": distinct_id, "traits": traits }));
        Ok(())
    }

    /// Tab visibility transition. Hidden persists immediately (the
    /// buffer's own handler); the visible-side session re-resolution and
    /// replay are debounced so rapid flips only act on the final state.
    pub fn handle_visibility(&self, visibility: Visibility) {
        if visibility == Visibility::Hidden {
            if let Some(c) = self.components() {
                c.buffer.persist_now();
            }
        }

        let epoch = self.inner.visibility_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(VISIBILITY_DEBOUNCE).await;
            if this.inner.visibility_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            if visibility != Visibility::Visible {
                return;
            }
            let Some(c) = this.components() else {
                return;
            };
            let session = c.sessions.get_or_create_session();
            c.buffer.set_session_state(session);
            c.buffer.flush_persisted_buffers().await;
            debug!("visibility: session re-resolved and persisted buffers replayed");
        });
    }

    /// Abrupt-unload hook: synchronously park the buffer.
    pub fn handle_unload(&self) {
        if let Some(c) = self.components() {
            c.buffer.persist_now();
        }
    }
}

async fn build_components(
    inner: &Arc<AgentInner>,
    platform: Platform,
) -> anyhow::Result<Components> {
    let config = &inner.config;

    let mut api = ApiClient::new(&config.project_id, config.environment);
    if let Some(ref base) = config.api_base_url {
        api = api.with_base_url(base.clone());
    }
    let api = Arc::new(api);

    // The gate: a bad project id keeps the whole agent dark.
    if !api.check_valid_project_id().await {
        anyhow::bail!("invalid project id: {:?}", config.project_id);
    }

    let tap = Arc::new(NetworkTap::new(
        platform.fetch_slot,
        platform.xhr_slot,
        NetworkTapOptions {
            exclude_urls: config.exclude_urls.clone(),
            sanitize: config.sanitize.clone(),
            max_requests: config.max_requests,
        },
    )?);

    let recorder = DomRecorder::new(
        platform.recording,
        RecorderOptions {
            idle_timeout: config.idle_timeout(),
            max_events: config.max_events,
            blocked_urls: config.blocked_urls.clone(),
            href_probe: platform.href_probe,
            ..Default::default()
        },
    )?;

    let sessions = Arc::new(SessionManager::new(
        config.session_options(),
        platform.store.clone(),
        platform.session_channel,
    ));

    let weak = Arc::downgrade(inner);
    let memory = Arc::new(MemoryWatch::new(
        config.memory_limit_bytes,
        platform.memory_probes,
        Arc::new(move |used_bytes| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.errors.report(
                ErrorKind::MemoryLimitExceeded,
                format!("heap usage {used_bytes} bytes over limit"),
            );
            Orchestrator { inner }.pause();
        }),
    ));

    let buffer = EventBuffer::new(
        api,
        platform.store,
        sessions.clone(),
        inner.errors.clone(),
        config.compress,
    );

    let session = sessions.get_or_create_session();
    buffer.set_session_state(session);
    buffer.flush_persisted_buffers().await;

    Ok(Components { tap, recorder, memory, sessions, buffer })
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
