// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wrapper around the external DOM-recording primitive.
//!
//! Raw events run through a fixed gauntlet: mutation rate limiting, the
//! URL blocklist (on meta events), the pause filter, and the idle-timer
//! reset. Survivors land in a bounded ring and are handed to the
//! subscribed listener.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BlockPattern;
use crate::epoch_ms;
use crate::events::{DomEvent, EVENT_INCREMENTAL, SOURCE_MUTATION};

const WATCHDOG_TICK: Duration = Duration::from_secs(1);

// -- External primitive contract ----------------------------------------------

pub type EmitFn = Arc<dyn Fn(DomEvent) + Send + Sync>;
pub type EventListener = Arc<dyn Fn(DomEvent) + Send + Sync>;
/// Reports the host page's current location.
pub type HrefProbe = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Options handed to the recording primitive.
pub struct RecordOptions {
    pub emit: EmitFn,
    pub capture_console: bool,
    pub mousemove_sample_ms: u64,
}

/// The external DOM-recording library.
pub trait RecordingPrimitive: Send + Sync {
    /// Begin recording; events flow through `options.emit` until the
    /// returned handle stops.
    fn record(&self, options: RecordOptions) -> anyhow::Result<Box<dyn RecordingHandle>>;
}

pub trait RecordingHandle: Send + Sync {
    fn stop(&self);
    /// Request a fresh full snapshot (used after heavy throttling).
    fn take_full_snapshot(&self) {}
    /// Ask the primitive to stop observing a pathological node.
    fn block_node(&self, _node_id: u64) {}
}

// -- State machine ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Idle,
    BlockedUrl,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Paused(PauseReason),
    Stopped,
}

// -- Mutation rate limiting ---------------------------------------------------

pub(crate) enum Admit {
    Pass,
    /// This event tipped the node over its budget.
    JustThrottled,
    Drop,
}

struct NodeBucket {
    tokens: f64,
    last_refill_ms: u64,
    throttled: bool,
}

/// Token bucket per node identity guarding against mutation floods.
pub(crate) struct MutationLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<u64, NodeBucket>,
}

impl MutationLimiter {
    pub(crate) fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            buckets: HashMap::new(),
        }
    }

    pub(crate) fn admit(&mut self, node: u64, now_ms: u64) -> Admit {
        let bucket = self.buckets.entry(node).or_insert(NodeBucket {
            tokens: self.capacity,
            last_refill_ms: now_ms,
            throttled: false,
        });
        let elapsed_secs = now_ms.saturating_sub(bucket.last_refill_ms) as f64 / 1_000.0;
        bucket.tokens = (bucket.tokens + elapsed_secs * self.refill_per_sec).min(self.capacity);
        bucket.last_refill_ms = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.throttled = false;
            Admit::Pass
        } else if bucket.throttled {
            Admit::Drop
        } else {
            bucket.throttled = true;
            Admit::JustThrottled
        }
    }

    pub(crate) fn reset(&mut self) {
        self.buckets.clear();
    }
}

/// Node identity of a mutation event, falling back to an aggregate bucket.
fn mutation_node_id(event: &DomEvent) -> u64 {
    if let Some(id) = event.data.get("id").and_then(|v| v.as_u64()) {
        return id;
    }
    event
        .data
        .get("adds")
        .and_then(|v| v.as_array())
        .and_then(|adds| adds.first())
        .and_then(|add| add.get("parentId"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

// -- The recorder -------------------------------------------------------------

pub struct RecorderOptions {
    pub idle_timeout: Duration,
    pub max_events: usize,
    pub blocked_urls: Vec<BlockPattern>,
    pub bucket_capacity: u32,
    pub bucket_refill_per_sec: u32,
    pub href_probe: Option<HrefProbe>,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            max_events: 10_000,
            blocked_urls: Vec::new(),
            bucket_capacity: 100,
            bucket_refill_per_sec: 10,
            href_probe: None,
        }
    }
}

#[derive(Clone)]
pub struct DomRecorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    primitive: Arc<dyn RecordingPrimitive>,
    idle_timeout: Duration,
    max_events: usize,
    blocked: Vec<Regex>,
    href_probe: Option<HrefProbe>,
    state: RwLock<RecorderState>,
    events: Mutex<VecDeque<DomEvent>>,
    listener: RwLock<Option<EventListener>>,
    handle: Mutex<Option<Box<dyn RecordingHandle>>>,
    limiter: Mutex<MutationLimiter>,
    last_interactive: Mutex<Instant>,
    last_meta: Mutex<Instant>,
    last_href: Mutex<Option<String>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl DomRecorder {
    pub fn new(
        primitive: Arc<dyn RecordingPrimitive>,
        options: RecorderOptions,
    ) -> anyhow::Result<Self> {
        let blocked = options
            .blocked_urls
            .iter()
            .map(|pattern| Regex::new(&pattern.url))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            inner: Arc::new(RecorderInner {
                primitive,
                idle_timeout: options.idle_timeout,
                max_events: options.max_events,
                blocked,
                href_probe: options.href_probe,
                state: RwLock::new(RecorderState::Idle),
                events: Mutex::new(VecDeque::new()),
                listener: RwLock::new(None),
                handle: Mutex::new(None),
                limiter: Mutex::new(MutationLimiter::new(
                    options.bucket_capacity,
                    options.bucket_refill_per_sec,
                )),
                last_interactive: Mutex::new(Instant::now()),
                last_meta: Mutex::new(Instant::now()),
                last_href: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> RecorderState {
        *self.inner.state.read()
    }

    pub fn subscribe(&self, listener: EventListener) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Snapshot of the retained event ring, oldest first.
    pub fn buffered_events(&self) -> Vec<DomEvent> {
        self.inner.events.lock().iter().cloned().collect()
    }

    /// Start the primitive and arm the idle watchdog.
    pub fn start_session(&self) -> anyhow::Result<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                RecorderState::Idle => *state = RecorderState::Recording,
                RecorderState::Recording => return Ok(()),
                other => anyhow::bail!("cannot start recorder from {other:?}"),
            }
        }
        *self.inner.last_interactive.lock() = Instant::now();
        *self.inner.last_meta.lock() = Instant::now();
        if let Some(ref probe) = self.inner.href_probe {
            *self.inner.last_href.lock() = probe();
        }

        let weak = Arc::downgrade(&self.inner);
        let emit: EmitFn = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_raw_event(event);
            }
        });
        let handle = match self.inner.primitive.record(RecordOptions {
            emit,
            capture_console: true,
            mousemove_sample_ms: 50,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                *self.inner.state.write() = RecorderState::Idle;
                return Err(e);
            }
        };
        *self.inner.handle.lock() = Some(handle);

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = Some(cancel.clone());
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.watchdog_tick();
            }
        });

        debug!("recorder started");
        Ok(())
    }

    /// Manual pause (façade `pause()` and memory overload).
    pub fn pause(&self) {
        let mut state = self.inner.state.write();
        if matches!(
            *state,
            RecorderState::Recording | RecorderState::Paused(PauseReason::Idle)
        ) {
            *state = RecorderState::Paused(PauseReason::Manual);
            debug!("recorder paused (manual)");
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.state.write();
            if *state != RecorderState::Paused(PauseReason::Manual) {
                return;
            }
            *state = RecorderState::Recording;
        }
        *self.inner.last_interactive.lock() = Instant::now();
        debug!("recorder resumed (manual)");
    }

    /// Stop everything: primitive, watchdog, ring, limiter.
    pub fn stop_session(&self) {
        {
            let mut state = self.inner.state.write();
            if *state == RecorderState::Stopped {
                return;
            }
            *state = RecorderState::Stopped;
        }
        if let Some(cancel) = self.inner.cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.inner.handle.lock().take() {
            handle.stop();
        }
        self.inner.events.lock().clear();
        self.inner.limiter.lock().reset();
        debug!("recorder stopped");
    }

    /// Inject a custom event (`$identify`, `$url_changed`) inline into the
    /// event chronology. Bypasses the pause filter; dropped once stopped.
    pub fn emit_custom(&self, tag: &str, payload: serde_json::Value) {
        self.inner.emit_custom(tag, payload);
    }
}

impl RecorderInner {
    fn handle_raw_event(self: &Arc<Self>, event: DomEvent) {
        // Mutation rate limiting comes first: a flooding node must not
        // reach any later stage.
        if event.kind == EVENT_INCREMENTAL && event.incremental_source() == Some(SOURCE_MUTATION) {
            let node = mutation_node_id(&event);
            match self.limiter.lock().admit(node, epoch_ms()) {
                Admit::Pass => {}
                Admit::JustThrottled => {
                    warn!(node, "mutation flood, throttling node");
                    if let Some(handle) = self.handle.lock().as_ref() {
                        handle.block_node(node);
                        handle.take_full_snapshot();
                    }
                    return;
                }
                Admit::Drop => return,
            }
        }

        // Meta events drive the URL blocklist in both directions.
        if let Some(href) = event.meta_href() {
            let href = href.to_owned();
            *self.last_href.lock() = Some(href.clone());
            *self.last_meta.lock() = Instant::now();
            self.apply_blocklist(&href);
        }

        let state = *self.state.read();
        match state {
            RecorderState::Recording => {}
            RecorderState::Paused(PauseReason::Idle) if event.is_interactive() => {
                *self.state.write() = RecorderState::Recording;
                debug!("recorder resumed (interaction)");
            }
            _ => return,
        }

        if event.is_interactive() {
            *self.last_interactive.lock() = Instant::now();
        }
        self.deliver(event);
    }

    fn apply_blocklist(&self, href: &str) {
        let blocked = self.blocked.iter().any(|re| re.is_match(href));
        let mut state = self.state.write();
        match (*state, blocked) {
            (RecorderState::Recording, true) => {
                *state = RecorderState::Paused(PauseReason::BlockedUrl);
                debug!(href, "recorder paused (blocked url)");
            }
            (RecorderState::Paused(PauseReason::BlockedUrl), false) => {
                *state = RecorderState::Recording;
                drop(state);
                *self.last_interactive.lock() = Instant::now();
                debug!(href, "recorder resumed (url unblocked)");
            }
            _ => {}
        }
    }

    fn watchdog_tick(self: &Arc<Self>) {
        if *self.state.read() == RecorderState::Recording
            && self.last_interactive.lock().elapsed() >= self.idle_timeout
        {
            *self.state.write() = RecorderState::Paused(PauseReason::Idle);
            debug!("recorder paused (idle)");
        }

        // Location changes that produced no meta event (pushState-style
        // navigation) are announced once per new href.
        if let Some(ref probe) = self.href_probe {
            if self.last_meta.lock().elapsed() >= WATCHDOG_TICK {
                if let Some(href) = probe() {
                    let changed = {
                        let mut last = self.last_href.lock();
                        if last.as_deref() != Some(href.as_str()) {
                            *last = Some(href.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if changed {
                        self.apply_blocklist(&href);
                        self.emit_custom("$url_changed", json!({ "href": href }));
                    }
                }
            }
        }
    }

    fn emit_custom(&self, tag: &str, payload: serde_json::Value) {
        if *self.state.read() == RecorderState::Stopped {
            return;
        }
        self.deliver(DomEvent::custom(tag, payload, epoch_ms()));
    }

    fn deliver(&self, event: DomEvent) {
        let listener = self.listener.read().clone();
        {
            let mut events = self.events.lock();
            events.push_back(event.clone());
            while events.len() > self.max_events {
                events.pop_front();
            }
        }
        if let Some(listener) = listener {
            listener(event);
        }
    }
}

#[cfg(test)]
#[path = "recorder_tests.rs"]
mod tests;
