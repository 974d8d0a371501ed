// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound request interception.
//!
//! The host's two request APIs are modeled as dispatcher slots: shared
//! cells the tap wraps on enable and restores on disable. The original
//! dispatchers are captured at construction, so disable always restores
//! the exact pre-construction state even if other code re-wraps the
//! slots in between.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use crate::api::INGEST_PATH_SEGMENT;
use crate::epoch_ms;
use crate::events::NetworkRecord;
use crate::sanitize::{sanitize_body, sanitize_headers, sanitize_url, SanitizeOptions};

// -- Dispatch model -----------------------------------------------------------

/// An outbound request before dispatch.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Response headers as produced by the two request APIs.
#[derive(Debug, Clone)]
pub enum ResponseHeaders {
    /// Structured map (high-level API).
    Map(BTreeMap<String, String>),
    /// Raw CRLF-separated header block (low-level API).
    Raw(String),
}

impl ResponseHeaders {
    pub fn into_map(self) -> BTreeMap<String, String> {
        match self {
            Self::Map(map) => map,
            Self::Raw(block) => parse_raw_headers(&block),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: ResponseHeaders,
    pub body: Option<String>,
}

/// One of the host's outbound request APIs.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}

/// Swappable cell holding the live dispatcher for one request API.
#[derive(Clone)]
pub struct DispatcherSlot {
    inner: Arc<RwLock<Arc<dyn Dispatcher>>>,
}

impl DispatcherSlot {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { inner: Arc::new(RwLock::new(dispatcher)) }
    }

    pub fn current(&self) -> Arc<dyn Dispatcher> {
        self.inner.read().clone()
    }

    pub fn install(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.inner.write() = dispatcher;
    }

    /// Dispatch through whatever is currently installed.
    pub async fn dispatch(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let dispatcher = self.current();
        dispatcher.dispatch(request).await
    }
}

/// Parse a raw response-header block into a map.
pub fn parse_raw_headers(block: &str) -> BTreeMap<String, String> {
    block
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

// -- The tap ------------------------------------------------------------------

pub type RecordSubscriber = Arc<dyn Fn(NetworkRecord) + Send + Sync>;

pub struct NetworkTapOptions {
    pub exclude_urls: Vec<String>,
    pub sanitize: SanitizeOptions,
    pub max_requests: usize,
}

/// Intercepts both request APIs, sanitizes completed requests into
/// [`NetworkRecord`]s, and hands them to the subscriber. A bounded FIFO
/// of recent records is kept as a safety net.
pub struct NetworkTap {
    inner: Arc<TapInner>,
}

struct TapInner {
    fetch_slot: DispatcherSlot,
    xhr_slot: DispatcherSlot,
    original_fetch: Arc<dyn Dispatcher>,
    original_xhr: Arc<dyn Dispatcher>,
    exclude: Vec<Regex>,
    sanitize: SanitizeOptions,
    max_requests: usize,
    enabled: AtomicBool,
    records: Mutex<VecDeque<NetworkRecord>>,
    subscriber: RwLock<Option<RecordSubscriber>>,
}

impl NetworkTap {
    /// Captures the slots' current dispatchers as the restoration targets.
    pub fn new(
        fetch_slot: DispatcherSlot,
        xhr_slot: DispatcherSlot,
        options: NetworkTapOptions,
    ) -> anyhow::Result<Self> {
        let exclude = options
            .exclude_urls
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let original_fetch = fetch_slot.current();
        let original_xhr = xhr_slot.current();
        Ok(Self {
            inner: Arc::new(TapInner {
                fetch_slot,
                xhr_slot,
                original_fetch,
                original_xhr,
                exclude,
                sanitize: options.sanitize,
                max_requests: options.max_requests,
                enabled: AtomicBool::new(false),
                records: Mutex::new(VecDeque::new()),
                subscriber: RwLock::new(None),
            }),
        })
    }

    /// Wrap both slots. No-op when already enabled.
    pub fn enable(&self) {
        if self.inner.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in [&self.inner.fetch_slot, &self.inner.xhr_slot] {
            let shim = TapDispatcher {
                tap: Arc::downgrade(&self.inner),
                through: slot.current(),
            };
            slot.install(Arc::new(shim));
        }
        debug!("network tap enabled");
    }

    /// Restore the construction-time dispatchers. No-op when not enabled.
    pub fn disable(&self) {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.fetch_slot.install(self.inner.original_fetch.clone());
        self.inner.xhr_slot.install(self.inner.original_xhr.clone());
        debug!("network tap disabled");
    }

    pub fn subscribe(&self, subscriber: RecordSubscriber) {
        *self.inner.subscriber.write() = Some(subscriber);
    }

    /// Snapshot of the retained record ring, oldest first.
    pub fn recent_records(&self) -> Vec<NetworkRecord> {
        self.inner.records.lock().iter().cloned().collect()
    }
}

impl TapInner {
    fn is_excluded(&self, url: &str) -> bool {
        url.contains(INGEST_PATH_SEGMENT) || self.exclude.iter().any(|re| re.is_match(url))
    }

    fn build_record(
        &self,
        id: String,
        timestamp: u64,
        duration: u64,
        request: &HttpRequest,
        response: Option<&HttpResponse>,
        error: Option<String>,
    ) -> NetworkRecord {
        NetworkRecord {
            kind: crate::events::EVENT_NETWORK,
            id,
            timestamp,
            duration,
            method: request.method.clone(),
            url: sanitize_url(&request.url, &self.sanitize.sanitize_params),
            status: response.map(|r| r.status),
            status_text: response.map(|r| r.status_text.clone()),
            request_headers: sanitize_headers(&request.headers, &self.sanitize.sanitize_headers),
            response_headers: response
                .map(|r| {
                    sanitize_headers(
                        &r.headers.clone().into_map(),
                        &self.sanitize.sanitize_headers,
                    )
                })
                .unwrap_or_default(),
            request_body: request.body.as_deref().map(|b| sanitize_body(b, &self.sanitize)),
            response_body: response
                .and_then(|r| r.body.as_deref())
                .map(|b| sanitize_body(b, &self.sanitize)),
            error,
        }
    }

    fn push_record(&self, record: NetworkRecord) {
        let subscriber = self.subscriber.read().clone();
        {
            let mut records = self.records.lock();
            records.push_back(record.clone());
            while records.len() > self.max_requests {
                records.pop_front();
            }
        }
        if let Some(subscriber) = subscriber {
            subscriber(record);
        }
    }
}

/// The shim installed into a slot while the tap is enabled.
struct TapDispatcher {
    tap: Weak<TapInner>,
    /// The dispatcher that was live when the tap was enabled.
    through: Arc<dyn Dispatcher>,
}

#[async_trait]
impl Dispatcher for TapDispatcher {
    async fn dispatch(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let Some(tap) = self.tap.upgrade() else {
            return self.through.dispatch(request).await;
        };
        if tap.is_excluded(&request.url) {
            return self.through.dispatch(request).await;
        }

        let id = Uuid::new_v4().to_string();
        let started = epoch_ms();
        let outcome = self.through.dispatch(request.clone()).await;
        let duration = epoch_ms().saturating_sub(started);

        let record = match &outcome {
            Ok(response) => tap.build_record(id, started, duration, &request, Some(response), None),
            Err(e) => {
                tap.build_record(id, started, duration, &request, None, Some(format!("{e:#}")))
            }
        };
        tap.push_record(record);
        outcome
    }
}

#[cfg(test)]
#[path = "network_tests.rs"]
mod tests;
