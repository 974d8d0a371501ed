// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic heap sampling with a once-per-overage limit callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct HeapSample {
    pub used_bytes: u64,
    /// The host's own heap ceiling, when it reports one.
    pub limit_bytes: Option<u64>,
}

/// A heap usage source. Probes are consulted in order; the first one that
/// answers wins, so the modern measurement API goes ahead of the legacy
/// accessor.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    async fn measure(&self) -> Option<HeapSample>;
}

pub type LimitCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Whether a sample is over budget: past the host's own heap ceiling or
/// past the configured limit. Both comparisons are strict.
pub fn exceeds(sample: HeapSample, limit_bytes: u64) -> bool {
    sample.limit_bytes.map(|l| sample.used_bytes > l).unwrap_or(false)
        || sample.used_bytes > limit_bytes
}

pub struct MemoryWatch {
    limit_bytes: u64,
    probes: Vec<Arc<dyn MemoryProbe>>,
    on_limit: LimitCallback,
    cancel: Mutex<Option<CancellationToken>>,
    over_limit: Arc<AtomicBool>,
}

impl MemoryWatch {
    pub fn new(limit_bytes: u64, probes: Vec<Arc<dyn MemoryProbe>>, on_limit: LimitCallback) -> Self {
        Self {
            limit_bytes,
            probes,
            on_limit,
            cancel: Mutex::new(None),
            over_limit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin polling. Without any probe the watch logs once and stays inert.
    pub fn start(&self) {
        if self.probes.is_empty() {
            warn!("no heap probe available, memory watch disabled");
            return;
        }
        let mut slot = self.cancel.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        drop(slot);

        let probes = self.probes.clone();
        let limit = self.limit_bytes;
        let on_limit = self.on_limit.clone();
        let over_limit = self.over_limit.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(sample) = first_answer(&probes).await else {
                    continue;
                };
                if exceeds(sample, limit) {
                    // Fire once per overage; re-arm when usage drops back.
                    if !over_limit.swap(true, Ordering::SeqCst) {
                        debug!(used = sample.used_bytes, limit, "memory limit exceeded");
                        on_limit(sample.used_bytes);
                    }
                } else {
                    over_limit.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

async fn first_answer(probes: &[Arc<dyn MemoryProbe>]) -> Option<HeapSample> {
    for probe in probes {
        if let Some(sample) = probe.measure().await {
            return Some(sample);
        }
    }
    None
}

#[cfg(test)]
#[path = "memwatch_tests.rs"]
mod tests;
