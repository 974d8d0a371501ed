// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Default shared agent instance.
//!
//! Host applications that want a single process-wide agent go through
//! this module; anything needing several instances (or test isolation)
//! constructs [`Orchestrator`] directly.

use once_cell::sync::OnceCell;
use tracing::warn;

use crate::agent::{Orchestrator, Platform, Visibility};
use crate::config::AgentConfig;

static INSTANCE: OnceCell<Orchestrator> = OnceCell::new();

/// Initialize the shared instance. Re-initialization is rejected with a
/// warning. Must be called within a tokio runtime.
pub fn init(config: AgentConfig, platform: Platform) {
    if config.debug {
        // Host apps usually own the subscriber; install one only on
        // request, and never clobber an existing registration.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .try_init();
    }

    if INSTANCE.get().is_some() {
        warn!("agent already initialized, ignoring re-init");
        return;
    }
    if INSTANCE.set(Orchestrator::new(config, platform)).is_err() {
        warn!("agent already initialized, ignoring re-init");
    }
}

pub fn instance() -> Option<&'static Orchestrator> {
    INSTANCE.get()
}

fn require_instance() -> anyhow::Result<&'static Orchestrator> {
    instance().ok_or_else(|| anyhow::anyhow!("agent not initialized"))
}

pub async fn start() -> anyhow::Result<()> {
    require_instance()?.start().await
}

pub async fn stop() -> anyhow::Result<()> {
    require_instance()?.stop().await
}

pub fn pause() {
    if let Some(orchestrator) = instance() {
        orchestrator.pause();
    }
}

pub fn resume() {
    if let Some(orchestrator) = instance() {
        orchestrator.resume();
    }
}

pub async fn identify(
    distinct_id: &str,
    traits: serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<()> {
    require_instance()?.identify(distinct_id, traits).await
}

pub fn handle_visibility(visibility: Visibility) {
    if let Some(orchestrator) = instance() {
        orchestrator.handle_visibility(visibility);
    }
}

pub fn handle_unload() {
    if let Some(orchestrator) = instance() {
        orchestrator.handle_unload();
    }
}

#[cfg(test)]
#[path = "facade_tests.rs"]
mod tests;
