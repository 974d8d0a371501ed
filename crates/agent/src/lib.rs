// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Perceptr session agent: a capture-to-upload pipeline for session
//! telemetry. DOM-recorder events, network request records, and console
//! records are buffered into an activity-scoped session, batched by size
//! and age, and uploaded to the ingestion control plane with exponential
//! backoff and crash-safe persistence.

pub mod agent;
pub mod api;
pub mod batch;
pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod memwatch;
pub mod network;
pub mod recorder;
pub mod sanitize;
pub mod session;
pub mod store;

pub use agent::{Orchestrator, Platform, Visibility};
pub use api::{ApiClient, Environment};
pub use batch::{Batch, BatchMetadata, UserIdentity};
pub use buffer::EventBuffer;
pub use config::AgentConfig;
pub use error::{AgentError, ErrorKind};
pub use events::{DomEvent, EventRecord, NetworkRecord};

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
