// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Error kinds surfaced on the agent's error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid project id or fatal construction error.
    InitializationFailure,
    /// A sub-component could not start.
    RecordingFailure,
    /// Network or server error during batch send.
    UploadFailure,
    /// Heap usage exceeded the configured limit.
    MemoryLimitExceeded,
    /// Terminal flush failed; data persisted for the next load.
    ExportFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitializationFailure => "INITIALIZATION_FAILURE",
            Self::RecordingFailure => "RECORDING_FAILURE",
            Self::UploadFailure => "UPLOAD_FAILURE",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::ExportFailure => "EXPORT_FAILURE",
        }
    }

    /// Whether the instance cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InitializationFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error observed by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Fans agent errors out to subscribers. Sends are lossy — a slow or
/// absent subscriber never blocks the pipeline.
#[derive(Clone)]
pub struct ErrorChannel {
    tx: broadcast::Sender<AgentError>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentError> {
        self.tx.subscribe()
    }

    pub fn report(&self, kind: ErrorKind, message: impl Into<String>) {
        let error = AgentError { kind, message: message.into() };
        warn!(kind = %error.kind, msg = %error.message, "agent error");
        let _ = self.tx.send(error);
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
