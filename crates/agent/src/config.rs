// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::Environment;
use crate::sanitize::SanitizeOptions;
use crate::session::SessionOptions;

/// URL patterns that pause the recorder while the page matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPattern {
    pub url: String,
    pub matching: MatchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Regex,
}

/// Host-supplied agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub project_id: String,
    pub environment: Environment,
    /// Override the control-plane base URL (tests, self-hosted setups).
    pub api_base_url: Option<String>,
    /// Install a fmt subscriber at init. Host apps usually bring their own.
    pub debug: bool,
    /// Gzip batch uploads.
    pub compress: bool,

    pub inactivity_timeout_ms: Option<u64>,
    /// Legacy alias for `inactivity_timeout_ms`.
    pub stale_threshold_ms: Option<u64>,
    pub max_session_duration_ms: Option<u64>,

    /// Recorder pauses after this long without user interaction.
    pub idle_timeout_ms: u64,
    /// Recorder-side event ring capacity.
    pub max_events: usize,
    pub blocked_urls: Vec<BlockPattern>,

    /// Requests to URLs matching these regexes are never captured.
    pub exclude_urls: Vec<String>,
    pub sanitize: SanitizeOptions,
    /// Tap-side record ring capacity.
    pub max_requests: usize,

    pub memory_limit_bytes: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            environment: Environment::default(),
            api_base_url: None,
            debug: false,
            compress: false,
            inactivity_timeout_ms: None,
            stale_threshold_ms: None,
            max_session_duration_ms: None,
            idle_timeout_ms: 10_000,
            max_events: 10_000,
            blocked_urls: Vec::new(),
            exclude_urls: Vec::new(),
            sanitize: SanitizeOptions::default(),
            max_requests: 1_000,
            memory_limit_bytes: 50 * 1024 * 1024,
        }
    }
}

impl AgentConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self { project_id: project_id.into(), ..Default::default() }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            inactivity_timeout: self.inactivity_timeout_ms.map(Duration::from_millis),
            stale_threshold: self.stale_threshold_ms.map(Duration::from_millis),
            max_session_duration: self.max_session_duration_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
