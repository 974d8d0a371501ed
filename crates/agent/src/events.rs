// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared event types for the capture pipeline.
//!
//! DOM-recorder events and network request records ride one ordered
//! stream; the numeric `type` tag keeps the two ranges disjoint so
//! downstream consumers can dispatch without inspecting payloads.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// -- Recorder event-type tags -------------------------------------------------

pub const EVENT_DOM_CONTENT_LOADED: u64 = 0;
pub const EVENT_LOAD: u64 = 1;
pub const EVENT_FULL_SNAPSHOT: u64 = 2;
pub const EVENT_INCREMENTAL: u64 = 3;
pub const EVENT_META: u64 = 4;
pub const EVENT_CUSTOM: u64 = 5;
pub const EVENT_PLUGIN: u64 = 6;
/// Network records share the stream with a tag outside the recorder's range.
pub const EVENT_NETWORK: u64 = 7;

// -- Incremental sources ------------------------------------------------------

pub const SOURCE_MUTATION: u64 = 0;
pub const SOURCE_MOUSE_MOVE: u64 = 1;
pub const SOURCE_MOUSE_INTERACTION: u64 = 2;
pub const SOURCE_SCROLL: u64 = 3;
pub const SOURCE_INPUT: u64 = 5;
pub const SOURCE_TOUCH_MOVE: u64 = 6;
pub const SOURCE_MEDIA_INTERACTION: u64 = 7;
pub const SOURCE_DRAG: u64 = 12;

/// Incremental sources produced by direct user interaction.
pub const ACTIVE_SOURCES: &[u64] = &[
    SOURCE_MOUSE_MOVE,
    SOURCE_SCROLL,
    SOURCE_INPUT,
    SOURCE_TOUCH_MOVE,
    SOURCE_MEDIA_INTERACTION,
    SOURCE_DRAG,
];

/// Console-capture plugin name as it appears in plugin events.
pub const CONSOLE_PLUGIN: &str = "rrweb/console@1";

// -- DOM events ---------------------------------------------------------------

/// An event produced by the external DOM-recording primitive.
///
/// The payload shape is owned by the primitive; this side only inspects
/// the handful of fields the pipeline dispatches on (`source`, `href`,
/// `plugin`) and treats the rest as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomEvent {
    #[serde(rename = "type")]
    pub kind: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl DomEvent {
    /// Build a custom event (`$identify`, `$url_changed`, ...).
    pub fn custom(tag: &str, payload: serde_json::Value, timestamp: u64) -> Self {
        Self {
            kind: EVENT_CUSTOM,
            timestamp,
            data: serde_json::json!({ "tag": tag, "payload": payload }),
        }
    }

    /// The `source` code of an incremental event.
    pub fn incremental_source(&self) -> Option<u64> {
        if self.kind != EVENT_INCREMENTAL {
            return None;
        }
        self.data.get("source").and_then(|v| v.as_u64())
    }

    /// Whether this event was produced by direct user interaction.
    pub fn is_interactive(&self) -> bool {
        self.incremental_source()
            .map(|s| ACTIVE_SOURCES.contains(&s))
            .unwrap_or(false)
    }

    /// The `href` of a meta (page-view) event.
    pub fn meta_href(&self) -> Option<&str> {
        if self.kind != EVENT_META {
            return None;
        }
        self.data.get("href").and_then(|v| v.as_str())
    }

    /// The plugin name of a plugin event.
    pub fn plugin_name(&self) -> Option<&str> {
        if self.kind != EVENT_PLUGIN {
            return None;
        }
        self.data.get("plugin").and_then(|v| v.as_str())
    }

    /// First console argument of a console-plugin record, when it is a string.
    pub fn first_console_arg(&self) -> Option<&str> {
        self.data
            .get("payload")?
            .get("payload")?
            .as_array()?
            .first()?
            .as_str()
    }
}

// -- Network records ----------------------------------------------------------

fn network_tag() -> u64 {
    EVENT_NETWORK
}

/// A captured outbound request, already sanitized by the tap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    #[serde(rename = "type", default = "network_tag")]
    pub kind: u64,
    pub id: String,
    pub timestamp: u64,
    pub duration: u64,
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// -- The stream union ---------------------------------------------------------

/// One entry of the session's ordered event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Dom(DomEvent),
    Network(NetworkRecord),
}

impl EventRecord {
    /// The numeric wire tag (network = [`EVENT_NETWORK`]).
    pub fn tag(&self) -> u64 {
        match self {
            Self::Dom(e) => e.kind,
            Self::Network(_) => EVENT_NETWORK,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Dom(e) => e.timestamp,
            Self::Network(r) => r.timestamp,
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Dom(e) if e.is_interactive())
    }

    /// Serialized JSON length, used for buffer byte accounting.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Dom(e) => e.serialize(serializer),
            Self::Network(r) => r.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EventRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let tag = value
            .get("type")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| D::Error::missing_field("type"))?;
        if tag == EVENT_NETWORK {
            NetworkRecord::deserialize(value)
                .map(Self::Network)
                .map_err(D::Error::custom)
        } else {
            DomEvent::deserialize(value)
                .map(Self::Dom)
                .map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
