// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The upload unit and its size-bounded splitting.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::EventRecord;

/// Hard per-upload cap. Batches at or above this are split before
/// submission so each piece stays under typical endpoint limits.
pub const MAX_UPLOAD_BYTES: usize = 7 * 1024 * 1024;

/// Identity attached to batches after `identify()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub distinct_id: String,
    #[serde(flatten)]
    pub traits: serde_json::Map<String, serde_json::Value>,
}

impl UserIdentity {
    pub fn new(distinct_id: impl Into<String>) -> Self {
        Self { distinct_id: distinct_id.into(), traits: Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub event_count: usize,
    pub compressed: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One upload: a prefix of the session's event stream.
///
/// For successive batches of a session, `start_time` equals the previous
/// batch's `end_time`, so the server can reconstruct an unbroken
/// chronology regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub session_id: String,
    pub batch_id: String,
    pub is_session_ended: bool,
    pub start_time: u64,
    pub end_time: u64,
    pub size: u64,
    pub data: Vec<EventRecord>,
    pub metadata: BatchMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_identity: Option<UserIdentity>,
}

impl Batch {
    /// Estimated upload size of the event slice, in bytes.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_string(&self.data).map(|s| s.len()).unwrap_or(0)
    }

    /// Split into pieces each under [`MAX_UPLOAD_BYTES`].
    pub fn split(self) -> Vec<Batch> {
        self.split_with_cap(MAX_UPLOAD_BYTES)
    }

    /// Split at the event-list midpoint until every piece is under `cap`
    /// or holds a single event. Pieces inherit the parent's session and
    /// time window; each gets its own batch id. Only the final piece of a
    /// terminal batch keeps `is_session_ended`.
    pub fn split_with_cap(self, cap: usize) -> Vec<Batch> {
        let ended = self.is_session_ended;
        let mut pieces = self.split_inner(cap);
        if ended && pieces.len() > 1 {
            for piece in pieces.iter_mut() {
                piece.is_session_ended = false;
            }
            if let Some(last) = pieces.last_mut() {
                last.is_session_ended = true;
            }
        }
        pieces
    }

    fn split_inner(self, cap: usize) -> Vec<Batch> {
        if self.data.len() < 2 || self.estimated_size() < cap {
            return vec![self];
        }

        let mut rest = self;
        let mid = rest.data.len() / 2;
        let tail_events = rest.data.split_off(mid);
        let head_events = std::mem::take(&mut rest.data);
        let head = rest.derive(head_events);
        let tail = rest.derive(tail_events);

        let mut pieces = head.split_inner(cap);
        pieces.extend(tail.split_inner(cap));
        pieces
    }

    /// A sibling batch over `data`, re-estimated, with a fresh id.
    fn derive(&self, data: Vec<EventRecord>) -> Batch {
        let mut piece = Batch {
            session_id: self.session_id.clone(),
            batch_id: Uuid::new_v4().to_string(),
            is_session_ended: self.is_session_ended,
            start_time: self.start_time,
            end_time: self.end_time,
            size: 0,
            data,
            metadata: self.metadata.clone(),
            user_identity: self.user_identity.clone(),
        };
        piece.size = piece.estimated_size() as u64;
        piece.metadata.event_count = piece.data.len();
        piece
    }
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;
