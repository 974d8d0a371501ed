// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end pipeline scenarios against the in-process ingest fixture.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use perceptr_agent::agent::Orchestrator;
use perceptr_agent::buffer::EventBuffer;
use perceptr_agent::config::BlockPattern;
use perceptr_agent::config::MatchKind;
use perceptr_agent::error::{ErrorChannel, ErrorKind};
use perceptr_agent::events::EventRecord;
use perceptr_agent::memwatch::{HeapSample, MemoryProbe};
use perceptr_agent::network::HttpRequest;
use perceptr_agent::session::{SessionManager, SessionOptions, SessionState};
use perceptr_agent::store::{MemoryStore, StateStore};
use perceptr_agent::{epoch_ms, ApiClient, Environment};

use perceptr_specs::{
    agent_config, bulky_event, dom_event, meta_event, mutation_event, test_platform, IngestServer,
};

/// Time for the deferred network-tap enable to run.
const TAP_ENABLE_GRACE: Duration = Duration::from_millis(100);

fn direct_buffer(
    server: &IngestServer,
    store: Arc<MemoryStore>,
    compress: bool,
) -> EventBuffer {
    let api = Arc::new(
        ApiClient::new("p-spec", Environment::Local).with_base_url(server.base_url.clone()),
    );
    let sessions = Arc::new(SessionManager::new(
        SessionOptions::default(),
        store.clone(),
        None,
    ));
    EventBuffer::new(api, store, sessions, ErrorChannel::new(), compress)
}

fn session(id: &str, start: u64) -> SessionState {
    SessionState {
        session_id: id.to_owned(),
        start_time: start,
        last_activity_time: epoch_ms(),
        user_identity: None,
    }
}

// -- Happy path ---------------------------------------------------------------

#[tokio::test]
async fn capture_to_terminal_upload() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let tp = test_platform();
    let fetch_slot = tp.fetch_slot.clone();
    let primitive = tp.primitive.clone();
    let store = tp.store.clone();

    let orchestrator = Orchestrator::new(agent_config(&server), tp.platform);
    orchestrator.start().await?;
    tokio::time::sleep(TAP_ENABLE_GRACE).await;

    primitive.emit(dom_event(100));
    primitive.emit(dom_event(200));
    fetch_slot
        .dispatch(HttpRequest {
            method: "GET".to_owned(),
            url: "https://api.example.com/items".to_owned(),
            headers: BTreeMap::new(),
            body: None,
        })
        .await?;
    primitive.emit(dom_event(300));

    orchestrator.stop().await?;

    let batches = server.uploaded_batches();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];

    let session_id = batch["sessionId"].as_str().unwrap_or_default().to_owned();
    assert!(!session_id.is_empty());
    assert_eq!(batch["isSessionEnded"], json!(true));

    // The first batch opens at the session's own start time.
    let persisted = store.get("perceptr_session_state").unwrap_or_default();
    let state: serde_json::Value = serde_json::from_str(&persisted)?;
    assert_eq!(batch["startTime"], state["startTime"]);
    assert!(batch["endTime"].as_u64() >= batch["startTime"].as_u64());

    // Events arrive in enqueue order with the network record in between.
    let data = batch["data"].as_array().unwrap();
    assert_eq!(data.len(), 4);
    assert_eq!(data[0]["timestamp"], json!(100));
    assert_eq!(data[1]["timestamp"], json!(200));
    assert_eq!(data[2]["type"], json!(7));
    assert_eq!(data[3]["timestamp"], json!(300));

    // A terminal batch triggers processing.
    assert_eq!(server.processed_sessions(), vec![session_id]);
    Ok(())
}

#[tokio::test]
async fn invalid_project_keeps_the_agent_dark() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    server.set_valid_project(false);
    let tp = test_platform();

    let orchestrator = Orchestrator::new(agent_config(&server), tp.platform);
    let err = orchestrator.start().await.unwrap_err();
    assert!(err.to_string().contains("initialization failed"), "{err}");
    assert_eq!(server.upload_attempts(), 0);
    Ok(())
}

// -- Chronology ---------------------------------------------------------------

#[tokio::test]
async fn successive_flushes_share_a_boundary() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let buffer = direct_buffer(&server, Arc::new(MemoryStore::new()), false);
    buffer.set_session_state(session("s-contig", 1_000));

    buffer.add_event(EventRecord::Dom(dom_event(1)));
    buffer.flush(false).await?;

    buffer.add_event(EventRecord::Dom(dom_event(2)));
    buffer.flush(true).await?;

    let batches = server.batches_for("s-contig");
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0]["startTime"], json!(1_000));
    assert_eq!(batches[1]["startTime"], batches[0]["endTime"]);
    assert_eq!(batches[0]["isSessionEnded"], json!(false));
    assert_eq!(batches[1]["isSessionEnded"], json!(true));
    Ok(())
}

#[tokio::test]
async fn partial_split_failure_keeps_the_chronology() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let buffer = direct_buffer(&server, Arc::new(MemoryStore::new()), false);
    buffer.set_session_state(session("s-split", 1_000));

    // Four ~2.5 MiB events force a split into two pieces under the
    // upload cap; only the first piece gets through.
    for i in 0..4 {
        buffer.add_event(EventRecord::Dom(bulky_event(i, 2_500_000)));
    }
    server.fail_uploads_after(1);
    assert!(buffer.flush(false).await.is_err());

    let batches = server.batches_for("s-split");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["startTime"], json!(1_000));
    let timestamps: Vec<u64> = batches[0]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["timestamp"].as_u64().unwrap_or_default())
        .collect();
    assert_eq!(timestamps, vec![0, 1]);
    let delivered_end = batches[0]["endTime"].clone();

    // The retry opens where the delivered piece closed, carrying the
    // unsent half.
    server.fail_uploads_after(usize::MAX);
    buffer.flush(true).await?;

    let batches = server.batches_for("s-split");
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1]["startTime"], delivered_end);
    let timestamps: Vec<u64> = batches[1]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["timestamp"].as_u64().unwrap_or_default())
        .collect();
    assert_eq!(timestamps, vec![2, 3]);
    Ok(())
}

// -- Backoff ------------------------------------------------------------------

#[tokio::test]
async fn failed_upload_backs_off_before_retrying() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let buffer = direct_buffer(&server, Arc::new(MemoryStore::new()), false);
    buffer.set_session_state(session("s-backoff", 1_000));
    server.set_fail_uploads(true);

    buffer.add_event(EventRecord::Dom(dom_event(1)));
    assert!(buffer.flush(false).await.is_err());
    assert_eq!(server.upload_attempts(), 1);

    // Inside the 5 s backoff window, flushes are skipped without touching
    // the network.
    buffer.flush(false).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    buffer.flush(false).await?;
    assert_eq!(server.upload_attempts(), 1);

    // Past the deadline the next flush goes out again.
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert!(buffer.flush(false).await.is_err());
    assert_eq!(server.upload_attempts(), 2);

    // Recovery clears the failure state and delivers everything buffered.
    server.set_fail_uploads(false);
    buffer.flush(true).await?;
    let batches = server.batches_for("s-backoff");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["data"].as_array().unwrap().len(), 1);
    Ok(())
}

// -- Persistence & replay -----------------------------------------------------

#[tokio::test]
async fn persisted_buffer_replays_after_reload() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let store = Arc::new(MemoryStore::new());
    let sess = session("s-reload", 5_000);

    // First load buffers five events and goes hidden.
    let first = direct_buffer(&server, store.clone(), false);
    first.set_session_state(sess.clone());
    for i in 0..5 {
        first.add_event(EventRecord::Dom(dom_event(i)));
    }
    first.persist_now();
    drop(first);

    // Reload: a fresh buffer over the same store, same continuing session.
    let second = direct_buffer(&server, store.clone(), false);
    second.set_session_state(sess);
    second.flush_persisted_buffers().await;

    let batches = server.batches_for("s-reload");
    assert_eq!(batches.len(), 1);
    let replayed = &batches[0];
    // The new instance has no prior flush, so the stored start time holds,
    // and a same-session carryover is not terminal.
    assert_eq!(replayed["startTime"], json!(5_000));
    assert_eq!(replayed["isSessionEnded"], json!(false));
    let timestamps: Vec<u64> = replayed["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["timestamp"].as_u64().unwrap_or_default())
        .collect();
    assert_eq!(timestamps, vec![0, 1, 2, 3, 4]);

    // The replayed entry is gone from the store...
    let remaining: Vec<serde_json::Value> =
        serde_json::from_str(&store.get("perceptr_buffer_data").unwrap_or_else(|| "[]".into()))?;
    assert!(remaining.is_empty());

    // ...and live batches continue the chronology where the replay ended.
    second.add_event(EventRecord::Dom(dom_event(9)));
    second.flush(true).await?;
    let batches = server.batches_for("s-reload");
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1]["startTime"], batches[0]["endTime"]);
    Ok(())
}

#[tokio::test]
async fn cross_session_carryover_is_terminal() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let store = Arc::new(MemoryStore::new());

    let first = direct_buffer(&server, store.clone(), false);
    first.set_session_state(session("s-old", 100));
    first.add_event(EventRecord::Dom(dom_event(1)));
    first.persist_now();
    drop(first);

    let second = direct_buffer(&server, store.clone(), false);
    second.set_session_state(session("s-new", 900));
    second.flush_persisted_buffers().await;

    let batches = server.batches_for("s-old");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["isSessionEnded"], json!(true));
    assert_eq!(batches[0]["startTime"], json!(100));
    assert!(server.processed_sessions().contains(&"s-old".to_owned()));
    Ok(())
}

#[tokio::test]
async fn failed_replay_stays_parked() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let store = Arc::new(MemoryStore::new());

    let first = direct_buffer(&server, store.clone(), false);
    first.set_session_state(session("s-parked", 100));
    first.add_event(EventRecord::Dom(dom_event(1)));
    first.persist_now();
    drop(first);

    server.set_fail_uploads(true);
    let second = direct_buffer(&server, store.clone(), false);
    second.set_session_state(session("s-other", 900));
    second.flush_persisted_buffers().await;

    let remaining: Vec<serde_json::Value> =
        serde_json::from_str(&store.get("perceptr_buffer_data").unwrap_or_default())?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["sessionId"], json!("s-parked"));
    Ok(())
}

// -- Terminal server state ----------------------------------------------------

#[tokio::test]
async fn server_terminal_session_skips_the_upload() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    server.mark_terminal("s-done");
    let buffer = direct_buffer(&server, Arc::new(MemoryStore::new()), false);
    buffer.set_session_state(session("s-done", 100));

    buffer.add_event(EventRecord::Dom(dom_event(1)));
    buffer.flush(false).await?;

    assert!(server.batch_url_hits() >= 1);
    assert_eq!(server.upload_attempts(), 0);
    assert!(server.uploaded_batches().is_empty());
    Ok(())
}

// -- Compression --------------------------------------------------------------

#[tokio::test]
async fn compressed_uploads_decode_to_the_same_batch() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let buffer = direct_buffer(&server, Arc::new(MemoryStore::new()), true);
    buffer.set_session_state(session("s-gz", 100));

    buffer.add_event(EventRecord::Dom(dom_event(42)));
    buffer.flush(true).await?;

    let batches = server.batches_for("s-gz");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["metadata"]["compressed"], json!(true));
    assert_eq!(batches[0]["data"][0]["timestamp"], json!(42));
    Ok(())
}

// -- Sanitization -------------------------------------------------------------

#[tokio::test]
async fn captured_requests_arrive_sanitized() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let tp = test_platform();
    let fetch_slot = tp.fetch_slot.clone();

    let orchestrator = Orchestrator::new(agent_config(&server), tp.platform);
    orchestrator.start().await?;
    tokio::time::sleep(TAP_ENABLE_GRACE).await;

    let mut headers = BTreeMap::new();
    headers.insert("Authorization".to_owned(), "Bearer s".to_owned());
    fetch_slot
        .dispatch(HttpRequest {
            method: "POST".to_owned(),
            url: "https://x/y?token=abc".to_owned(),
            headers,
            body: Some(json!({ "password": "p", "name": "n" }).to_string()),
        })
        .await?;

    orchestrator.stop().await?;

    let batches = server.uploaded_batches();
    let data = batches[0]["data"].as_array().unwrap();
    let record = data.iter().find(|e| e["type"] == json!(7)).unwrap();
    assert!(record["url"].as_str().unwrap().contains("token=[REDACTED]"));
    assert_eq!(record["requestHeaders"]["Authorization"], json!("[REDACTED]"));
    let body: serde_json::Value =
        serde_json::from_str(record["requestBody"].as_str().unwrap())?;
    assert_eq!(body["password"], json!("[REDACTED]"));
    assert_eq!(body["name"], json!("n"));
    Ok(())
}

// -- URL blocklist ------------------------------------------------------------

#[tokio::test]
async fn blocked_urls_gate_the_recorder() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let tp = test_platform();
    let primitive = tp.primitive.clone();

    let mut config = agent_config(&server);
    config.blocked_urls =
        vec![BlockPattern { url: "^.*/admin".to_owned(), matching: MatchKind::Regex }];
    let orchestrator = Orchestrator::new(config, tp.platform);
    orchestrator.start().await?;

    primitive.emit(meta_event("https://x/admin/x", 10));
    primitive.emit(mutation_event(11));
    primitive.emit(mutation_event(12));
    primitive.emit(meta_event("https://x/home", 20));
    primitive.emit(mutation_event(21));

    orchestrator.stop().await?;

    let batches = server.uploaded_batches();
    assert_eq!(batches.len(), 1);
    let timestamps: Vec<u64> = batches[0]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["timestamp"].as_u64().unwrap_or_default())
        .collect();
    // Nothing from the blocked page; the unblocking meta event and what
    // follows are kept.
    assert_eq!(timestamps, vec![20, 21]);
    Ok(())
}

// -- Identify -----------------------------------------------------------------

#[tokio::test]
async fn identify_tags_batches_and_the_chronology() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let tp = test_platform();
    let primitive = tp.primitive.clone();

    let orchestrator = Orchestrator::new(agent_config(&server), tp.platform);
    orchestrator.start().await?;

    primitive.emit(dom_event(1));
    let mut traits = serde_json::Map::new();
    traits.insert("plan".to_owned(), json!("pro"));
    orchestrator.identify("user-1", traits).await?;

    orchestrator.stop().await?;

    let batches = server.uploaded_batches();
    let batch = &batches[0];
    assert_eq!(batch["userIdentity"]["distinctId"], json!("user-1"));
    assert_eq!(batch["userIdentity"]["plan"], json!("pro"));

    let data = batch["data"].as_array().unwrap();
    let marker = data
        .iter()
        .find(|e| e["data"]["tag"] == json!("$identify"))
        .unwrap();
    assert_eq!(marker["data"]["payload"]["distinctId"], json!("user-1"));
    Ok(())
}

// -- Visibility ---------------------------------------------------------------

#[tokio::test]
async fn hidden_persists_and_visible_replays() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let tp = test_platform();
    let primitive = tp.primitive.clone();
    let store = tp.store.clone();

    let orchestrator = Orchestrator::new(agent_config(&server), tp.platform);
    orchestrator.start().await?;

    primitive.emit(dom_event(1));
    orchestrator.handle_visibility(perceptr_agent::Visibility::Hidden);

    // The hidden-side persistence is synchronous.
    let parked: Vec<serde_json::Value> =
        serde_json::from_str(&store.get("perceptr_buffer_data").unwrap_or_default())?;
    assert_eq!(parked.len(), 1);

    orchestrator.handle_visibility(perceptr_agent::Visibility::Visible);
    // Past the 400 ms debounce the parked buffer is replayed.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.uploaded_batches().len(), 1);
    Ok(())
}

// -- Memory limit -------------------------------------------------------------

struct OverLimitProbe;

#[async_trait]
impl MemoryProbe for OverLimitProbe {
    async fn measure(&self) -> Option<HeapSample> {
        Some(HeapSample { used_bytes: u64::MAX, limit_bytes: None })
    }
}

#[tokio::test]
async fn memory_overage_pauses_the_pipeline() -> anyhow::Result<()> {
    let server = IngestServer::start().await?;
    let mut tp = test_platform();
    tp.platform.memory_probes = vec![Arc::new(OverLimitProbe)];
    let fetch_slot = tp.fetch_slot.clone();
    let original = fetch_slot.current();

    let orchestrator = Orchestrator::new(agent_config(&server), tp.platform);
    let mut errors = orchestrator.errors();
    orchestrator.start().await?;
    tokio::time::sleep(TAP_ENABLE_GRACE).await;

    // The first 5 s poll observes the overage and pauses everything,
    // which restores the original dispatcher.
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    let reported = errors.recv().await?;
    assert_eq!(reported.kind, ErrorKind::MemoryLimitExceeded);
    assert!(Arc::ptr_eq(&fetch_slot.current(), &original));
    Ok(())
}
