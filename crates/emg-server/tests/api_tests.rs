use axum::body::Body;
use axum::http::{Request, StatusCode};
use emg_core::{SessionId, SessionState, SignalMatrix};
use emg_server::{router, AppState, OrphanPolicy, ServerConfig};
use emg_source::{SignalSource, SourceSettings, SyntheticSource};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

fn test_state(dir: &TempDir, policy: OrphanPolicy) -> (AppState, Arc<SyntheticSource>) {
    let config = ServerConfig {
        data_dir: dir.path().join("sessions"),
        orphan_grace_secs: 0,
        orphan_policy: policy,
        source: SourceSettings {
            channel_count: 2,
            sample_rate: 200.0,
            seed: Some(1),
            ..SourceSettings::default()
        },
        ..ServerConfig::default()
    };

    let source = Arc::new(SyntheticSource::new(config.source.clone()).unwrap());
    let state = AppState::new(config, source.clone()).unwrap();
    (state, source)
}

/// Pending session holding `ticks` chunks of 20 rows × 2 channels
fn captured_session(state: &AppState, ticks: usize) -> SessionId {
    let id = state.table.open(2, 200.0, |_| false);
    state.table.mark_streaming(&id).unwrap();
    for tick in 0..ticks {
        let rows: Vec<Vec<f64>> = (0..20)
            .map(|r| vec![(tick * 20 + r) as f64, -((tick * 20 + r) as f64)])
            .collect();
        let raw = SignalMatrix::from_rows(rows).unwrap();
        let env = SignalMatrix::zeros(20, 2);
        state.table.append(&id, &raw, &env).unwrap();
    }
    id
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(state.clone())
        .oneshot(request)
        .await
        .expect("Failed to send request");

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(json!({}));
    (status, json)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn shape(value: &Value) -> (usize, usize) {
    let rows = value.as_array().unwrap();
    let channels = rows.first().map(|r| r.as_array().unwrap().len()).unwrap_or(0);
    (rows.len(), channels)
}

#[tokio::test]
async fn test_health() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    captured_session(&state, 1);

    let (status, body) = send(&state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pending_sessions"], 1);
    assert_eq!(body["sample_rate"], 200.0);
    assert_eq!(body["channels"], 2);
}

#[tokio::test]
async fn test_save_then_load_with_decimation() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 5);

    let (status, body) = send(&state, post("/api/save", json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
    assert!(state.table.is_empty());

    let (status, body) = send(&state, get(&format!("/api/sessions/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], id.as_str());
    assert_eq!(shape(&body["raw"]), (100, 2));
    assert_eq!(shape(&body["env"]), (100, 2));
    assert_eq!(body["raw"][37], json!([37.0, -37.0]));

    let (_, body) = send(&state, get(&format!("/api/sessions/{}?decimation=2", id))).await;
    assert_eq!(shape(&body["raw"]), (50, 2));
    assert_eq!(shape(&body["env"]), (50, 2));
    assert_eq!(body["raw"][1], json!([2.0, -2.0]));

    let (_, body) = send(&state, get(&format!("/api/sessions/{}?decimation=3", id))).await;
    assert_eq!(shape(&body["raw"]), (34, 2));

    let (_, body) = send(&state, get(&format!("/api/sessions/{}?decimation=0", id))).await;
    assert_eq!(shape(&body["raw"]), (100, 2));
}

#[tokio::test]
async fn test_save_unknown_and_twice() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);

    let (status, body) = send(&state, post("/api/save", json!({"session_id": "20240101_000000_000000_abcd"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let id = captured_session(&state, 1);
    let (status, _) = send(&state, post("/api/save", json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&state, post("/api/save", json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_session_id() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);

    let (status, body) = send(&state, post("/api/save", json!({"session_id": "../etc/passwd"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let (status, _) = send(&state, get("/api/sessions/bad.id")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&state, post("/api/discard", json!({"session_id": "../x"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_discard_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 3);

    for _ in 0..2 {
        let (status, body) = send(&state, post("/api/discard", json!({"session_id": id}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true}));
    }

    let (_, body) = send(&state, get("/api/sessions")).await;
    assert_eq!(body, json!({"sessions": []}));

    let (status, _) = send(&state, get(&format!("/api/sessions/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&state, post("/api/save", json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(std::fs::read_dir(state.store.root()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_metadata_pending_saved_and_unknown() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 1);

    let (status, _) = send(
        &state,
        post("/api/metadata", json!({"session_id": id, "label": "dry swallow"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // nothing on disk until the save
    assert!(state.store.load_metadata(&id).is_none());
    send(&state, post("/api/save", json!({"session_id": id}))).await;

    let (_, body) = send(&state, get("/api/sessions")).await;
    assert_eq!(body["sessions"][0]["id"], id.as_str());
    assert_eq!(body["sessions"][0]["label"], "dry swallow");
    assert_eq!(body["sessions"][0]["notes"], "");

    let (status, _) = send(
        &state,
        post("/api/metadata", json!({"session_id": id, "notes": "5 ml water"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&state, get("/api/sessions")).await;
    assert_eq!(body["sessions"][0]["label"], "dry swallow");
    assert_eq!(body["sessions"][0]["notes"], "5 ml water");

    let (status, body) = send(
        &state,
        post("/api/metadata", json!({"session_id": "nobody", "label": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_list_newest_first() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = captured_session(&state, 1);
        state.save_session(&id).await.unwrap();
        ids.push(id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (_, body) = send(&state, get("/api/sessions")).await;
    let listed: Vec<&str> = body["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    ids.reverse();
    assert_eq!(listed, ids.iter().map(SessionId::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_resave_overwrites() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 2);

    let m = SignalMatrix::zeros(7, 2);
    state.store.save(&id, &m, &m).unwrap();
    state.save_session(&id).await.unwrap();

    let (_, body) = send(&state, get(&format!("/api/sessions/{}", id))).await;
    assert_eq!(shape(&body["raw"]), (40, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_save_and_discard() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);

    for _ in 0..20 {
        let id = captured_session(&state, 2);

        let saver = {
            let state = state.clone();
            let id = id.clone();
            tokio::spawn(async move { state.save_session(&id).await })
        };
        let discarder = {
            let state = state.clone();
            let id = id.clone();
            tokio::spawn(async move { state.discard_session(&id) })
        };

        let saved = saver.await.unwrap().is_ok();
        let discarded = discarder.await.unwrap();

        assert!(saved ^ discarded, "exactly one of save/discard must win");
        assert_eq!(state.store.exists(&id), saved);
        assert!(!state.table.contains(&id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_racing_save_is_kept() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);

    for round in 0..20 {
        let id = captured_session(&state, 2);
        let label = format!("trial {}", round);

        let saver = {
            let state = state.clone();
            let id = id.clone();
            tokio::spawn(async move { send(&state, post("/api/save", json!({"session_id": id}))).await })
        };
        let labeller = {
            let state = state.clone();
            let body = json!({"session_id": id, "label": label});
            tokio::spawn(async move { send(&state, post("/api/metadata", body)).await })
        };

        assert_eq!(saver.await.unwrap().0, StatusCode::OK);
        assert_eq!(labeller.await.unwrap().0, StatusCode::OK);
        assert_eq!(state.store.load_metadata(&id).unwrap().label, label);
    }
}

#[tokio::test]
async fn test_metadata_during_failed_save_is_kept() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 1);

    let taken = state.table.begin_finalize(&id).unwrap();
    let (status, _) = send(&state, post("/api/metadata", json!({"session_id": id, "label": "late"}))).await;
    assert_eq!(status, StatusCode::OK);
    state.table.abort_finalize(&id, taken);

    send(&state, post("/api/save", json!({"session_id": id}))).await;
    assert_eq!(state.store.load_metadata(&id).unwrap().label, "late");
}

#[tokio::test]
async fn test_partial_write_is_not_listed() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 2);

    std::fs::create_dir(state.store.root().join(format!("{}_env.npy", id))).unwrap();
    let (status, _) = send(&state, post("/api/save", json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // pending in memory, absent on disk
    assert!(state.table.is_pending(&id));
    let (_, body) = send(&state, get("/api/sessions")).await;
    assert_eq!(body, json!({"sessions": []}));
    let (status, _) = send(&state, get(&format!("/api/sessions/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_storage_failure_keeps_session_pending() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 2);

    // replace the data directory with a plain file
    std::fs::remove_dir_all(state.store.root()).unwrap();
    std::fs::write(state.store.root(), b"not a directory").unwrap();

    let (status, body) = send(&state, post("/api/save", json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["ok"], false);

    assert!(state.table.is_pending(&id));
    let pending = state.table.pending();
    assert_eq!(pending[0].rows, 40);
}

#[tokio::test]
async fn test_pending_listing() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let id = captured_session(&state, 2);
    state.table.mark_abandoned(&id);

    let (status, body) = send(&state, get("/api/pending")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"][0]["id"], id.as_str());
    assert_eq!(body["sessions"][0]["state"], "abandoned");
    assert_eq!(body["sessions"][0]["rows"], 40);
    assert_eq!(body["sessions"][0]["channels"], 2);
}

#[tokio::test]
async fn test_orphan_sweep_save_policy() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Save);
    let orphan = captured_session(&state, 2);
    let live = captured_session(&state, 1);
    state.table.mark_abandoned(&orphan);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(state.sweep_orphans().await, 1);

    assert!(state.store.exists(&orphan));
    assert!(!state.table.contains(&orphan));
    assert!(state.table.is_pending(&live));
}

#[tokio::test]
async fn test_orphan_sweep_discard_policy() {
    let dir = TempDir::new().unwrap();
    let (state, _source) = test_state(&dir, OrphanPolicy::Discard);
    let orphan = captured_session(&state, 2);
    state.table.mark_abandoned(&orphan);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(state.sweep_orphans().await, 1);
    assert!(state.table.is_empty());
    assert!(!state.store.exists(&orphan));
}

#[tokio::test]
async fn test_shutdown_releases_source() {
    let dir = TempDir::new().unwrap();
    let (state, source) = test_state(&dir, OrphanPolicy::Discard);
    source.pump(50).unwrap();
    captured_session(&state, 1);

    state.shutdown();
    assert!(state.cancel.is_cancelled());
    assert!(source.read_latest(10).is_err());
    assert_eq!(state.table.len(), 1);
    assert_eq!(state.table.pending()[0].state, SessionState::Streaming);
}
