//! Tests d'intégration du daemon (moteur factice, API de génération
//! simulée en local).

use axum::response::IntoResponse;
use axum::{extract::Path, routing::get, routing::post, Json, Router};
use itndaemon::{ipc, AudioEngine, DaemonConfig, DaemonCore, FakeEngine};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn test_config(dir: &tempfile::TempDir, server_url: &str) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.path().join("daemon.sock"),
        pid_path: dir.path().join("daemon.pid"),
        status_host: "127.0.0.1".to_string(),
        status_port: 0,
        server_url: server_url.to_string(),
        device_id: "d-test".to_string(),
        device_name: "test-daemon".to_string(),
        sync_interval: Duration::from_millis(100),
        local_poll_interval: Duration::from_millis(50),
        local_heartbeat_interval: Duration::from_millis(200),
        ipc_timeout: Duration::from_secs(4),
        connect_wait: Duration::from_millis(500),
        volume_step: 0.05,
        decoder_cmd: "unused".to_string(),
    }
}

/// API de génération simulée : une playlist, une file d'un morceau.
struct MockApi {
    base_url: String,
    played: Arc<Mutex<Vec<String>>>,
    positions: Arc<Mutex<Vec<i64>>>,
    heartbeats: Arc<Mutex<usize>>,
}

async fn mock_api() -> MockApi {
    let played: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let positions: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let heartbeats: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

    let playlist = json!({
        "id": "pl-1",
        "playlist_key": "k",
        "name": "Mix",
        "mode": "endless",
        "status": "active",
        "prompt": "mellow",
        "prompt_epoch": 0,
        "current_order_index": -1,
        "generated_count": 1,
        "last_seen_at": "2026-01-01T00:00:00Z",
    });
    let queue = json!([
        {
            "id": "song-1",
            "playlist_id": "pl-1",
            "order_index": 0,
            "prompt_epoch": 0,
            "is_interrupt": false,
            "status": "ready",
            "title": "Neon Rain",
            "artist": "Static Veil",
            "caption": null,
            "audio_duration": 180.0,
            "audio_url": "http://host/api/songs/song-1/audio",
            "cover_url": null,
            "user_rating": null,
            "error_message": null,
        }
    ]);

    let played_c = played.clone();
    let positions_c = positions.clone();
    let heartbeats_c = heartbeats.clone();

    let pl = playlist.clone();
    let pl2 = playlist.clone();
    let router = Router::new()
        .route(
            "/api/playlists",
            get(move || {
                let pl = pl2.clone();
                async move { Json(json!([pl])) }
            }),
        )
        .route(
            "/api/playlists/{id}",
            get(move |Path(id): Path<String>| {
                let pl = pl.clone();
                async move {
                    if id == "pl-1" {
                        Json(pl).into_response()
                    } else {
                        (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": "nf"})))
                            .into_response()
                    }
                }
            }),
        )
        .route(
            "/api/playlists/{id}/queue",
            get(move || {
                let queue = queue.clone();
                async move { Json(queue) }
            }),
        )
        .route(
            "/api/playlists/{id}/heartbeat",
            post(move || {
                let heartbeats = heartbeats_c.clone();
                async move {
                    *heartbeats.lock().unwrap() += 1;
                    axum::http::StatusCode::NO_CONTENT
                }
            }),
        )
        .route(
            "/api/playlists/{id}/position",
            post(move |Json(body): Json<Value>| {
                let positions = positions_c.clone();
                async move {
                    positions
                        .lock()
                        .unwrap()
                        .push(body["order_index"].as_i64().unwrap_or(-1));
                    axum::http::StatusCode::NO_CONTENT
                }
            }),
        )
        .route(
            "/api/songs/{id}/played",
            post(move |Path(id): Path<String>| {
                let played = played_c.clone();
                async move {
                    played.lock().unwrap().push(id);
                    axum::http::StatusCode::NO_CONTENT
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });

    MockApi {
        base_url: format!("http://{}", addr),
        played,
        positions,
        heartbeats,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timeout waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_local_plays_first_ready_song() {
    let dir = tempfile::tempdir().unwrap();
    let api = mock_api().await;
    let engine = FakeEngine::new();
    let core = DaemonCore::new(test_config(&dir, &api.base_url), engine.clone());

    let result = core
        .handle_action(
            "startLocal",
            json!({"serverUrl": api.base_url, "playlistId": "pl-1", "playlistKey": "k", "playlistName": "Mix"}),
        )
        .await
        .unwrap();
    assert_eq!(result["playlistId"], "pl-1");

    // Au premier rafraîchissement, le premier morceau ready est chargé.
    let engine_probe = engine.clone();
    wait_for("first song to load", move || {
        engine_probe.snapshot().song_id.as_deref() == Some("song-1")
    })
    .await;

    let status = core.status_snapshot();
    assert_eq!(
        serde_json::to_value(&status.mode).unwrap(),
        json!("local")
    );
    assert!(status.connected);
    assert_eq!(status.local_playlist_id.as_deref(), Some("pl-1"));
    assert!(!status.queue.is_empty());

    // Heartbeat périodique vers le service de données.
    let heartbeats = api.heartbeats.clone();
    wait_for("heartbeat", move || *heartbeats.lock().unwrap() >= 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn song_end_reports_played_and_position() {
    let dir = tempfile::tempdir().unwrap();
    let api = mock_api().await;
    let engine = FakeEngine::new();
    let core = DaemonCore::new(test_config(&dir, &api.base_url), engine.clone());

    core.handle_action("startLocal", json!({"playlistId": "pl-1"}))
        .await
        .unwrap();

    let engine_probe = engine.clone();
    wait_for("song to load", move || {
        engine_probe.snapshot().song_id.is_some()
    })
    .await;

    engine.finish_current();

    let played = api.played.clone();
    wait_for("played report", move || {
        played.lock().unwrap().contains(&"song-1".to_string())
    })
    .await;
    let positions = api.positions.clone();
    wait_for("position report", move || {
        positions.lock().unwrap().contains(&0)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn play_is_idempotent_when_already_playing() {
    let dir = tempfile::tempdir().unwrap();
    let api = mock_api().await;
    let engine = FakeEngine::new();
    let core = DaemonCore::new(test_config(&dir, &api.base_url), engine.clone());

    core.handle_action("startLocal", json!({"playlistId": "pl-1"}))
        .await
        .unwrap();
    let engine_probe = engine.clone();
    wait_for("song to load", move || engine_probe.snapshot().is_playing).await;

    let result = core.handle_action("play", json!({})).await.unwrap();
    assert_eq!(result["noop"], true);
    assert!(engine.snapshot().is_playing);
}

#[tokio::test(flavor = "multi_thread")]
async fn playback_without_session_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new();
    let core = DaemonCore::new(test_config(&dir, "http://127.0.0.1:1"), engine);

    let err = core.handle_action("play", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "not_connected");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_playlist_is_a_stale_session() {
    let dir = tempfile::tempdir().unwrap();
    let api = mock_api().await;
    let engine = FakeEngine::new();
    let core = DaemonCore::new(test_config(&dir, &api.base_url), engine);

    let err = core
        .handle_action("startLocal", json!({"playlistId": "pl-gone"}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "stale_room_session");
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_delta_clamps() {
    let dir = tempfile::tempdir().unwrap();
    let api = mock_api().await;
    let engine = FakeEngine::new();
    let core = DaemonCore::new(test_config(&dir, &api.base_url), engine.clone());

    core.handle_action("startLocal", json!({"playlistId": "pl-1"}))
        .await
        .unwrap();
    let engine_probe = engine.clone();
    wait_for("song to load", move || {
        engine_probe.snapshot().song_id.is_some()
    })
    .await;

    core.handle_action("volumeDelta", json!({"delta": 0.9}))
        .await
        .unwrap();
    assert!((engine.snapshot().volume - 1.0).abs() < f64::EPSILON);

    core.handle_action("volumeDelta", json!({"delta": -5.0}))
        .await
        .unwrap();
    assert!((engine.snapshot().volume - 0.0).abs() < f64::EPSILON);
}

// ============================================================================
// IPC
// ============================================================================

async fn ipc_request(socket_path: &PathBuf, request: Value) -> Value {
    let stream = UnixStream::connect(socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    let mut encoded = request.to_string();
    encoded.push('\n');
    write_half.write_all(encoded.as_bytes()).await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn ipc_echoes_request_id() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, "http://127.0.0.1:1");
    let socket_path = config.socket_path.clone();
    let engine = FakeEngine::new();
    let core = DaemonCore::new(config.clone(), engine);

    let listener = ipc::bind_control_socket(&config.socket_path, &config.pid_path)
        .await
        .unwrap();
    tokio::spawn(ipc::serve(core, listener));

    let response = ipc_request(&socket_path, json!({"id": "req-42", "action": "status"})).await;
    assert_eq!(response["id"], "req-42");
    assert_eq!(response["ok"], true);
    assert_eq!(response["data"]["mode"], "idle");

    let response = ipc_request(
        &socket_path,
        json!({"id": "req-43", "action": "teleport"}),
    )
    .await;
    assert_eq!(response["id"], "req-43");
    assert_eq!(response["ok"], false);
    assert!(response["error"]
        .as_str()
        .unwrap()
        .starts_with("unknown_action"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_socket_is_cleaned_live_socket_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("daemon.sock");
    let pid_path = dir.path().join("daemon.pid");

    // Socket mort : fichier présent mais personne n'écoute.
    {
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        drop(listener);
    }
    assert!(socket_path.exists());
    let listener = ipc::bind_control_socket(&socket_path, &pid_path)
        .await
        .unwrap();

    // Socket vivant : le second bind échoue avec l'erreur « in use ».
    let err = ipc::bind_control_socket(&socket_path, &pid_path)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "socket_in_use");
    drop(listener);
}
