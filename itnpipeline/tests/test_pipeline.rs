//! Tests d'intégration du pipeline de génération (providers factices,
//! aucun réseau).

use itnpipeline::{GenerationSettings, Pipeline};
use itnproviders::testing::{FakeAudio, FakeImage, FakeLlm};
use itnproviders::ProviderRegistry;
use itnstore::{NewPlaylist, PlaylistMode, PlaylistStatus, SongStatus, Store};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn test_settings(storage: &tempfile::TempDir) -> GenerationSettings {
    GenerationSettings {
        buffer_target: 2,
        dedup_window: 12,
        stale_after_secs: 900,
        heartbeat_timeout_secs: 90,
        auto_retry_limit: 2,
        storage_dir: storage.path().to_path_buf(),
        base_url: "http://127.0.0.1:8080".to_string(),
        audio_poll_interval: Duration::from_millis(20),
        not_found_grace: Duration::from_millis(120),
    }
}

fn metadata_json(title: &str) -> serde_json::Value {
    json!({
        "title": title,
        "artist": "Static Veil",
        "caption": "late night synthwave",
        "lyrics": "neon lights again",
        "bpm": 104.0,
    })
}

struct Fixture {
    store: Arc<Store>,
    audio: Arc<FakeAudio>,
    llm: Arc<FakeLlm>,
    pipeline: Pipeline,
    _storage: tempfile::TempDir,
}

fn fixture(llm: FakeLlm) -> Fixture {
    let storage = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let registry = Arc::new(ProviderRegistry::new());
    let llm = Arc::new(llm);
    let audio = Arc::new(FakeAudio::new());
    registry.register_llm(llm.clone());
    registry.register_image(Arc::new(FakeImage::new()));
    registry.register_audio(audio.clone());

    let pipeline = Pipeline::new(store.clone(), registry, test_settings(&storage));
    Fixture {
        store,
        audio,
        llm,
        pipeline,
        _storage: storage,
    }
}

fn new_playlist(store: &Store, mode: PlaylistMode) -> itnstore::Playlist {
    store
        .create_playlist(NewPlaylist {
            playlist_key: "kitchen".to_string(),
            name: "Kitchen Mix".to_string(),
            mode,
            prompt: "mellow synthwave".to_string(),
        })
        .unwrap()
}

/// Plan de gestion couvrant largement la fenêtre des tests.
fn wide_plan() -> itnstore::ManagerPlan {
    itnstore::ManagerPlan {
        start_order_index: 0,
        window_size: 100,
        slots: vec![
            itnstore::ManagerSlot {
                transition: None,
                topic: Some("opening".to_string()),
                lyrical_theme: None,
                energy_target: None,
            },
            itnstore::ManagerSlot {
                transition: None,
                topic: Some("middle".to_string()),
                lyrical_theme: None,
                energy_target: None,
            },
            itnstore::ManagerSlot {
                transition: None,
                topic: Some("closing".to_string()),
                lyrical_theme: None,
                energy_target: None,
            },
        ],
    }
}

/// Fichier audio factice que le provider prétend avoir produit.
fn fake_audio_file(dir: &tempfile::TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, b"RIFFfake").unwrap();
    path.to_string_lossy().to_string()
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timeout waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_generation_flow_reaches_ready() {
    let source_dir = tempfile::tempdir().unwrap();
    let fx = fixture(FakeLlm::returning_json(vec![metadata_json("Neon Rain")]));

    let audio_file = fake_audio_file(&source_dir, "generated.mp3");
    fx.audio.succeed_immediately("task-1", &audio_file);
    fx.audio.succeed_immediately("task-2", &audio_file);

    fx.pipeline.start().await;
    let playlist = new_playlist(&fx.store, PlaylistMode::Endless);

    // Le buffer (cible 2) se remplit et les deux morceaux aboutissent.
    let store = fx.store.clone();
    let playlist_id = playlist.id.clone();
    wait_for("songs to be ready", || {
        store
            .list_by_playlist(&playlist_id)
            .map(|songs| {
                songs.len() == 2 && songs.iter().all(|s| s.status == SongStatus::Ready)
            })
            .unwrap_or(false)
    })
    .await;

    let songs = fx.store.list_by_playlist(&playlist.id).unwrap();
    for (i, song) in songs.iter().enumerate() {
        assert_eq!(song.order_index, i as i64);
        assert!(song.audio_url.as_deref().unwrap().contains(&song.id));
        assert!(song.storage_path.is_some());
        assert_eq!(song.metadata.title.as_deref(), Some("Neon Rain"));
    }

    fx.pipeline.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_metadata_retries_once_then_accepts() {
    let source_dir = tempfile::tempdir().unwrap();
    // Les deux réponses sont le même doublon : après un retry, on accepte.
    let fx = fixture(FakeLlm::returning_json(vec![
        metadata_json("Neon Rain"),
        metadata_json("Neon Rain"),
    ]));

    let playlist = new_playlist(&fx.store, PlaylistMode::Endless);

    // Brief déjà en place : seuls les appels de métadonnées comptent.
    fx.store
        .update_manager_brief(&playlist.id, "steady set", &wide_plan(), 0)
        .unwrap();

    // Un morceau ready existant porte déjà ce titre/artiste.
    let existing = fx
        .store
        .create_pending(&playlist.id, 0, 0, false, None)
        .unwrap();
    fx.store.claim_metadata(&existing.id).unwrap();
    fx.store
        .complete_metadata(
            &existing.id,
            &itnstore::SongMetadata {
                title: Some("Neon Rain".to_string()),
                artist: Some("Static Veil".to_string()),
                ..itnstore::SongMetadata::default()
            },
        )
        .unwrap();
    fx.store.claim_audio(&existing.id).unwrap();
    fx.store
        .update_ace_task(&existing.id, "task-0", chrono::Utc::now())
        .unwrap();
    fx.store.update_status(&existing.id, SongStatus::Saving).unwrap();
    fx.store
        .update_storage_path(&existing.id, "/tmp/x.mp3", "http://host/a.mp3")
        .unwrap();
    fx.store.mark_ready(&existing.id).unwrap();

    let audio_file = fake_audio_file(&source_dir, "generated.mp3");
    fx.audio.succeed_immediately("task-1", &audio_file);

    let song = fx
        .store
        .create_pending(&playlist.id, 1, 0, false, None)
        .unwrap();
    fx.pipeline.spawn_worker(&song.id);

    let store = fx.store.clone();
    let song_id = song.id.clone();
    wait_for("duplicate song to finish", || {
        store
            .get_song(&song_id)
            .map(|s| s.status == SongStatus::Ready)
            .unwrap_or(false)
    })
    .await;

    // Un retry exactement, puis acceptation du doublon : les deux existent.
    assert_eq!(fx.llm.calls.load(Ordering::SeqCst), 2);
    let songs = fx.store.list_by_playlist(&playlist.id).unwrap();
    assert_eq!(songs.len(), 2);
    assert!(songs
        .iter()
        .all(|s| s.metadata.title.as_deref() == Some("Neon Rain")));
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_audio_task_reverts_and_resubmits() {
    let source_dir = tempfile::tempdir().unwrap();
    let fx = fixture(FakeLlm::returning_json(vec![metadata_json("Ghost Task")]));

    // Première soumission : la tâche reste introuvable (perdue côté
    // provider). Deuxième soumission : succès.
    fx.audio.queue_task("t-lost");
    let audio_file = fake_audio_file(&source_dir, "generated.mp3");
    fx.audio.succeed_immediately("t-found", &audio_file);

    let playlist = new_playlist(&fx.store, PlaylistMode::Endless);
    let song = fx
        .store
        .create_pending(&playlist.id, 0, 0, false, None)
        .unwrap();

    let started = std::time::Instant::now();
    fx.pipeline.spawn_worker(&song.id);

    let store = fx.store.clone();
    let song_id = song.id.clone();
    wait_for("song to recover from lost task", || {
        store
            .get_song(&song_id)
            .map(|s| s.status == SongStatus::Ready)
            .unwrap_or(false)
    })
    .await;

    // La résolution not_found n'arrive qu'après la période de grâce.
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(fx.audio.submissions.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_audio_marks_error_with_message() {
    let fx = fixture(FakeLlm::returning_json(vec![metadata_json("Doomed")]));

    fx.audio.queue_task("t-fail");
    fx.audio.script(
        "t-fail",
        vec![itnproviders::AudioPollResult {
            status: itnproviders::AudioTaskState::Failed,
            audio_path: None,
            error: Some("generation blew up".to_string()),
        }],
    );

    let playlist = new_playlist(&fx.store, PlaylistMode::Endless);
    let song = fx
        .store
        .create_pending(&playlist.id, 0, 0, false, None)
        .unwrap();
    fx.pipeline.spawn_worker(&song.id);

    let store = fx.store.clone();
    let song_id = song.id.clone();
    wait_for("song to error", || {
        store
            .get_song(&song_id)
            .map(|s| s.status == SongStatus::Error)
            .unwrap_or(false)
    })
    .await;

    let song_row = fx.store.get_song(&song.id).unwrap();
    assert_eq!(song_row.error_message.as_deref(), Some("generation blew up"));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_buffer_checks_do_not_collide() {
    let fx = fixture(FakeLlm::returning_json(vec![metadata_json("X")]));
    let playlist = new_playlist(&fx.store, PlaylistMode::Endless);

    let p1 = fx.pipeline.clone();
    let p2 = fx.pipeline.clone();
    let id1 = playlist.id.clone();
    let id2 = playlist.id.clone();
    tokio::join!(p1.ensure_buffer(&id1), p2.ensure_buffer(&id2));

    // Cible 2 : exactement 2 morceaux, order_index 0 et 1, sans collision.
    let songs = fx.store.list_by_playlist(&playlist.id).unwrap();
    assert_eq!(songs.len(), 2);
    assert_eq!(songs[0].order_index, 0);
    assert_eq!(songs[1].order_index, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn oneshot_creates_single_song() {
    let fx = fixture(FakeLlm::returning_json(vec![metadata_json("One")]));
    let playlist = new_playlist(&fx.store, PlaylistMode::Oneshot);

    fx.pipeline.ensure_buffer(&playlist.id).await;
    fx.pipeline.ensure_buffer(&playlist.id).await;

    let songs = fx.store.list_by_playlist(&playlist.id).unwrap();
    assert_eq!(songs.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_heartbeat_closes_playlist() {
    let storage = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let registry = Arc::new(ProviderRegistry::new());
    registry.register_llm(Arc::new(FakeLlm::returning_text("x")));
    registry.register_image(Arc::new(FakeImage::new()));
    registry.register_audio(Arc::new(FakeAudio::new()));

    let mut settings = test_settings(&storage);
    settings.heartbeat_timeout_secs = 0; // tout heartbeat est immédiatement périmé
    let pipeline = Pipeline::new(store.clone(), registry, settings);

    let playlist = new_playlist(&store, PlaylistMode::Endless);

    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.heartbeat_sweep().await;
    assert_eq!(
        store.get_playlist(&playlist.id).unwrap().status,
        PlaylistStatus::Closing
    );

    // Aucun morceau transitoire : le second passage ferme définitivement.
    pipeline.heartbeat_sweep().await;
    assert_eq!(
        store.get_playlist(&playlist.id).unwrap().status,
        PlaylistStatus::Closed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn steering_purges_and_refills_under_new_epoch() {
    let source_dir = tempfile::tempdir().unwrap();
    let fx = fixture(FakeLlm::returning_json(vec![metadata_json("Fresh")]));
    let audio_file = fake_audio_file(&source_dir, "generated.mp3");
    for i in 1..=8 {
        fx.audio
            .succeed_immediately(&format!("task-{}", i), &audio_file);
    }

    fx.pipeline.start().await;
    let playlist = new_playlist(&fx.store, PlaylistMode::Endless);

    let store = fx.store.clone();
    let playlist_id = playlist.id.clone();
    wait_for("initial buffer", || {
        store
            .list_by_playlist(&playlist_id)
            .map(|songs| songs.len() >= 2)
            .unwrap_or(false)
    })
    .await;

    let interrupt = fx
        .store
        .create_pending(&playlist.id, 50, 0, true, Some("birthday song"))
        .unwrap();

    fx.store.steer(&playlist.id, "dark techno").unwrap();

    // L'epoch 0 pending est purgé, l'interrupt survit, le buffer se
    // reremplit sous l'epoch 1.
    let store = fx.store.clone();
    let playlist_id = playlist.id.clone();
    wait_for("epoch purge and refill", || {
        let Ok(songs) = store.list_by_playlist(&playlist_id) else {
            return false;
        };
        let no_stale_pending = songs
            .iter()
            .all(|s| !(s.status == SongStatus::Pending && s.prompt_epoch < 1 && !s.is_interrupt));
        let fresh = songs
            .iter()
            .filter(|s| s.prompt_epoch == 1 && !s.is_interrupt)
            .count();
        no_stale_pending && fresh >= 1
    })
    .await;

    let songs = fx.store.list_by_playlist(&playlist.id).unwrap();
    assert!(songs.iter().any(|s| s.id == interrupt.id));

    fx.pipeline.shutdown();
}
