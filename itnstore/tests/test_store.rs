//! Tests d'intégration du service de données.

use itnstore::{
    NewPlaylist, PlaylistMode, PlaylistStatus, SongMetadata, SongStatus, Store, StoreEvent,
    WorkQueueParams,
};

fn new_store() -> Store {
    Store::open_in_memory().unwrap()
}

fn new_playlist(store: &Store, key: &str) -> itnstore::Playlist {
    store
        .create_playlist(NewPlaylist {
            playlist_key: key.to_string(),
            name: format!("Playlist {}", key),
            mode: PlaylistMode::Endless,
            prompt: "synthwave at dusk".to_string(),
        })
        .unwrap()
}

fn ready_song(store: &Store, playlist_id: &str, order_index: i64, title: &str) -> String {
    let song = store
        .create_pending(playlist_id, order_index, 0, false, None)
        .unwrap();
    assert!(store.claim_metadata(&song.id).unwrap());
    store
        .complete_metadata(
            &song.id,
            &SongMetadata {
                title: Some(title.to_string()),
                artist: Some("Static Veil".to_string()),
                ..SongMetadata::default()
            },
        )
        .unwrap();
    assert!(store.claim_audio(&song.id).unwrap());
    store
        .update_ace_task(&song.id, &format!("task-{}", order_index), chrono::Utc::now())
        .unwrap();
    store.update_status(&song.id, SongStatus::Saving).unwrap();
    store
        .update_storage_path(&song.id, "/tmp/a.mp3", "http://host/songs/a.mp3")
        .unwrap();
    store.mark_ready(&song.id).unwrap();
    song.id
}

#[test]
fn claim_is_exclusive() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");
    let song = store.create_pending(&playlist.id, 0, 0, false, None).unwrap();

    assert!(store.claim_metadata(&song.id).unwrap());
    assert!(!store.claim_metadata(&song.id).unwrap());

    let song = store.get_song(&song.id).unwrap();
    assert_eq!(song.status, SongStatus::GeneratingMetadata);
}

#[test]
fn ready_requires_audio_url() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");
    let song = store.create_pending(&playlist.id, 0, 0, false, None).unwrap();

    assert!(store.mark_ready(&song.id).is_err());
}

#[test]
fn epoch_purge_spares_interrupts() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");

    store.create_pending(&playlist.id, 0, 0, false, None).unwrap();
    store.create_pending(&playlist.id, 1, 0, false, None).unwrap();
    let interrupt = store
        .create_pending(&playlist.id, 2, 0, true, Some("birthday song for Ana"))
        .unwrap();

    let new_epoch = store.steer(&playlist.id, "dark techno").unwrap();
    assert_eq!(new_epoch, 1);

    let purged = store.purge_stale_pending(&playlist.id, new_epoch).unwrap();
    assert_eq!(purged.len(), 2);

    let remaining = store.list_by_playlist(&playlist.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, interrupt.id);
    assert!(remaining[0].is_interrupt);
}

#[test]
fn steer_emits_event_with_new_epoch() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");
    let mut rx = store.subscribe();

    store.steer(&playlist.id, "ambient rain").unwrap();

    loop {
        match rx.try_recv().unwrap() {
            StoreEvent::PlaylistSteered {
                playlist_id,
                new_epoch,
            } => {
                assert_eq!(playlist_id, playlist.id);
                assert_eq!(new_epoch, 1);
                break;
            }
            _ => continue,
        }
    }
}

#[test]
fn work_queue_counts_and_deficit() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");

    store.create_pending(&playlist.id, 0, 0, false, None).unwrap();
    ready_song(&store, &playlist.id, 1, "Neon Rain");

    let wq = store
        .get_work_queue(
            &playlist.id,
            WorkQueueParams {
                buffer_target: 4,
                dedup_window: 12,
                stale_after_secs: 900,
            },
        )
        .unwrap();

    assert_eq!(wq.total_songs, 2);
    assert_eq!(wq.pending.len(), 1);
    assert_eq!(wq.max_order_index, 1);
    assert_eq!(wq.transient_count, 1);
    // 2 morceaux à venir (pointeur à -1), cible 4 → déficit 2
    assert_eq!(wq.buffer_deficit, 2);
    assert_eq!(wq.recent_descriptions.len(), 1);
    assert_eq!(wq.recent_descriptions[0].title, "Neon Rain");
}

#[test]
fn closing_playlist_refuses_new_songs() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");

    store
        .update_playlist_status(&playlist.id, PlaylistStatus::Closing)
        .unwrap();

    assert!(store.create_pending(&playlist.id, 0, 0, false, None).is_err());
}

#[test]
fn heartbeat_reactivates_closing_playlist() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");

    store
        .update_playlist_status(&playlist.id, PlaylistStatus::Closing)
        .unwrap();
    store.heartbeat(&playlist.id).unwrap();

    let playlist = store.get_playlist(&playlist.id).unwrap();
    assert_eq!(playlist.status, PlaylistStatus::Active);
}

#[test]
fn revert_transient_forgets_audio_task() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");
    let song = store.create_pending(&playlist.id, 0, 0, false, None).unwrap();

    store.claim_metadata(&song.id).unwrap();
    store
        .complete_metadata(&song.id, &SongMetadata::default())
        .unwrap();
    store.claim_audio(&song.id).unwrap();
    store
        .update_ace_task(&song.id, "task-1", chrono::Utc::now())
        .unwrap();

    store
        .revert_transient(&song.id, SongStatus::MetadataReady)
        .unwrap();

    let song = store.get_song(&song.id).unwrap();
    assert_eq!(song.status, SongStatus::MetadataReady);
    assert!(song.ace_task_id.is_none());
    assert!(song.ace_submitted_at.is_none());
}

#[test]
fn retry_errored_is_bounded_by_caller() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");
    let song = store.create_pending(&playlist.id, 0, 0, false, None).unwrap();

    store.mark_error(&song.id, "provider timeout").unwrap();
    let song_row = store.get_song(&song.id).unwrap();
    assert_eq!(song_row.status, SongStatus::Error);
    assert_eq!(song_row.error_message.as_deref(), Some("provider timeout"));

    assert!(store.retry_errored(&song.id).unwrap());
    assert!(!store.retry_errored(&song.id).unwrap()); // plus en erreur

    let song_row = store.get_song(&song.id).unwrap();
    assert_eq!(song_row.status, SongStatus::RetryPending);
    assert_eq!(song_row.retry_count, 1);
    assert!(song_row.error_message.is_none());
}

#[test]
fn ready_queue_follows_consumer_pointer() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");

    ready_song(&store, &playlist.id, 0, "One");
    ready_song(&store, &playlist.id, 1, "Two");
    ready_song(&store, &playlist.id, 2, "Three");

    store.set_current_order_index(&playlist.id, 0).unwrap();
    let queue = store.ready_queue(&playlist.id).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].metadata.title.as_deref(), Some("Two"));

    let next = store.next_ready_after(&playlist.id, 1).unwrap().unwrap();
    assert_eq!(next.metadata.title.as_deref(), Some("Three"));
}

#[test]
fn playlist_bound_by_key() {
    let store = new_store();
    let playlist = new_playlist(&store, "kitchen");

    let found = store.get_playlist_by_key("kitchen").unwrap().unwrap();
    assert_eq!(found.id, playlist.id);
    assert!(store.get_playlist_by_key("garage").unwrap().is_none());
}

#[test]
fn delete_playlist_cascades_songs() {
    let store = new_store();
    let playlist = new_playlist(&store, "k1");
    let song = store.create_pending(&playlist.id, 0, 0, false, None).unwrap();

    store.delete_playlist(&playlist.id).unwrap();

    assert!(matches!(
        store.get_song(&song.id),
        Err(itnstore::Error::SongNotFound(_))
    ));
    assert!(matches!(
        store.get_playlist(&playlist.id),
        Err(itnstore::Error::PlaylistNotFound(_))
    ));
}
