//! Tests d'intégration de l'acteur room (sans socket).

use itnroom::protocol::{
    ClientMessage, Command, DeviceMode, DeviceRole, ServerMessage,
};
use itnroom::room::{spawn_room, DeviceInfo, RoomMsg, RoomTuning};
use itnstore::{NewPlaylist, PlaylistMode, SongMetadata, SongStatus, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

fn tuning() -> RoomTuning {
    RoomTuning {
        start_lead_ms: 20,
        drift_threshold_ms: 500,
    }
}

fn store_with_ready_songs(count: usize) -> (Arc<Store>, String) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let playlist = store
        .create_playlist(NewPlaylist {
            playlist_key: "kitchen".to_string(),
            name: "Kitchen Mix".to_string(),
            mode: PlaylistMode::Endless,
            prompt: "synthwave".to_string(),
        })
        .unwrap();

    for i in 0..count {
        let song = store
            .create_pending(&playlist.id, i as i64, 0, false, None)
            .unwrap();
        store.claim_metadata(&song.id).unwrap();
        store
            .complete_metadata(
                &song.id,
                &SongMetadata {
                    title: Some(format!("Track {}", i)),
                    artist: Some("Static Veil".to_string()),
                    audio_duration: Some(180.0),
                    ..SongMetadata::default()
                },
            )
            .unwrap();
        store.claim_audio(&song.id).unwrap();
        store
            .update_ace_task(&song.id, &format!("t{}", i), chrono::Utc::now())
            .unwrap();
        store.update_status(&song.id, SongStatus::Saving).unwrap();
        store
            .update_storage_path(
                &song.id,
                &format!("/tmp/{}.mp3", i),
                &format!("http://host/api/songs/{}/audio", song.id),
            )
            .unwrap();
        store.mark_ready(&song.id).unwrap();
    }

    (store, playlist.id)
}

struct TestDevice {
    device_id: String,
    rx: mpsc::Receiver<ServerMessage>,
}

impl TestDevice {
    /// Attend le prochain message satisfaisant le prédicat.
    async fn expect<F: Fn(&ServerMessage) -> bool>(&mut self, what: &str, pred: F) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let Some(msg) = self.rx.recv().await else {
                    panic!("channel closed while waiting for {}", what);
                };
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for {}", what))
    }
}

async fn join(
    room: &itnroom::RoomHandle,
    device_id: &str,
    role: DeviceRole,
    mode: DeviceMode,
) -> TestDevice {
    let (tx, rx) = mpsc::channel(64);
    let (reply_tx, reply_rx) = oneshot::channel();
    room.send(RoomMsg::Join {
        device: DeviceInfo {
            device_id: device_id.to_string(),
            name: device_id.to_string(),
            role,
            mode,
        },
        outbound: tx,
        reply: reply_tx,
    })
    .await;
    reply_rx.await.unwrap();
    TestDevice {
        device_id: device_id.to_string(),
        rx,
    }
}

async fn client(room: &itnroom::RoomHandle, device_id: &str, message: ClientMessage) {
    assert!(
        room.send(RoomMsg::Client {
            device_id: device_id.to_string(),
            message,
        })
        .await
    );
}

#[tokio::test]
async fn join_gets_ack_state_and_queue() {
    let (store, _playlist_id) = store_with_ready_songs(2);
    let room = spawn_room("r1".into(), "kitchen".into(), store, tuning());

    let mut device = join(&room, "d1", DeviceRole::Player, DeviceMode::Default).await;

    let ack = device
        .expect("joinAck", |m| matches!(m, ServerMessage::JoinAck { .. }))
        .await;
    match ack {
        ServerMessage::JoinAck {
            room_id,
            device_id,
            protocol_version,
        } => {
            assert_eq!(room_id, "r1");
            assert_eq!(device_id, "d1");
            assert_eq!(protocol_version, itnroom::PROTOCOL_VERSION);
        }
        _ => unreachable!(),
    }

    device
        .expect("state", |m| matches!(m, ServerMessage::State { .. }))
        .await;
    let queue = device
        .expect("queue", |m| matches!(m, ServerMessage::Queue { .. }))
        .await;
    match queue {
        ServerMessage::Queue { songs } => assert_eq!(songs.len(), 2),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn song_advancement_has_monotonic_start_at() {
    let (store, _playlist_id) = store_with_ready_songs(3);
    let room = spawn_room("r1".into(), "kitchen".into(), store, tuning());
    let mut device = join(&room, "d1", DeviceRole::Player, DeviceMode::Default).await;

    // play sans morceau courant : démarre le premier ready.
    client(
        &room,
        "d1",
        ClientMessage::Command {
            command: Command::Play,
            target_device_id: None,
        },
    )
    .await;

    let first = device
        .expect("first nextSong", |m| matches!(m, ServerMessage::NextSong { .. }))
        .await;
    let ServerMessage::NextSong {
        song_id: first_song,
        start_at: first_start,
        ..
    } = first
    else {
        unreachable!()
    };

    // Fin naturelle : le serveur programme le morceau suivant.
    client(
        &room,
        "d1",
        ClientMessage::SongEnded {
            song_id: first_song.clone(),
        },
    )
    .await;

    let second = device
        .expect("second nextSong", |m| matches!(m, ServerMessage::NextSong { .. }))
        .await;
    let ServerMessage::NextSong {
        song_id: second_song,
        start_at: second_start,
        ..
    } = second
    else {
        unreachable!()
    };

    assert_ne!(first_song, second_song);
    assert!(second_start >= first_start, "startAt must be monotonic");
}

#[tokio::test]
async fn song_ended_marks_played() {
    let (store, _playlist_id) = store_with_ready_songs(2);
    let room = spawn_room("r1".into(), "kitchen".into(), store.clone(), tuning());
    let mut device = join(&room, "d1", DeviceRole::Player, DeviceMode::Default).await;

    client(
        &room,
        "d1",
        ClientMessage::Command {
            command: Command::Play,
            target_device_id: None,
        },
    )
    .await;
    let first = device
        .expect("nextSong", |m| matches!(m, ServerMessage::NextSong { .. }))
        .await;
    let ServerMessage::NextSong { song_id, .. } = first else {
        unreachable!()
    };

    client(&room, "d1", ClientMessage::SongEnded { song_id: song_id.clone() }).await;
    device
        .expect("second nextSong", |m| matches!(m, ServerMessage::NextSong { .. }))
        .await;

    let played = store.get_song(&song_id).unwrap();
    assert_eq!(played.status, SongStatus::Played);
}

#[tokio::test]
async fn drift_above_threshold_triggers_seek() {
    let (store, _playlist_id) = store_with_ready_songs(1);
    let room = spawn_room("r1".into(), "kitchen".into(), store, tuning());
    let mut device = join(&room, "d1", DeviceRole::Player, DeviceMode::Default).await;

    client(
        &room,
        "d1",
        ClientMessage::Command {
            command: Command::Play,
            target_device_id: None,
        },
    )
    .await;
    let next = device
        .expect("nextSong", |m| matches!(m, ServerMessage::NextSong { .. }))
        .await;
    let ServerMessage::NextSong { song_id, .. } = next else {
        unreachable!()
    };

    // Laisse le startAt passer pour que la lecture soit réputée engagée.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Le player rapporte une tête de lecture très en retard.
    client(
        &room,
        "d1",
        ClientMessage::Sync {
            current_song_id: Some(song_id),
            current_time: -10.0,
            is_playing: true,
        },
    )
    .await;

    let correction = device
        .expect("execute seek", |m| {
            matches!(
                m,
                ServerMessage::Execute {
                    command: Command::Seek { .. }
                }
            )
        })
        .await;
    let ServerMessage::Execute {
        command: Command::Seek { time },
    } = correction
    else {
        unreachable!()
    };
    assert!(time >= 0.0);
}

#[tokio::test]
async fn volume_is_clamped() {
    let (store, _playlist_id) = store_with_ready_songs(1);
    let room = spawn_room("r1".into(), "kitchen".into(), store, tuning());
    let mut device = join(&room, "d1", DeviceRole::Controller, DeviceMode::Default).await;

    client(
        &room,
        "d1",
        ClientMessage::Command {
            command: Command::SetVolume { volume: 1.8 },
            target_device_id: None,
        },
    )
    .await;

    let execute = device
        .expect("execute setVolume", |m| {
            matches!(
                m,
                ServerMessage::Execute {
                    command: Command::SetVolume { .. }
                }
            )
        })
        .await;
    let ServerMessage::Execute {
        command: Command::SetVolume { volume },
    } = execute
    else {
        unreachable!()
    };
    assert!((volume - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn individual_command_targets_single_device() {
    let (store, _playlist_id) = store_with_ready_songs(1);
    let room = spawn_room("r1".into(), "kitchen".into(), store, tuning());
    let mut player = join(&room, "player", DeviceRole::Player, DeviceMode::Individual).await;
    let mut other = join(&room, "other", DeviceRole::Player, DeviceMode::Default).await;

    // Vide les messages de join.
    player
        .expect("queue", |m| matches!(m, ServerMessage::Queue { .. }))
        .await;
    other
        .expect("queue", |m| matches!(m, ServerMessage::Queue { .. }))
        .await;

    client(
        &room,
        "controller",
        ClientMessage::Command {
            command: Command::Pause,
            target_device_id: Some(player.device_id.clone()),
        },
    )
    .await;

    player
        .expect("targeted execute", |m| {
            matches!(
                m,
                ServerMessage::Execute {
                    command: Command::Pause
                }
            )
        })
        .await;

    // L'autre device ne reçoit aucun execute (seulement d'éventuels états).
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(msg) = other.rx.try_recv() {
        assert!(
            !matches!(msg, ServerMessage::Execute { .. }),
            "untargeted device must not receive the execute"
        );
    }
}
