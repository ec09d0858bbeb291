//! Protocole du canal room (JSON taggé, full-duplex).
//!
//! Chaque message porte un discriminant `type`. Les champs sont en
//! camelCase sur le fil. La version de protocole est annoncée dans
//! `joinAck`.

use itnstore::Song;
use serde::{Deserialize, Serialize};

/// Version annoncée dans `joinAck`.
pub const PROTOCOL_VERSION: u32 = 2;

/// Rôle d'un device dans une room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Player,
    Controller,
}

/// Mode d'un device : `default` suit la room, `individual` n'exécute que
/// les directives qui le ciblent explicitement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Default,
    Individual,
}

/// Commande de contrôle de lecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    Play,
    Pause,
    Toggle,
    Skip,
    #[serde(rename_all = "camelCase")]
    SetVolume { volume: f64 },
    #[serde(rename_all = "camelCase")]
    Seek { time: f64 },
    ToggleMute,
    #[serde(rename_all = "camelCase")]
    SelectSong { song_id: String },
}

/// État de lecture autoritaire d'une room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub current_song_id: Option<String>,
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub volume: f64,
    pub is_muted: bool,
}

/// Vue d'un morceau sur le fil.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongSnapshot {
    pub song_id: String,
    pub order_index: i64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub audio_url: Option<String>,
    pub cover_url: Option<String>,
    pub duration: Option<f64>,
}

impl From<&Song> for SongSnapshot {
    fn from(song: &Song) -> Self {
        Self {
            song_id: song.id.clone(),
            order_index: song.order_index,
            title: song.metadata.title.clone(),
            artist: song.metadata.artist.clone(),
            audio_url: song.audio_url.clone(),
            cover_url: song.cover_url.clone(),
            duration: song.metadata.audio_duration,
        }
    }
}

/// Vue d'un device sur le fil.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub name: String,
    pub role: DeviceRole,
    pub mode: DeviceMode,
}

/// Messages client → serveur.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enregistre le device ; crée la room depuis `playlistKey` si absente.
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        playlist_key: String,
        room_name: Option<String>,
        device_id: String,
        device_name: Option<String>,
        role: DeviceRole,
        #[serde(default)]
        mode: Option<DeviceMode>,
    },
    /// Commande de lecture, éventuellement ciblée (mode individual).
    #[serde(rename_all = "camelCase")]
    Command {
        #[serde(flatten)]
        command: Command,
        target_device_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RenameDevice { name: String },
    /// Un player rapporte sa tête de lecture locale.
    #[serde(rename_all = "camelCase")]
    Sync {
        current_song_id: Option<String>,
        current_time: f64,
        is_playing: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetRole { role: DeviceRole },
    /// Fin naturelle du morceau côté player.
    #[serde(rename_all = "camelCase")]
    SongEnded { song_id: String },
    /// Sonde d'horloge.
    #[serde(rename_all = "camelCase")]
    Ping { client_time: i64 },
}

/// Messages serveur → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    JoinAck {
        room_id: String,
        device_id: String,
        protocol_version: u32,
    },
    #[serde(rename_all = "camelCase")]
    State {
        playback: PlaybackState,
        current_song: Option<SongSnapshot>,
        devices: Vec<DeviceSnapshot>,
    },
    #[serde(rename_all = "camelCase")]
    Queue { songs: Vec<SongSnapshot> },
    /// Directive de lecture autoritaire.
    #[serde(rename_all = "camelCase")]
    Execute {
        #[serde(flatten)]
        command: Command,
    },
    /// Charge `songId` depuis `audioUrl`, prêt pour l'instant `startAt`
    /// (temps serveur, millisecondes epoch).
    #[serde(rename_all = "camelCase")]
    NextSong {
        song_id: String,
        audio_url: String,
        start_at: i64,
    },
    /// Préchauffe l'audio d'un futur morceau.
    #[serde(rename_all = "camelCase")]
    Preload { song_id: String, audio_url: String },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    Pong { client_time: i64, server_time: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_round_trips() {
        let json = r#"{"type":"join","roomId":"r1","playlistKey":"k1","roomName":"Kitchen","deviceId":"d1","deviceName":"Pi","role":"player"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match &msg {
            ClientMessage::Join {
                room_id,
                playlist_key,
                role,
                mode,
                ..
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(playlist_key, "k1");
                assert_eq!(*role, DeviceRole::Player);
                assert!(mode.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, ClientMessage::Join { .. }));
    }

    #[test]
    fn command_flattens_action() {
        let json = r#"{"type":"command","action":"setVolume","volume":0.4}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Command {
                command: Command::SetVolume { volume },
                target_device_id,
            } => {
                assert!((volume - 0.4).abs() < f64::EPSILON);
                assert!(target_device_id.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn execute_seek_wire_format() {
        let msg = ServerMessage::Execute {
            command: Command::Seek { time: 12.6 },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "execute");
        assert_eq!(json["action"], "seek");
        assert_eq!(json["time"], 12.6);
    }

    #[test]
    fn every_server_kind_round_trips() {
        let samples = vec![
            ServerMessage::JoinAck {
                room_id: "r1".into(),
                device_id: "d1".into(),
                protocol_version: PROTOCOL_VERSION,
            },
            ServerMessage::Queue { songs: vec![] },
            ServerMessage::NextSong {
                song_id: "s1".into(),
                audio_url: "http://host/a.mp3".into(),
                start_at: 1_700_000_000_000,
            },
            ServerMessage::Preload {
                song_id: "s2".into(),
                audio_url: "http://host/b.mp3".into(),
            },
            ServerMessage::Error {
                message: "bad schema".into(),
            },
            ServerMessage::Pong {
                client_time: 1,
                server_time: 2,
            },
        ];

        for msg in samples {
            let encoded = serde_json::to_string(&msg).unwrap();
            let _decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"type":"teleport","deviceId":"d1"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }
}
