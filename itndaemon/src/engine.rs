//! Contrat du moteur audio et pilotage du décodeur externe.
//!
//! Le moteur est une boîte noire : le décodeur audio est un processus
//! externe piloté par un protocole ligne sur stdin/stdout. Les tests
//! utilisent [`FakeEngine`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Instantané du moteur.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub song_id: Option<String>,
    pub is_playing: bool,
    pub current_time: f64,
    pub volume: f64,
    pub is_muted: bool,
}

/// Contrat du moteur audio.
#[async_trait]
pub trait AudioEngine: Send + Sync {
    /// Charge un morceau, prêt à démarrer à `start_at_local_ms` (temps
    /// local epoch ms) si fourni, à la position `time_offset` (secondes).
    async fn load_song(
        &self,
        song_id: &str,
        url: &str,
        start_at_local_ms: Option<i64>,
        time_offset: f64,
    ) -> Result<()>;

    /// Préchauffe l'audio d'un futur morceau
    async fn preload(&self, song_id: &str, url: &str) -> Result<()>;

    async fn play(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn toggle(&self) -> Result<()>;
    async fn seek(&self, time: f64) -> Result<()>;
    async fn set_volume(&self, volume: f64) -> Result<()>;
    async fn toggle_mute(&self) -> Result<()>;

    /// Instantané de l'état courant (lecture lock-free pour `status`)
    fn snapshot(&self) -> EngineSnapshot;

    /// Flux des fins de morceaux (song_id)
    fn subscribe_ended(&self) -> broadcast::Receiver<String>;

    /// Arrête la lecture (hard = vide aussi le morceau chargé)
    async fn stop(&self, hard: bool) -> Result<()>;

    /// Libère le moteur (tue le décodeur)
    async fn destroy(&self) -> Result<()>;
}

// ============================================================================
// Moteur réel : décodeur externe
// ============================================================================

struct DecoderState {
    snapshot: EngineSnapshot,
}

/// Moteur pilotant le processus décodeur externe.
///
/// Protocole descendant (une commande par ligne) :
/// `load <song_id> <start_at_ms|-> <offset> <url>`, `preload <song_id> <url>`,
/// `play`, `pause`, `seek <secs>`, `volume <0..1>`, `mute <0|1>`,
/// `stop <hard|soft>`, `quit`.
///
/// Protocole montant : `position <song_id> <secs>`, `ended <song_id>`.
pub struct DecoderEngine {
    state: Arc<Mutex<DecoderState>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    ended_tx: broadcast::Sender<String>,
    child: Mutex<Option<Child>>,
}

impl DecoderEngine {
    /// Démarre le décodeur configuré
    pub fn spawn(decoder_cmd: &str) -> Result<Arc<Self>> {
        let mut parts = decoder_cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Engine("empty decoder command".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("cannot spawn decoder '{}': {}", program, e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("decoder has no stdout".to_string()))?;

        let engine = Arc::new(Self {
            state: Arc::new(Mutex::new(DecoderState {
                snapshot: EngineSnapshot {
                    volume: 1.0,
                    ..EngineSnapshot::default()
                },
            })),
            stdin: tokio::sync::Mutex::new(stdin),
            ended_tx: broadcast::channel(16).0,
            child: Mutex::new(Some(child)),
        });

        // Lecteur des évènements du décodeur
        {
            let state = engine.state.clone();
            let ended_tx = engine.ended_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut parts = line.split_whitespace();
                    match parts.next() {
                        Some("position") => {
                            let song_id = parts.next().map(String::from);
                            let secs = parts.next().and_then(|s| s.parse::<f64>().ok());
                            if let (Some(song_id), Some(secs)) = (song_id, secs) {
                                let mut state = state.lock().unwrap();
                                state.snapshot.song_id = Some(song_id);
                                state.snapshot.current_time = secs;
                            }
                        }
                        Some("ended") => {
                            if let Some(song_id) = parts.next() {
                                debug!(song_id = %song_id, "Decoder reports song ended");
                                {
                                    let mut state = state.lock().unwrap();
                                    state.snapshot.is_playing = false;
                                }
                                let _ = ended_tx.send(song_id.to_string());
                            }
                        }
                        Some(other) => {
                            debug!("Unknown decoder event: {}", other);
                        }
                        None => {}
                    }
                }
                warn!("Decoder stdout closed");
            });
        }

        info!(decoder = %decoder_cmd, "Decoder engine started");
        Ok(engine)
    }

    async fn send(&self, line: String) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(Error::Engine("decoder stdin is gone".to_string()));
        };
        stdin
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| Error::Engine(format!("decoder write failed: {}", e)))
    }
}

#[async_trait]
impl AudioEngine for DecoderEngine {
    async fn load_song(
        &self,
        song_id: &str,
        url: &str,
        start_at_local_ms: Option<i64>,
        time_offset: f64,
    ) -> Result<()> {
        let start = start_at_local_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        self.send(format!("load {} {} {} {}", song_id, start, time_offset, url))
            .await?;

        let mut state = self.state.lock().unwrap();
        state.snapshot.song_id = Some(song_id.to_string());
        state.snapshot.current_time = time_offset;
        state.snapshot.is_playing = true;
        Ok(())
    }

    async fn preload(&self, song_id: &str, url: &str) -> Result<()> {
        self.send(format!("preload {} {}", song_id, url)).await
    }

    async fn play(&self) -> Result<()> {
        self.send("play".to_string()).await?;
        self.state.lock().unwrap().snapshot.is_playing = true;
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.send("pause".to_string()).await?;
        self.state.lock().unwrap().snapshot.is_playing = false;
        Ok(())
    }

    async fn toggle(&self) -> Result<()> {
        let playing = self.snapshot().is_playing;
        if playing {
            self.pause().await
        } else {
            self.play().await
        }
    }

    async fn seek(&self, time: f64) -> Result<()> {
        self.send(format!("seek {}", time.max(0.0))).await?;
        self.state.lock().unwrap().snapshot.current_time = time.max(0.0);
        Ok(())
    }

    async fn set_volume(&self, volume: f64) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        self.send(format!("volume {}", volume)).await?;
        self.state.lock().unwrap().snapshot.volume = volume;
        Ok(())
    }

    async fn toggle_mute(&self) -> Result<()> {
        let muted = {
            let mut state = self.state.lock().unwrap();
            state.snapshot.is_muted = !state.snapshot.is_muted;
            state.snapshot.is_muted
        };
        self.send(format!("mute {}", if muted { 1 } else { 0 })).await
    }

    fn snapshot(&self) -> EngineSnapshot {
        self.state.lock().unwrap().snapshot.clone()
    }

    fn subscribe_ended(&self) -> broadcast::Receiver<String> {
        self.ended_tx.subscribe()
    }

    async fn stop(&self, hard: bool) -> Result<()> {
        self.send(format!("stop {}", if hard { "hard" } else { "soft" }))
            .await?;
        let mut state = self.state.lock().unwrap();
        state.snapshot.is_playing = false;
        if hard {
            state.snapshot.song_id = None;
            state.snapshot.current_time = 0.0;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let _ = self.send("quit".to_string()).await;
        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
        Ok(())
    }
}

// ============================================================================
// Moteur factice (tests)
// ============================================================================

/// Moteur en mémoire pour les tests : aucune sortie audio.
pub struct FakeEngine {
    state: Mutex<EngineSnapshot>,
    preloaded: Mutex<Vec<String>>,
    ended_tx: broadcast::Sender<String>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineSnapshot {
                volume: 1.0,
                ..EngineSnapshot::default()
            }),
            preloaded: Mutex::new(Vec::new()),
            ended_tx: broadcast::channel(16).0,
        })
    }

    /// Simule la fin naturelle du morceau courant
    pub fn finish_current(&self) {
        let song_id = {
            let mut state = self.state.lock().unwrap();
            state.is_playing = false;
            state.song_id.clone()
        };
        if let Some(song_id) = song_id {
            let _ = self.ended_tx.send(song_id);
        }
    }

    /// Morceaux préchargés (pour les assertions)
    pub fn preloaded(&self) -> Vec<String> {
        self.preloaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioEngine for FakeEngine {
    async fn load_song(
        &self,
        song_id: &str,
        _url: &str,
        _start_at_local_ms: Option<i64>,
        time_offset: f64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.song_id = Some(song_id.to_string());
        state.current_time = time_offset;
        state.is_playing = true;
        Ok(())
    }

    async fn preload(&self, song_id: &str, _url: &str) -> Result<()> {
        self.preloaded.lock().unwrap().push(song_id.to_string());
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        self.state.lock().unwrap().is_playing = true;
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.state.lock().unwrap().is_playing = false;
        Ok(())
    }

    async fn toggle(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.is_playing = !state.is_playing;
        Ok(())
    }

    async fn seek(&self, time: f64) -> Result<()> {
        self.state.lock().unwrap().current_time = time.max(0.0);
        Ok(())
    }

    async fn set_volume(&self, volume: f64) -> Result<()> {
        self.state.lock().unwrap().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    async fn toggle_mute(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.is_muted = !state.is_muted;
        Ok(())
    }

    fn snapshot(&self) -> EngineSnapshot {
        self.state.lock().unwrap().clone()
    }

    fn subscribe_ended(&self) -> broadcast::Receiver<String> {
        self.ended_tx.subscribe()
    }

    async fn stop(&self, hard: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.is_playing = false;
        if hard {
            state.song_id = None;
            state.current_time = 0.0;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_engine_tracks_state() {
        let engine = FakeEngine::new();
        engine
            .load_song("song-1", "http://host/a.mp3", None, 3.5)
            .await
            .unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.song_id.as_deref(), Some("song-1"));
        assert!(snapshot.is_playing);
        assert!((snapshot.current_time - 3.5).abs() < f64::EPSILON);

        engine.set_volume(1.4).await.unwrap();
        assert!((engine.snapshot().volume - 1.0).abs() < f64::EPSILON);

        let mut ended = engine.subscribe_ended();
        engine.finish_current();
        assert_eq!(ended.recv().await.unwrap(), "song-1");
    }
}
