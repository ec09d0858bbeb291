//! Persistance SQLite du service de données (une base pour tout le serveur).

use crate::events::StoreEvent;
use crate::model::{
    ManagerPlan, Playlist, PlaylistMode, PlaylistStatus, RecentDescription, Song, SongMetadata,
    SongStatus, UserRating, WorkQueue,
};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Paramètres de calcul de l'agrégat de travail.
#[derive(Debug, Clone, Copy)]
pub struct WorkQueueParams {
    /// Nombre de morceaux à venir visés par playlist.
    pub buffer_target: i64,
    /// Taille de la fenêtre de dédoublonnage (morceaux ready récents).
    pub dedup_window: i64,
    /// Âge au-delà duquel un morceau transitoire est considéré bloqué.
    pub stale_after_secs: i64,
}

impl Default for WorkQueueParams {
    fn default() -> Self {
        Self {
            buffer_target: 3,
            dedup_window: 12,
            stale_after_secs: 900,
        }
    }
}

/// Requête de création de playlist.
#[derive(Debug, Clone)]
pub struct NewPlaylist {
    pub playlist_key: String,
    pub name: String,
    pub mode: PlaylistMode,
    pub prompt: String,
}

/// Service de données central (morceaux + playlists + évènements)
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl Store {
    /// Ouvre (ou crée) la base et installe le schéma
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::PersistenceError(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::PersistenceError(format!("Failed to open database: {}", e)))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            event_tx: broadcast::channel(256).0,
        })
    }

    /// Variante en mémoire, utilisée par les tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            event_tx: broadcast::channel(256).0,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS playlists (
                id TEXT PRIMARY KEY,
                playlist_key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                prompt TEXT NOT NULL,
                prompt_epoch INTEGER NOT NULL DEFAULT 0,
                current_order_index INTEGER NOT NULL DEFAULT -1,
                last_seen_at INTEGER NOT NULL,
                manager_brief TEXT,
                manager_plan TEXT,
                manager_epoch INTEGER NOT NULL DEFAULT 0,
                generated_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS songs (
                id TEXT PRIMARY KEY,
                playlist_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                prompt_epoch INTEGER NOT NULL,
                is_interrupt INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                prompt TEXT,
                ace_task_id TEXT,
                ace_submitted_at INTEGER,
                title TEXT,
                artist TEXT,
                lyrics TEXT,
                caption TEXT,
                bpm REAL,
                key_scale TEXT,
                time_signature TEXT,
                audio_duration REAL,
                mood TEXT,
                energy TEXT,
                audio_url TEXT,
                storage_path TEXT,
                cover_url TEXT,
                user_rating TEXT,
                persona_extract TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (playlist_id, order_index),
                FOREIGN KEY (playlist_id) REFERENCES playlists(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_songs_playlist ON songs(playlist_id, order_index);
            CREATE INDEX IF NOT EXISTS idx_songs_status ON songs(status);
            ",
        )
        .map_err(|e| Error::PersistenceError(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Souscrit aux évènements du store
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // Ignoré si aucun abonné
        let _ = self.event_tx.send(event);
    }

    /// Publie `settings.changed` (appelé par l'API de configuration)
    pub fn emit_settings_changed(&self) {
        self.emit(StoreEvent::SettingsChanged);
    }

    // ========================================================================
    // Playlists
    // ========================================================================

    /// Crée une playlist active
    pub fn create_playlist(&self, req: NewPlaylist) -> Result<Playlist> {
        let id = format!("pl-{}", uuid::Uuid::new_v4());
        let now = Utc::now().timestamp_millis();

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO playlists (id, playlist_key, name, mode, status, prompt, last_seen_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6)",
                params![id, req.playlist_key, req.name, req.mode.as_str(), req.prompt, now],
            )?;
        }

        self.emit(StoreEvent::PlaylistCreated {
            playlist_id: id.clone(),
        });
        self.get_playlist(&id)
    }

    /// Récupère une playlist par id
    pub fn get_playlist(&self, id: &str) -> Result<Playlist> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM playlists WHERE id = ?1",
            PLAYLIST_COLUMNS
        ))?;
        stmt.query_row(params![id], playlist_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::PlaylistNotFound(id.to_string()),
                other => other.into(),
            })
    }

    /// Récupère une playlist par sa clé externe
    pub fn get_playlist_by_key(&self, key: &str) -> Result<Option<Playlist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM playlists WHERE playlist_key = ?1",
            PLAYLIST_COLUMNS
        ))?;
        match stmt.query_row(params![key], playlist_from_row) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Liste les playlists non fermées (active + closing)
    pub fn list_active(&self) -> Result<Vec<Playlist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM playlists WHERE status != 'closed' ORDER BY created_at",
            PLAYLIST_COLUMNS
        ))?;
        let rows = stmt.query_map([], playlist_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Liste toutes les playlists
    pub fn list_playlists(&self) -> Result<Vec<Playlist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM playlists ORDER BY created_at",
            PLAYLIST_COLUMNS
        ))?;
        let rows = stmt.query_map([], playlist_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Change le statut d'une playlist
    pub fn update_playlist_status(&self, id: &str, status: PlaylistStatus) -> Result<()> {
        let previous = self.get_playlist(id)?.status;
        if previous == status {
            return Ok(());
        }

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE playlists SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
        }

        self.emit(StoreEvent::PlaylistStatusChanged {
            playlist_id: id.to_string(),
            from: previous,
            to: status,
        });
        Ok(())
    }

    /// Met à jour le brief de gestion pour un epoch donné
    pub fn update_manager_brief(
        &self,
        id: &str,
        brief: &str,
        plan: &ManagerPlan,
        epoch: i64,
    ) -> Result<()> {
        let plan_json = serde_json::to_string(plan)
            .map_err(|e| Error::PersistenceError(format!("Failed to encode plan: {}", e)))?;

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE playlists SET manager_brief = ?2, manager_plan = ?3, manager_epoch = ?4
                 WHERE id = ?1",
                params![id, brief, plan_json, epoch],
            )?;
        }

        self.emit(StoreEvent::PlaylistUpdated {
            playlist_id: id.to_string(),
        });
        Ok(())
    }

    /// Incrémente le compteur de morceaux générés
    pub fn increment_generated(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE playlists SET generated_count = generated_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Pilote la playlist : nouveau prompt, epoch incrémenté atomiquement.
    ///
    /// Retourne le nouvel epoch.
    pub fn steer(&self, id: &str, prompt: &str) -> Result<i64> {
        let new_epoch = {
            let conn = self.conn.lock().unwrap();
            let changed = conn.execute(
                "UPDATE playlists SET prompt = ?2, prompt_epoch = prompt_epoch + 1
                 WHERE id = ?1 AND status != 'closed'",
                params![id, prompt],
            )?;
            if changed == 0 {
                return Err(Error::PlaylistNotFound(id.to_string()));
            }
            conn.query_row(
                "SELECT prompt_epoch FROM playlists WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )?
        };

        self.emit(StoreEvent::PlaylistSteered {
            playlist_id: id.to_string(),
            new_epoch,
        });
        Ok(new_epoch)
    }

    /// Enregistre un heartbeat : remet le timer d'inactivité à zéro.
    ///
    /// Une playlist en `closing` qui reçoit un heartbeat redevient
    /// `active` (un consommateur s'est manifesté avant la fermeture).
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let playlist = self.get_playlist(id)?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE playlists SET last_seen_at = ?2 WHERE id = ?1",
                params![id, Utc::now().timestamp_millis()],
            )?;
        }

        if playlist.status == PlaylistStatus::Closing {
            self.update_playlist_status(id, PlaylistStatus::Active)?;
        }

        self.emit(StoreEvent::PlaylistHeartbeat {
            playlist_id: id.to_string(),
        });
        Ok(())
    }

    /// Avance le pointeur de consommation
    pub fn set_current_order_index(&self, id: &str, order_index: i64) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE playlists SET current_order_index = ?2 WHERE id = ?1",
                params![id, order_index],
            )?;
        }
        self.emit(StoreEvent::PlaylistUpdated {
            playlist_id: id.to_string(),
        });
        Ok(())
    }

    /// Supprime une playlist et tous ses morceaux
    pub fn delete_playlist(&self, id: &str) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM songs WHERE playlist_id = ?1", params![id])?;
            conn.execute("DELETE FROM playlists WHERE id = ?1", params![id])?;
        }
        self.emit(StoreEvent::PlaylistDeleted {
            playlist_id: id.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Morceaux
    // ========================================================================

    /// Crée un morceau `pending`
    ///
    /// Refusé quand la playlist n'admet plus de création (closing/closed).
    pub fn create_pending(
        &self,
        playlist_id: &str,
        order_index: i64,
        prompt_epoch: i64,
        is_interrupt: bool,
        prompt: Option<&str>,
    ) -> Result<Song> {
        let playlist = self.get_playlist(playlist_id)?;
        match playlist.status {
            PlaylistStatus::Active => {}
            PlaylistStatus::Closing => {
                return Err(Error::PlaylistClosing(playlist_id.to_string()))
            }
            PlaylistStatus::Closed => return Err(Error::PlaylistClosed(playlist_id.to_string())),
        }

        let id = format!("song-{}", uuid::Uuid::new_v4());
        let now = Utc::now().timestamp_millis();

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO songs (id, playlist_id, order_index, prompt_epoch, is_interrupt,
                                    status, prompt, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)",
                params![
                    id,
                    playlist_id,
                    order_index,
                    prompt_epoch,
                    is_interrupt as i64,
                    prompt,
                    now
                ],
            )?;
        }

        self.emit(StoreEvent::SongCreated {
            song_id: id.clone(),
            playlist_id: playlist_id.to_string(),
        });
        self.get_song(&id)
    }

    /// Récupère un morceau par id
    pub fn get_song(&self, id: &str) -> Result<Song> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM songs WHERE id = ?1", SONG_COLUMNS))?;
        stmt.query_row(params![id], song_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::SongNotFound(id.to_string()),
                other => other.into(),
            })
    }

    /// Récupère plusieurs morceaux par id (les absents sont ignorés)
    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Song>> {
        let mut songs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_song(id) {
                Ok(song) => songs.push(song),
                Err(Error::SongNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(songs)
    }

    /// Liste les morceaux d'une playlist, par order_index croissant
    pub fn list_by_playlist(&self, playlist_id: &str) -> Result<Vec<Song>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM songs WHERE playlist_id = ?1 ORDER BY order_index",
            SONG_COLUMNS
        ))?;
        let rows = stmt.query_map(params![playlist_id], song_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Prochain morceau `ready` après un order_index donné
    pub fn next_ready_after(&self, playlist_id: &str, order_index: i64) -> Result<Option<Song>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM songs
             WHERE playlist_id = ?1 AND order_index > ?2 AND status = 'ready'
             ORDER BY order_index LIMIT 1",
            SONG_COLUMNS
        ))?;
        match stmt.query_row(params![playlist_id, order_index], song_from_row) {
            Ok(song) => Ok(Some(song)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// File d'attente consommable d'une playlist (morceaux ready après le pointeur)
    pub fn ready_queue(&self, playlist_id: &str) -> Result<Vec<Song>> {
        let playlist = self.get_playlist(playlist_id)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM songs
             WHERE playlist_id = ?1 AND order_index > ?2 AND status = 'ready'
             ORDER BY order_index",
            SONG_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![playlist_id, playlist.current_order_index],
            song_from_row,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Calcule l'agrégat de travail d'une playlist en une passe
    pub fn get_work_queue(&self, playlist_id: &str, params: WorkQueueParams) -> Result<WorkQueue> {
        let playlist = self.get_playlist(playlist_id)?;
        let songs = self.list_by_playlist(playlist_id)?;

        let mut wq = WorkQueue {
            current_epoch: playlist.prompt_epoch,
            max_order_index: -1,
            ..WorkQueue::default()
        };

        let stale_cutoff = Utc::now() - chrono::Duration::seconds(params.stale_after_secs);

        for song in &songs {
            wq.total_songs += 1;
            wq.max_order_index = wq.max_order_index.max(song.order_index);

            if song.status.is_transient() {
                wq.transient_count += 1;
                if song.updated_at < stale_cutoff {
                    wq.stale_songs.push(song.clone());
                }
            }

            match song.status {
                SongStatus::Pending => wq.pending.push(song.clone()),
                SongStatus::MetadataReady => wq.metadata_ready.push(song.clone()),
                SongStatus::GeneratingAudio => wq.generating_audio.push(song.clone()),
                SongStatus::RetryPending => wq.retry_pending.push(song.clone()),
                _ => {}
            }

            if song.status.needs_recovery() {
                wq.needs_recovery.push(song.clone());
            }

            // Couverture best-effort : ready sans pochette
            if song.status == SongStatus::Ready && song.cover_url.is_none() {
                wq.needs_cover.push(song.clone());
            }
        }

        // Fenêtre de dédoublonnage : les N derniers ready par order_index
        let mut ready: Vec<&Song> = songs
            .iter()
            .filter(|s| matches!(s.status, SongStatus::Ready | SongStatus::Played))
            .collect();
        ready.sort_by_key(|s| std::cmp::Reverse(s.order_index));
        for song in ready.iter().take(params.dedup_window as usize) {
            wq.recent_completed.push((*song).clone());
            if let (Some(title), Some(artist)) = (&song.metadata.title, &song.metadata.artist) {
                wq.recent_descriptions.push(RecentDescription {
                    title: title.clone(),
                    artist: artist.clone(),
                });
            }
        }

        // Déficit de buffer : morceaux à venir non-error vs cible
        let upcoming = songs
            .iter()
            .filter(|s| {
                s.order_index > playlist.current_order_index && s.status != SongStatus::Error
            })
            .count() as i64;
        wq.buffer_deficit = (params.buffer_target - upcoming).max(0);

        Ok(wq)
    }

    /// Supprime un morceau
    pub fn delete_song(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM songs WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Purge les morceaux `pending` d'un epoch périmé (jamais les interrupts).
    ///
    /// Retourne les ids supprimés.
    pub fn purge_stale_pending(&self, playlist_id: &str, new_epoch: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM songs
             WHERE playlist_id = ?1 AND status = 'pending'
               AND prompt_epoch < ?2 AND is_interrupt = 0",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![playlist_id, new_epoch], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for id in &ids {
            conn.execute("DELETE FROM songs WHERE id = ?1", params![id])?;
        }
        Ok(ids)
    }

    /// Compare-and-set : pending → generating_metadata.
    ///
    /// Retourne `false` si le claim a déjà été pris par un autre worker.
    pub fn claim_metadata(&self, id: &str) -> Result<bool> {
        self.claim(id, SongStatus::Pending, SongStatus::GeneratingMetadata)
    }

    /// Compare-and-set : metadata_ready → submitting_to_ace.
    pub fn claim_audio(&self, id: &str) -> Result<bool> {
        self.claim(id, SongStatus::MetadataReady, SongStatus::SubmittingToAce)
    }

    fn claim(&self, id: &str, from: SongStatus, to: SongStatus) -> Result<bool> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE songs SET status = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = ?2",
                params![
                    id,
                    from.as_str(),
                    to.as_str(),
                    Utc::now().timestamp_millis()
                ],
            )?
        };

        if changed == 1 {
            if let Ok(song) = self.get_song(id) {
                self.emit(StoreEvent::SongStatusChanged {
                    song_id: id.to_string(),
                    playlist_id: song.playlist_id,
                    from,
                    to,
                });
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Persiste les métadonnées et passe le morceau en metadata_ready
    pub fn complete_metadata(&self, id: &str, metadata: &SongMetadata) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE songs SET title = ?2, artist = ?3, lyrics = ?4, caption = ?5,
                                  bpm = ?6, key_scale = ?7, time_signature = ?8,
                                  audio_duration = ?9, mood = ?10, energy = ?11,
                                  updated_at = ?12
                 WHERE id = ?1",
                params![
                    id,
                    metadata.title,
                    metadata.artist,
                    metadata.lyrics,
                    metadata.caption,
                    metadata.bpm,
                    metadata.key_scale,
                    metadata.time_signature,
                    metadata.audio_duration,
                    metadata.mood,
                    metadata.energy,
                    Utc::now().timestamp_millis()
                ],
            )?;
        }
        self.update_status(id, SongStatus::MetadataReady)
    }

    /// Renseigne l'URL de pochette
    pub fn update_cover(&self, id: &str, cover_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE songs SET cover_url = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, cover_url, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Persiste la tâche audio externe et passe en generating_audio
    pub fn update_ace_task(
        &self,
        id: &str,
        task_id: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE songs SET ace_task_id = ?2, ace_submitted_at = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    id,
                    task_id,
                    submitted_at.timestamp_millis(),
                    Utc::now().timestamp_millis()
                ],
            )?;
        }
        self.update_status(id, SongStatus::GeneratingAudio)
    }

    /// Persiste le chemin de stockage local et l'URL de lecture
    pub fn update_storage_path(&self, id: &str, storage_path: &str, audio_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE songs SET storage_path = ?2, audio_url = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, storage_path, audio_url, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Met à jour la durée audio (après trim éventuel du silence)
    pub fn update_audio_duration(&self, id: &str, duration_secs: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE songs SET audio_duration = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, duration_secs, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Passe le morceau en ready (audio_url doit être renseignée)
    pub fn mark_ready(&self, id: &str) -> Result<()> {
        let song = self.get_song(id)?;
        if song.audio_url.is_none() {
            return Err(Error::PersistenceError(format!(
                "Song {} cannot be ready without audio_url",
                id
            )));
        }
        self.update_status(id, SongStatus::Ready)
    }

    /// Passe le morceau en error avec un message
    pub fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE songs SET error_message = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, message, Utc::now().timestamp_millis()],
            )?;
        }
        self.update_status(id, SongStatus::Error)
    }

    /// Relance un morceau en erreur (action utilisateur ou auto-retry borné)
    pub fn retry_errored(&self, id: &str) -> Result<bool> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE songs SET status = 'retry_pending', retry_count = retry_count + 1,
                                  error_message = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'error'",
                params![id, Utc::now().timestamp_millis()],
            )?
        };

        if changed == 1 {
            if let Ok(song) = self.get_song(id) {
                self.emit(StoreEvent::SongStatusChanged {
                    song_id: id.to_string(),
                    playlist_id: song.playlist_id,
                    from: SongStatus::Error,
                    to: SongStatus::RetryPending,
                });
            }
        }
        Ok(changed == 1)
    }

    /// Ramène un morceau transitoire à un état antérieur (récupération).
    ///
    /// La tâche audio est oubliée dès qu'on repasse avant la soumission.
    pub fn revert_transient(&self, id: &str, to: SongStatus) -> Result<()> {
        if matches!(to, SongStatus::Pending | SongStatus::MetadataReady) {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE songs SET ace_task_id = NULL, ace_submitted_at = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![id, Utc::now().timestamp_millis()],
            )?;
        }
        self.update_status(id, to)
    }

    /// Transition générique de statut (émet l'évènement)
    pub fn update_status(&self, id: &str, status: SongStatus) -> Result<()> {
        let previous = self.get_song(id)?;
        if previous.status == status {
            return Ok(());
        }

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE songs SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), Utc::now().timestamp_millis()],
            )?;
        }

        self.emit(StoreEvent::SongStatusChanged {
            song_id: id.to_string(),
            playlist_id: previous.playlist_id,
            from: previous.status,
            to: status,
        });
        Ok(())
    }

    /// Marque un morceau consommé (posé par la room)
    pub fn mark_played(&self, id: &str) -> Result<()> {
        self.update_status(id, SongStatus::Played)
    }

    /// Morceaux engagés dans le pipeline audio, toutes playlists confondues
    pub fn get_in_audio_pipeline(&self) -> Result<Vec<Song>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM songs
             WHERE status IN ('submitting_to_ace', 'generating_audio', 'saving')
             ORDER BY updated_at",
            SONG_COLUMNS
        ))?;
        let rows = stmt.query_map([], song_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Morceaux ready sans extrait de persona
    pub fn get_needs_persona(&self, limit: i64) -> Result<Vec<Song>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM songs
             WHERE status = 'ready' AND persona_extract IS NULL
             ORDER BY updated_at LIMIT ?1",
            SONG_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit], song_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Renseigne l'extrait de persona d'un morceau
    pub fn update_persona_extract(&self, id: &str, extract: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE songs SET persona_extract = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, extract, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Vote utilisateur sur un morceau
    pub fn set_user_rating(&self, id: &str, rating: Option<UserRating>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE songs SET user_rating = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id,
                rating.map(|r| r.as_str()),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }
}

const PLAYLIST_COLUMNS: &str = "id, playlist_key, name, mode, status, prompt, prompt_epoch, \
     current_order_index, last_seen_at, manager_brief, manager_plan, manager_epoch, \
     generated_count, created_at";

const SONG_COLUMNS: &str = "id, playlist_id, order_index, prompt_epoch, is_interrupt, status, \
     prompt, ace_task_id, ace_submitted_at, title, artist, lyrics, caption, bpm, key_scale, \
     time_signature, audio_duration, mood, energy, audio_url, storage_path, cover_url, \
     user_rating, persona_extract, error_message, retry_count, created_at, updated_at";

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn playlist_from_row(row: &Row<'_>) -> rusqlite::Result<Playlist> {
    let mode: String = row.get(3)?;
    let status: String = row.get(4)?;
    let manager_plan: Option<String> = row.get(10)?;

    Ok(Playlist {
        id: row.get(0)?,
        playlist_key: row.get(1)?,
        name: row.get(2)?,
        mode: PlaylistMode::from_str(&mode).unwrap_or(PlaylistMode::Endless),
        status: parse_playlist_status(&status),
        prompt: row.get(5)?,
        prompt_epoch: row.get(6)?,
        current_order_index: row.get(7)?,
        last_seen_at: millis_to_datetime(row.get(8)?),
        manager_brief: row.get(9)?,
        manager_plan: manager_plan.and_then(|json| serde_json::from_str(&json).ok()),
        manager_epoch: row.get(11)?,
        generated_count: row.get(12)?,
        created_at: millis_to_datetime(row.get(13)?),
    })
}

fn song_from_row(row: &Row<'_>) -> rusqlite::Result<Song> {
    let status: String = row.get(5)?;
    let ace_submitted_at: Option<i64> = row.get(8)?;
    let rating: Option<String> = row.get(22)?;

    Ok(Song {
        id: row.get(0)?,
        playlist_id: row.get(1)?,
        order_index: row.get(2)?,
        prompt_epoch: row.get(3)?,
        is_interrupt: row.get::<_, i64>(4)? != 0,
        status: parse_song_status(&status),
        prompt: row.get(6)?,
        ace_task_id: row.get(7)?,
        ace_submitted_at: ace_submitted_at.map(millis_to_datetime),
        metadata: SongMetadata {
            title: row.get(9)?,
            artist: row.get(10)?,
            lyrics: row.get(11)?,
            caption: row.get(12)?,
            bpm: row.get(13)?,
            key_scale: row.get(14)?,
            time_signature: row.get(15)?,
            audio_duration: row.get(16)?,
            mood: row.get(17)?,
            energy: row.get(18)?,
        },
        audio_url: row.get(19)?,
        storage_path: row.get(20)?,
        cover_url: row.get(21)?,
        user_rating: rating.and_then(|r| UserRating::from_str(&r).ok()),
        persona_extract: row.get(23)?,
        error_message: row.get(24)?,
        retry_count: row.get(25)?,
        created_at: millis_to_datetime(row.get(26)?),
        updated_at: millis_to_datetime(row.get(27)?),
    })
}

fn parse_song_status(s: &str) -> SongStatus {
    SongStatus::from_str(s).unwrap_or_else(|_| {
        tracing::warn!("Unknown song status '{}' in database, mapping to error", s);
        SongStatus::Error
    })
}

fn parse_playlist_status(s: &str) -> PlaylistStatus {
    PlaylistStatus::from_str(s).unwrap_or_else(|_| {
        tracing::warn!("Unknown playlist status '{}' in database, mapping to closed", s);
        PlaylistStatus::Closed
    })
}
