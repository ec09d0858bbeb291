//! Superviseur des playlists : buffer roulant, epochs, heartbeats,
//! réconciliation au démarrage et tâches de fond.

use crate::ctx::{provider_to_exec, PipelineCtx};
use crate::error::Result;
use crate::priority::{compute_priority, PRIORITY_BACKGROUND};
use crate::prompts;
use crate::settings::GenerationSettings;
use crate::worker::SongWorker;
use chrono::Utc;
use itnproviders::{LlmRequest, ProviderRegistry};
use itnqueue::{ConcurrencyLimits, ExecError, Executor, QueueSnapshot};
use itnstore::{PlaylistMode, PlaylistStatus, SongStatus, Store, StoreEvent};
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Singleton du pipeline
static PIPELINE: OnceCell<Pipeline> = OnceCell::new();

/// Superviseur du pipeline de génération.
#[derive(Clone)]
pub struct Pipeline {
    ctx: Arc<PipelineCtx>,
    persona_in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Pipeline {
    /// Construit un pipeline (sans le démarrer)
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ProviderRegistry>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            ctx: PipelineCtx::new(store, registry, settings),
            persona_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Initialise le singleton et démarre les boucles de fond
    pub async fn init(
        store: Arc<Store>,
        registry: Arc<ProviderRegistry>,
        settings: GenerationSettings,
    ) -> &'static Pipeline {
        let pipeline = PIPELINE.get_or_init(|| Self::new(store, registry, settings));
        pipeline.start().await;
        pipeline
    }

    /// Retourne le singleton
    ///
    /// # Panics
    ///
    /// Panique si `init` n'a pas encore été appelé.
    pub fn get() -> &'static Pipeline {
        PIPELINE.get().expect("Pipeline not initialized. Call init() first.")
    }

    pub fn ctx(&self) -> &Arc<PipelineCtx> {
        &self.ctx
    }

    /// Snapshots de diagnostic des trois files
    pub fn queue_snapshots(&self) -> Vec<QueueSnapshot> {
        self.ctx.queues.snapshots()
    }

    /// Démarre : réconciliation de démarrage puis boucles de fond
    pub async fn start(&self) {
        if let Err(e) = self.startup_sweep().await {
            warn!("Startup sweep failed: {}", e);
        }

        // Boucle d'évènements du store
        {
            let pipeline = self.clone();
            let mut rx = self.ctx.store.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(event) => pipeline.handle_event(event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Pipeline event loop lagged by {} events", n);
                            }
                            Err(_) => break,
                        },
                        _ = pipeline.ctx.shutdown.cancelled() => break,
                    }
                }
            });
        }

        // Sweep heartbeat / fermeture
        {
            let pipeline = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(10));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => pipeline.heartbeat_sweep().await,
                        _ = pipeline.ctx.shutdown.cancelled() => break,
                    }
                }
            });
        }

        // Sweep buffer (filet de sécurité, les évènements font le gros du travail)
        {
            let pipeline = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(15));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => pipeline.buffer_sweep().await,
                        _ = pipeline.ctx.shutdown.cancelled() => break,
                    }
                }
            });
        }

        // Rafraîchissement des personas manquants
        {
            let pipeline = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => pipeline.persona_sweep().await,
                        _ = pipeline.ctx.shutdown.cancelled() => break,
                    }
                }
            });
        }

        info!("Generation pipeline started");
    }

    /// Arrêt : annule workers et files
    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        let workers: Vec<_> = self
            .ctx
            .workers
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for token in workers {
            token.cancel();
        }
        self.ctx.queues.stop();
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Démarre un worker pour un morceau (sans effet s'il en existe déjà un)
    pub fn spawn_worker(&self, song_id: &str) {
        let token = {
            let mut workers = self.ctx.workers.lock().unwrap();
            if workers.contains_key(song_id) {
                return;
            }
            let token = self.ctx.shutdown.child_token();
            workers.insert(song_id.to_string(), token.clone());
            token
        };

        let ctx = self.ctx.clone();
        let song_id = song_id.to_string();
        tokio::spawn(async move {
            SongWorker::new(ctx.clone(), song_id.clone(), token).run().await;
            ctx.workers.lock().unwrap().remove(&song_id);
        });
    }

    /// Annule le worker et tous les items de files d'un morceau.
    ///
    /// Idempotent ; la ligne du morceau n'est pas supprimée.
    pub fn cancel_song(&self, song_id: &str) {
        if let Some(token) = self.ctx.workers.lock().unwrap().get(song_id) {
            token.cancel();
        }
        self.ctx.queues.cancel_song(song_id);
    }

    fn cancel_playlist_workers(&self, playlist_id: &str) {
        if let Ok(songs) = self.ctx.store.list_by_playlist(playlist_id) {
            for song in songs {
                self.cancel_song(&song.id);
            }
        }
    }

    // ========================================================================
    // Buffer
    // ========================================================================

    /// Garantit la cible de buffer d'une playlist (sérialisé par playlist)
    pub async fn ensure_buffer(&self, playlist_id: &str) {
        let state = self.ctx.playlist_state(playlist_id);
        let _guard = state.buffer_lock.lock().await;

        let Ok(playlist) = self.ctx.store.get_playlist(playlist_id) else {
            return;
        };
        if playlist.status != PlaylistStatus::Active {
            return;
        }

        let Ok(work_queue) = self
            .ctx
            .store
            .get_work_queue(playlist_id, self.ctx.settings.work_queue_params())
        else {
            return;
        };

        if playlist.mode == PlaylistMode::Oneshot {
            // Au plus un morceau, créé quand la playlist n'en a aucun.
            if work_queue.total_songs == 0 {
                if let Err(e) = self.ctx.store.create_pending(
                    playlist_id,
                    0,
                    playlist.prompt_epoch,
                    false,
                    None,
                ) {
                    warn!(playlist_id = %playlist_id, "Oneshot song creation failed: {}", e);
                }
            }
            return;
        }

        let mut next_index = work_queue.max_order_index + 1;
        for _ in 0..work_queue.buffer_deficit {
            match self.ctx.store.create_pending(
                playlist_id,
                next_index,
                playlist.prompt_epoch,
                false,
                None,
            ) {
                Ok(song) => {
                    debug!(playlist_id = %playlist_id, song_id = %song.id, order_index = next_index, "Buffer refill");
                    next_index += 1;
                }
                Err(e) => {
                    warn!(playlist_id = %playlist_id, "Buffer refill failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn buffer_sweep(&self) {
        let Ok(playlists) = self.ctx.store.list_active() else {
            return;
        };
        for playlist in playlists {
            if playlist.status == PlaylistStatus::Active {
                self.ensure_buffer(&playlist.id).await;
            }
        }
    }

    // ========================================================================
    // Évènements
    // ========================================================================

    async fn handle_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::SongCreated { song_id, .. } => {
                self.spawn_worker(&song_id);
            }
            StoreEvent::SongStatusChanged { song_id, playlist_id, to, .. } => match to {
                SongStatus::RetryPending => self.spawn_worker(&song_id),
                SongStatus::MetadataReady => self.spawn_worker(&song_id),
                SongStatus::Ready => {
                    // Oneshot : un morceau prêt ferme la playlist.
                    if let Ok(playlist) = self.ctx.store.get_playlist(&playlist_id) {
                        if playlist.mode == PlaylistMode::Oneshot {
                            let _ = self
                                .ctx
                                .store
                                .update_playlist_status(&playlist_id, PlaylistStatus::Closing);
                        }
                    }
                }
                SongStatus::Error => self.schedule_auto_retry(&song_id),
                _ => {}
            },
            StoreEvent::PlaylistCreated { playlist_id } => {
                self.ensure_buffer(&playlist_id).await;
            }
            StoreEvent::PlaylistSteered {
                playlist_id,
                new_epoch,
            } => {
                self.handle_steered(&playlist_id, new_epoch).await;
            }
            StoreEvent::PlaylistUpdated { playlist_id } => {
                // Le pointeur de consommation a pu avancer.
                self.ensure_buffer(&playlist_id).await;
            }
            StoreEvent::PlaylistStatusChanged { playlist_id, to, .. } => match to {
                PlaylistStatus::Closed => self.cancel_playlist_workers(&playlist_id),
                PlaylistStatus::Active => self.ensure_buffer(&playlist_id).await,
                PlaylistStatus::Closing => {}
            },
            StoreEvent::PlaylistDeleted { playlist_id } => {
                self.cancel_playlist_workers(&playlist_id);
            }
            StoreEvent::PlaylistHeartbeat { .. } => {}
            StoreEvent::SettingsChanged => {
                #[cfg(feature = "itnconfig")]
                self.refresh_concurrency_from_config();
            }
        }
    }

    /// Pilotage : purge des pending d'epoch périmé, repriorisation, refill.
    async fn handle_steered(&self, playlist_id: &str, new_epoch: i64) {
        info!(playlist_id = %playlist_id, new_epoch, "Playlist steered");

        match self.ctx.store.purge_stale_pending(playlist_id, new_epoch) {
            Ok(purged) => {
                for song_id in &purged {
                    self.cancel_song(song_id);
                }
                if !purged.is_empty() {
                    debug!(playlist_id = %playlist_id, count = purged.len(), "Purged stale pending songs");
                }
            }
            Err(e) => warn!(playlist_id = %playlist_id, "Epoch purge failed: {}", e),
        }

        if let (Ok(playlist), Ok(songs)) = (
            self.ctx.store.get_playlist(playlist_id),
            self.ctx.store.list_by_playlist(playlist_id),
        ) {
            for song in songs.iter().filter(|s| s.status.is_transient()) {
                self.ctx
                    .queues
                    .update_pending_priority(&song.id, compute_priority(song, &playlist));
            }
            self.ctx.queues.resort_pending();
        }

        self.ensure_buffer(playlist_id).await;
    }

    /// Auto-retry borné des morceaux en erreur
    fn schedule_auto_retry(&self, song_id: &str) {
        let Ok(song) = self.ctx.store.get_song(song_id) else {
            return;
        };
        if song.retry_count >= self.ctx.settings.auto_retry_limit {
            debug!(song_id = %song_id, retries = song.retry_count, "Auto-retry attempts exhausted");
            return;
        }

        let pipeline = self.clone();
        let song_id = song_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = pipeline.ctx.shutdown.cancelled() => return,
            }
            match pipeline.ctx.store.retry_errored(&song_id) {
                Ok(true) => debug!(song_id = %song_id, "Auto-retry scheduled"),
                Ok(false) => {}
                Err(e) => warn!(song_id = %song_id, "Auto-retry failed: {}", e),
            }
        });
    }

    // ========================================================================
    // Sweeps périodiques
    // ========================================================================

    /// Heartbeats et cycle de vie active → closing → closed.
    ///
    /// Tourne toutes les 10 s ; appelable directement pour forcer un
    /// passage.
    pub async fn heartbeat_sweep(&self) {
        let Ok(playlists) = self.ctx.store.list_active() else {
            return;
        };
        let timeout = chrono::Duration::seconds(self.ctx.settings.heartbeat_timeout_secs);
        let now = Utc::now();

        for playlist in playlists {
            match playlist.status {
                PlaylistStatus::Active => {
                    if now.signed_duration_since(playlist.last_seen_at) > timeout {
                        info!(playlist_id = %playlist.id, "Heartbeat stale, closing playlist");
                        let _ = self
                            .ctx
                            .store
                            .update_playlist_status(&playlist.id, PlaylistStatus::Closing);
                    }
                }
                PlaylistStatus::Closing => {
                    let Ok(work_queue) = self
                        .ctx
                        .store
                        .get_work_queue(&playlist.id, self.ctx.settings.work_queue_params())
                    else {
                        continue;
                    };
                    if work_queue.transient_count == 0 {
                        info!(playlist_id = %playlist.id, "Closing playlist drained, closing down");
                        let _ = self
                            .ctx
                            .store
                            .update_playlist_status(&playlist.id, PlaylistStatus::Closed);
                    }
                }
                PlaylistStatus::Closed => {}
            }
        }
    }

    /// Extraction de persona pour les morceaux ready qui n'en ont pas
    async fn persona_sweep(&self) {
        let Ok(songs) = self.ctx.store.get_needs_persona(4) else {
            return;
        };

        for song in songs {
            {
                let mut in_flight = self.persona_in_flight.lock().unwrap();
                if !in_flight.insert(song.id.clone()) {
                    continue;
                }
            }

            let pipeline = self.clone();
            tokio::spawn(async move {
                let song_id = song.id.clone();
                let ctx = pipeline.ctx.clone();
                let provider_name = ctx
                    .registry
                    .default_llm()
                    .map(|p| p.name().to_string())
                    .unwrap_or_else(|_| "llm".to_string());

                let exec_ctx = ctx.clone();
                let exec_song = song.clone();
                let executor: Executor<Value> = Box::new(move |token| {
                    Box::pin(async move {
                        let llm = exec_ctx
                            .registry
                            .default_llm()
                            .map_err(|e| ExecError::fatal(e.to_string()))?;
                        let request = LlmRequest {
                            system: prompts::persona_system(),
                            user: prompts::persona_user(&exec_song),
                            schema: None,
                        };
                        let response = llm
                            .complete(request, token)
                            .await
                            .map_err(provider_to_exec)?;
                        Ok(Value::String(response.text))
                    })
                });

                let result = ctx
                    .queues
                    .llm
                    .enqueue(song_id.clone(), PRIORITY_BACKGROUND, provider_name, executor)
                    .await;

                if let Ok(response) = result {
                    if let Ok(Value::String(extract)) =
                        response.result.map_err(|e| debug!(song_id = %song_id, "Persona failed: {}", e))
                    {
                        let _ = ctx.store.update_persona_extract(&song_id, extract.trim());
                    }
                }

                pipeline.persona_in_flight.lock().unwrap().remove(&song_id);
            });
        }
    }

    // ========================================================================
    // Réconciliation au démarrage
    // ========================================================================

    /// Balayage de démarrage : batch-poll du provider audio, purge des
    /// morceaux bloqués, relance des workers actionnables.
    pub async fn startup_sweep(&self) -> Result<()> {
        let in_pipeline = self.ctx.store.get_in_audio_pipeline()?;

        if !in_pipeline.is_empty() {
            info!(count = in_pipeline.len(), "Reconciling songs in audio pipeline");
            let task_ids: Vec<String> = in_pipeline
                .iter()
                .filter_map(|s| s.ace_task_id.clone())
                .collect();

            let results = match self.ctx.registry.default_audio() {
                Ok(provider) => provider.batch_poll(&task_ids).await.unwrap_or_default(),
                Err(_) => Default::default(),
            };

            let grace = chrono::Duration::from_std(self.ctx.settings.not_found_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));

            for song in &in_pipeline {
                let Some(task_id) = &song.ace_task_id else {
                    // Jamais soumis : on repart d'avant la soumission.
                    let _ = self
                        .ctx
                        .store
                        .revert_transient(&song.id, SongStatus::MetadataReady);
                    continue;
                };

                match results.get(task_id).map(|r| &r.status) {
                    Some(itnproviders::AudioTaskState::Failed) => {
                        let message = results
                            .get(task_id)
                            .and_then(|r| r.error.clone())
                            .unwrap_or_else(|| "audio task failed".to_string());
                        let _ = self.ctx.store.mark_error(&song.id, &message);
                    }
                    Some(itnproviders::AudioTaskState::NotFound) => {
                        // La grâce ne s'applique qu'aux soumissions récentes.
                        let old_enough = song
                            .ace_submitted_at
                            .map(|at| Utc::now().signed_duration_since(at) >= grace)
                            .unwrap_or(true);
                        if old_enough {
                            let _ = self
                                .ctx
                                .store
                                .revert_transient(&song.id, SongStatus::MetadataReady);
                        }
                        // Sinon : le worker reprend le polling, grâce comprise.
                    }
                    // Succeeded/Running/None : le worker reprend le polling et
                    // sauvegarde si la tâche a abouti. Aucune double soumission.
                    _ => {}
                }
            }
        }

        // Purge des morceaux bloqués et relance des workers
        let playlists = self.ctx.store.list_active()?;
        for playlist in playlists {
            let work_queue = self
                .ctx
                .store
                .get_work_queue(&playlist.id, self.ctx.settings.work_queue_params())?;

            for stale in &work_queue.stale_songs {
                warn!(song_id = %stale.id, status = %stale.status, "Removing stale song");
                self.cancel_song(&stale.id);
                let _ = self.ctx.store.delete_song(&stale.id);
            }

            for song in self.ctx.store.list_by_playlist(&playlist.id)? {
                if song.status.is_transient() {
                    self.spawn_worker(&song.id);
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Réglages en ligne
    // ========================================================================

    /// Réapplique les limites de concurrence depuis la configuration
    #[cfg(feature = "itnconfig")]
    pub fn refresh_concurrency_from_config(&self) {
        let config = itnconfig::get_config();
        let limits = ConcurrencyLimits {
            llm: config.get_u64_or(&["providers", "llm", "concurrency"], 1) as usize,
            image: config.get_u64_or(&["providers", "image", "concurrency"], 1) as usize,
        };
        info!(llm = limits.llm, image = limits.image, "Refreshing provider concurrency");
        self.ctx.queues.refresh_concurrency(limits);
    }
}
