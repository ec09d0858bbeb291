//! Worker par morceau : pilote la machine à états de génération.
//!
//! Un worker par morceau, beaucoup peuvent vivre en parallèle. Chaque
//! transition avant est gardée par un claim compare-and-set ; un worker
//! qui perd son claim sort proprement. Un worker démarré sur un statut
//! non initial (processus relancé en cours de route) récupère depuis cet
//! état.

use crate::ctx::{provider_to_exec, PipelineCtx};
use crate::error::{Error, Result};
use crate::priority::compute_priority;
use crate::prompts;
use crate::save::{fetch_audio, write_tags, CachedCover};
use chrono::Utc;
use itnproviders::{LlmRequest, ProviderError};
use itnqueue::{AudioOutcome, AudioSubmission, AudioTaskStatus, ExecError, Executor};
use itnstore::{Song, SongStatus};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker d'un morceau.
pub struct SongWorker {
    ctx: Arc<PipelineCtx>,
    song_id: String,
    token: CancellationToken,
    /// Pochette mise en cache pour l'embarquer dans le fichier audio.
    cover: Arc<Mutex<Option<CachedCover>>>,
}

impl SongWorker {
    pub fn new(ctx: Arc<PipelineCtx>, song_id: String, token: CancellationToken) -> Self {
        Self {
            ctx,
            song_id,
            token,
            cover: Arc::new(Mutex::new(None)),
        }
    }

    /// Point d'entrée : pilote le morceau jusqu'à un état stable.
    pub async fn run(self) {
        let song_id = self.song_id.clone();
        match self.drive().await {
            Ok(()) => {}
            Err(Error::Cancelled(_)) => {
                debug!(song_id = %song_id, "Worker cancelled");
            }
            Err(Error::ClaimLost(_)) => {
                debug!(song_id = %song_id, "Claim lost, worker exits");
            }
            Err(Error::Store(itnstore::Error::SongNotFound(_))) => {
                // Morceau purgé (changement d'epoch) : sortie propre.
                debug!(song_id = %song_id, "Song deleted, worker exits");
            }
            Err(e) => {
                warn!(song_id = %song_id, "Worker failed: {}", e);
                // Seuls les états terminaux d'erreur sont persistés.
                if let Ok(store_song) = self.ctx.store.get_song(&song_id) {
                    if store_song.status.is_transient() {
                        let _ = self.ctx.store.mark_error(&song_id, &e.to_string());
                    }
                }
            }
        }
    }

    async fn drive(&self) -> Result<()> {
        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled(self.song_id.clone()));
            }

            let song = self.ctx.store.get_song(&self.song_id)?;
            match song.status {
                SongStatus::Pending => self.generate_metadata(song).await?,
                SongStatus::MetadataReady => {
                    if self.generate_audio(song).await? {
                        return Ok(());
                    }
                }
                SongStatus::GeneratingAudio => match song.ace_task_id.clone() {
                    Some(task_id) => {
                        if self.resume_audio(song, task_id).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        self.ctx
                            .store
                            .revert_transient(&self.song_id, SongStatus::MetadataReady)?;
                    }
                },
                // Récupération après redémarrage en plein milieu
                SongStatus::GeneratingMetadata => {
                    self.ctx
                        .store
                        .revert_transient(&self.song_id, SongStatus::Pending)?;
                }
                SongStatus::SubmittingToAce => {
                    self.ctx
                        .store
                        .revert_transient(&self.song_id, SongStatus::MetadataReady)?;
                }
                SongStatus::Saving => match song.ace_task_id {
                    Some(_) => {
                        self.ctx
                            .store
                            .update_status(&self.song_id, SongStatus::GeneratingAudio)?;
                    }
                    None => {
                        self.ctx
                            .store
                            .revert_transient(&self.song_id, SongStatus::MetadataReady)?;
                    }
                },
                SongStatus::RetryPending => {
                    self.ctx
                        .store
                        .revert_transient(&self.song_id, SongStatus::Pending)?;
                }
                SongStatus::Ready | SongStatus::Played | SongStatus::Error => return Ok(()),
            }
        }
    }

    // ========================================================================
    // Étape 1 : métadonnées
    // ========================================================================

    async fn generate_metadata(&self, song: Song) -> Result<()> {
        if !self.ctx.store.claim_metadata(&self.song_id)? {
            return Err(Error::ClaimLost(self.song_id.clone()));
        }

        let playlist = self.ctx.store.get_playlist(&song.playlist_id)?;
        let priority = compute_priority(&song, &playlist);
        let provider_name = self
            .ctx
            .registry
            .default_llm()
            .map(|p| p.name().to_string())
            .unwrap_or_else(|_| "llm".to_string());

        let ctx = self.ctx.clone();
        let exec_song = song.clone();
        let executor: Executor<Value> = Box::new(move |token| {
            Box::pin(async move { metadata_executor(ctx, exec_song, token).await })
        });

        let response = self
            .ctx
            .queues
            .llm
            .enqueue(self.song_id.clone(), priority, provider_name, executor)
            .await?;

        match response.result {
            Ok(value) => {
                let metadata = prompts::parse_metadata(&value);
                self.ctx.store.complete_metadata(&self.song_id, &metadata)?;
                info!(
                    song_id = %self.song_id,
                    title = metadata.title.as_deref().unwrap_or("?"),
                    processing_ms = response.processing_ms,
                    "Metadata ready"
                );
                // Pochette best-effort, jamais bloquante pour le morceau.
                self.spawn_cover(priority);
                Ok(())
            }
            Err(ExecError::Cancelled) => Err(Error::Cancelled(self.song_id.clone())),
            Err(e) => {
                self.ctx.store.mark_error(&self.song_id, &e.to_string())?;
                Ok(())
            }
        }
    }

    /// Génération de pochette, lancée et oubliée depuis metadata_ready.
    fn spawn_cover(&self, priority: i64) {
        let ctx = self.ctx.clone();
        let song_id = self.song_id.clone();
        let cover_cache = self.cover.clone();

        tokio::spawn(async move {
            let Ok(song) = ctx.store.get_song(&song_id) else {
                return;
            };
            let prompt = format!(
                "Album cover for \"{}\" by {}. {}",
                song.metadata.title.as_deref().unwrap_or("untitled"),
                song.metadata.artist.as_deref().unwrap_or("unknown artist"),
                song.metadata.mood.as_deref().unwrap_or(""),
            );
            let provider_name = ctx
                .registry
                .default_image()
                .map(|p| p.name().to_string())
                .unwrap_or_else(|_| "image".to_string());

            let exec_ctx = ctx.clone();
            let executor: Executor<itnproviders::ImageOutput> = Box::new(move |token| {
                Box::pin(async move {
                    let image = exec_ctx
                        .registry
                        .default_image()
                        .map_err(|e| ExecError::fatal(e.to_string()))?;
                    image.generate(&prompt, token).await.map_err(provider_to_exec)
                })
            });

            let enqueued = ctx
                .queues
                .image
                .enqueue(song_id.clone(), priority, provider_name, executor)
                .await;

            match enqueued {
                Ok(response) => match response.result {
                    Ok(output) => {
                        let file_name = format!("{}.cover.{}", song_id, output.format);
                        let path = ctx.settings.storage_dir.join(&file_name);
                        if let Err(e) = tokio::fs::create_dir_all(&ctx.settings.storage_dir).await
                        {
                            debug!(song_id = %song_id, "Cover dir creation failed: {}", e);
                            return;
                        }
                        if let Err(e) = tokio::fs::write(&path, &output.bytes).await {
                            debug!(song_id = %song_id, "Cover write failed: {}", e);
                            return;
                        }
                        let url = ctx.cover_url(&song_id);
                        let _ = ctx.store.update_cover(&song_id, &url);
                        *cover_cache.lock().unwrap() = Some(CachedCover {
                            bytes: output.bytes,
                            format: output.format,
                        });
                        debug!(song_id = %song_id, "Cover ready");
                    }
                    Err(e) => debug!(song_id = %song_id, "Cover generation failed: {}", e),
                },
                Err(e) => debug!(song_id = %song_id, "Cover enqueue failed: {}", e),
            }
        });
    }

    // ========================================================================
    // Étapes 2-4 : audio
    // ========================================================================

    /// Soumission audio. Retourne `true` quand le morceau a atteint un
    /// état stable (ready/error), `false` pour reboucler.
    async fn generate_audio(&self, song: Song) -> Result<bool> {
        if !self.ctx.store.claim_audio(&self.song_id)? {
            return Err(Error::ClaimLost(self.song_id.clone()));
        }

        let playlist = self.ctx.store.get_playlist(&song.playlist_id)?;
        let priority = compute_priority(&song, &playlist);

        let ctx = self.ctx.clone();
        let exec_song = song.clone();
        let executor: Executor<AudioSubmission> = Box::new(move |token| {
            Box::pin(async move {
                let audio = ctx
                    .registry
                    .default_audio()
                    .map_err(|e| ExecError::fatal(e.to_string()))?;
                let response = audio
                    .submit(prompts::audio_payload(&exec_song), token)
                    .await
                    .map_err(provider_to_exec)?;
                ctx.store
                    .update_ace_task(&exec_song.id, &response.task_id, Utc::now())
                    .map_err(|e| ExecError::fatal(e.to_string()))?;
                Ok(AudioSubmission {
                    task_id: response.task_id,
                })
            })
        });

        let response = self
            .ctx
            .queues
            .audio
            .enqueue(self.song_id.clone(), priority, executor)
            .await?;
        self.handle_audio_outcome(response.result).await
    }

    /// Reprise de polling sur un task_id connu (récupération).
    async fn resume_audio(&self, song: Song, task_id: String) -> Result<bool> {
        let submitted_at = song.ace_submitted_at.unwrap_or_else(Utc::now);
        let response = self
            .ctx
            .queues
            .audio
            .resume_poll(self.song_id.clone(), task_id, submitted_at)
            .await?;
        self.handle_audio_outcome(response.result).await
    }

    async fn handle_audio_outcome(
        &self,
        result: itnqueue::ExecutorResult<AudioOutcome>,
    ) -> Result<bool> {
        match result {
            Ok(outcome) => match outcome.status {
                AudioTaskStatus::Succeeded => {
                    self.save_song(outcome).await?;
                    Ok(true)
                }
                AudioTaskStatus::Failed => {
                    let message = outcome
                        .error
                        .unwrap_or_else(|| "audio generation failed".to_string());
                    self.ctx.store.mark_error(&self.song_id, &message)?;
                    Ok(true)
                }
                AudioTaskStatus::NotFound => {
                    // Tâche perdue côté provider : on repart de metadata_ready.
                    warn!(song_id = %self.song_id, "Audio task lost, reverting to metadata_ready");
                    self.ctx
                        .store
                        .revert_transient(&self.song_id, SongStatus::MetadataReady)?;
                    Ok(false)
                }
            },
            Err(ExecError::Cancelled) => Err(Error::Cancelled(self.song_id.clone())),
            Err(e) => {
                self.ctx.store.mark_error(&self.song_id, &e.to_string())?;
                Ok(true)
            }
        }
    }

    // ========================================================================
    // Étape 5 : sauvegarde
    // ========================================================================

    async fn save_song(&self, outcome: AudioOutcome) -> Result<()> {
        self.ctx
            .store
            .update_status(&self.song_id, SongStatus::Saving)?;

        let source = outcome
            .audio_path
            .ok_or_else(|| Error::Save("audio task succeeded without audio path".to_string()))?;

        let dest = fetch_audio(
            &self.ctx.http,
            &source,
            &self.ctx.settings.storage_dir,
            &self.song_id,
        )
        .await?;

        let song = self.ctx.store.get_song(&self.song_id)?;
        let playlist = self.ctx.store.get_playlist(&song.playlist_id)?;
        let cover = self.cover.lock().unwrap().clone();

        let album = playlist.name.clone();
        let tag_path = dest.clone();
        let tag_song = song.clone();
        let saved = tokio::task::spawn_blocking(move || {
            write_tags(&tag_path, &tag_song, &album, cover.as_ref())
        })
        .await
        .map_err(|e| Error::Save(format!("tagging task panicked: {}", e)))??;

        let audio_url = self.ctx.audio_url(&self.song_id);
        self.ctx.store.update_storage_path(
            &self.song_id,
            &saved.path.to_string_lossy(),
            &audio_url,
        )?;
        if let Some(duration) = saved.duration_secs {
            self.ctx
                .store
                .update_audio_duration(&self.song_id, duration)?;
        }

        self.ctx.store.mark_ready(&self.song_id)?;
        self.ctx.store.increment_generated(&song.playlist_id)?;
        info!(song_id = %self.song_id, title = song.metadata.title.as_deref().unwrap_or("?"), "Song ready");
        Ok(())
    }
}

/// Executor de métadonnées : brief de gestion, appel LLM, dédoublonnage.
async fn metadata_executor(
    ctx: Arc<PipelineCtx>,
    song: Song,
    token: CancellationToken,
) -> itnqueue::ExecutorResult<Value> {
    let fatal = |e: itnstore::Error| ExecError::fatal(e.to_string());

    let llm = ctx
        .registry
        .default_llm()
        .map_err(|e| ExecError::fatal(e.to_string()))?;
    let mut playlist = ctx.store.get_playlist(&song.playlist_id).map_err(fatal)?;

    // Rafraîchissement du brief quand la fenêtre du plan est épuisée ou
    // que l'epoch a bougé. Best-effort : un échec n'empêche pas le morceau.
    let needs_brief = !song.is_interrupt
        && (playlist.manager_epoch != playlist.prompt_epoch
            || playlist
                .manager_plan
                .as_ref()
                .is_none_or(|plan| !plan.covers(song.order_index)));
    if needs_brief {
        let request = LlmRequest {
            system: prompts::brief_system(),
            user: prompts::brief_user(&playlist, song.order_index),
            schema: Some(prompts::brief_schema()),
        };
        match llm.complete(request, token.clone()).await {
            Ok(response) => {
                if let Some(value) = response.json {
                    if let Some((brief, plan)) = prompts::parse_brief(&value, song.order_index) {
                        ctx.store
                            .update_manager_brief(&playlist.id, &brief, &plan, playlist.prompt_epoch)
                            .map_err(fatal)?;
                        playlist = ctx.store.get_playlist(&playlist.id).map_err(fatal)?;
                    }
                }
            }
            Err(ProviderError::Cancelled) => return Err(ExecError::Cancelled),
            Err(e) => debug!(playlist_id = %playlist.id, "Manager brief refresh failed: {}", e),
        }
    }

    let slot = playlist
        .manager_plan
        .as_ref()
        .and_then(|plan| plan.slot_for(song.order_index))
        .cloned();
    let work_queue = ctx
        .store
        .get_work_queue(&song.playlist_id, ctx.settings.work_queue_params())
        .map_err(fatal)?;

    let mut retried = false;
    loop {
        let request = LlmRequest {
            system: prompts::metadata_system(),
            user: prompts::metadata_user(
                &playlist,
                &song,
                slot.as_ref(),
                &work_queue.recent_descriptions,
            ),
            schema: Some(prompts::metadata_schema()),
        };
        let response = llm
            .complete(request, token.clone())
            .await
            .map_err(provider_to_exec)?;
        let value = response
            .json
            .ok_or_else(|| ExecError::fatal("LLM returned no JSON object"))?;

        let metadata = prompts::parse_metadata(&value);
        let duplicate = match (&metadata.title, &metadata.artist) {
            (Some(title), Some(artist)) => work_queue.recent_descriptions.iter().any(|d| {
                d.title.eq_ignore_ascii_case(title) && d.artist.eq_ignore_ascii_case(artist)
            }),
            _ => false,
        };

        if duplicate && !retried {
            debug!(song_id = %song.id, "Duplicate title/artist, retrying LLM once");
            retried = true;
            continue;
        }
        // Toujours dupliqué après un retry : on accepte et on enregistre.
        return Ok(value);
    }
}
