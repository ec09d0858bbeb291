//! File requête-réponse (LLM et image).
//!
//! Une liste pending triée par (priorité, ordre d'arrivée) et un ensemble
//! actif borné par la limite de concurrence du provider. Quand un slot se
//! libère, le prochain pending est promu sous le mutex du dispatcher.

use crate::error::{ExecError, ExecutorResult, QueueError};
use crate::{Executor, QueueSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Réponse d'un enqueue : résultat de l'executor + temps de traitement.
#[derive(Debug)]
pub struct EnqueueResponse<T> {
    pub result: ExecutorResult<T>,
    pub processing_ms: u64,
}

struct PendingItem<T> {
    seq: u64,
    song_id: String,
    priority: i64,
    endpoint: String,
    token: CancellationToken,
    executor: Executor<T>,
    tx: oneshot::Sender<EnqueueResponse<T>>,
}

struct ActiveItem {
    song_id: String,
    token: CancellationToken,
}

struct State<T> {
    pending: Vec<PendingItem<T>>,
    active: HashMap<u64, ActiveItem>,
    concurrency: usize,
    last_error: Option<String>,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    seq: AtomicU64,
    error_count: AtomicU64,
    stopped: AtomicBool,
}

/// File requête-réponse à concurrence bornée
pub struct RequestQueue<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Crée une file avec une limite de concurrence initiale
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    pending: Vec::new(),
                    active: HashMap::new(),
                    concurrency: concurrency.max(1),
                    last_error: None,
                }),
                seq: AtomicU64::new(1),
                error_count: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Soumet un executor et attend son résultat.
    ///
    /// Échoue avec [`QueueError::Stopped`] si la file est arrêtée. La
    /// cancellation (par `cancel_song` ou arrêt de la file) se matérialise
    /// en `Ok(response)` portant `Err(ExecError::Cancelled)`.
    pub async fn enqueue(
        &self,
        song_id: impl Into<String>,
        priority: i64,
        endpoint: impl Into<String>,
        executor: Executor<T>,
    ) -> Result<EnqueueResponse<T>, QueueError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let item = PendingItem {
            seq,
            song_id: song_id.into(),
            priority,
            endpoint: endpoint.into(),
            token: CancellationToken::new(),
            executor,
            tx,
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.push(item);
            sort_pending(&mut state.pending);
        }
        self.pump();

        rx.await.map_err(|_| QueueError::Stopped)
    }

    /// Annule tous les items (pending et actifs) d'un morceau.
    ///
    /// Idempotent : inconnue ou déjà annulée, l'opération est sans effet.
    pub fn cancel_song(&self, song_id: &str) {
        let cancelled_pending = {
            let mut state = self.inner.state.lock().unwrap();

            let mut removed = Vec::new();
            let mut kept = Vec::new();
            for item in state.pending.drain(..) {
                if item.song_id == song_id {
                    removed.push(item);
                } else {
                    kept.push(item);
                }
            }
            state.pending = kept;

            for active in state.active.values() {
                if active.song_id == song_id {
                    active.token.cancel();
                }
            }
            removed
        };

        for item in cancelled_pending {
            let _ = item.tx.send(EnqueueResponse {
                result: Err(ExecError::Cancelled),
                processing_ms: 0,
            });
        }
    }

    /// Change la priorité des items pending d'un morceau (l'ordre
    /// d'arrivée reste le départage à priorité égale).
    pub fn update_pending_priority(&self, song_id: &str, new_priority: i64) {
        let mut state = self.inner.state.lock().unwrap();
        for item in state.pending.iter_mut() {
            if item.song_id == song_id {
                item.priority = new_priority;
            }
        }
        sort_pending(&mut state.pending);
    }

    /// Retrie la liste pending (après une mise à jour en masse)
    pub fn resort_pending(&self) {
        let mut state = self.inner.state.lock().unwrap();
        sort_pending(&mut state.pending);
    }

    /// Change la limite de concurrence sans perdre de travail.
    ///
    /// Une baisse n'interrompt pas les executors actifs ; elle ne fait
    /// que retarder les promotions suivantes.
    pub fn refresh_concurrency(&self, limit: usize) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.concurrency = limit.max(1);
        }
        self.pump();
    }

    /// Arrête la file : tout le travail pending est résolu annulé, les
    /// executors actifs reçoivent leur cancellation.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        let drained = {
            let mut state = self.inner.state.lock().unwrap();
            for active in state.active.values() {
                active.token.cancel();
            }
            state.pending.drain(..).collect::<Vec<_>>()
        };

        for item in drained {
            let _ = item.tx.send(EnqueueResponse {
                result: Err(ExecError::Cancelled),
                processing_ms: 0,
            });
        }
    }

    /// Snapshot de diagnostic
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock().unwrap();
        QueueSnapshot {
            name: self.inner.name.clone(),
            pending: state.pending.len(),
            active: state.active.len(),
            concurrency: state.concurrency,
            error_count: self.inner.error_count.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
        }
    }

    /// Promeut des items pending tant que des slots sont libres
    fn pump(&self) {
        loop {
            // La décision cancelled/actif se prend sous le mutex : une
            // cancellation arrivée après l'insertion passera par le token.
            let (item, promoted) = {
                let mut state = self.inner.state.lock().unwrap();
                if state.active.len() >= state.concurrency || state.pending.is_empty() {
                    return;
                }
                let item = state.pending.remove(0);
                let promoted = !item.token.is_cancelled();
                if promoted {
                    state.active.insert(
                        item.seq,
                        ActiveItem {
                            song_id: item.song_id.clone(),
                            token: item.token.clone(),
                        },
                    );
                }
                (item, promoted)
            };

            if !promoted {
                let _ = item.tx.send(EnqueueResponse {
                    result: Err(ExecError::Cancelled),
                    processing_ms: 0,
                });
                continue;
            }

            debug!(
                queue = %self.inner.name,
                song_id = %item.song_id,
                endpoint = %item.endpoint,
                "Promoting queue item"
            );

            let inner = self.inner.clone();
            let queue = self.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let token = item.token.clone();
                let fut = (item.executor)(token.clone());

                let result = tokio::select! {
                    r = fut => r,
                    _ = token.cancelled() => Err(ExecError::Cancelled),
                };

                if let Err(err) = &result {
                    if !matches!(err, ExecError::Cancelled) {
                        inner.error_count.fetch_add(1, Ordering::Relaxed);
                        let mut state = inner.state.lock().unwrap();
                        state.last_error = Some(err.to_string());
                    }
                }

                {
                    let mut state = inner.state.lock().unwrap();
                    state.active.remove(&item.seq);
                }

                let _ = item.tx.send(EnqueueResponse {
                    result,
                    processing_ms: started.elapsed().as_millis() as u64,
                });

                queue.pump();
            });
        }
    }
}

/// Tri stable : priorité croissante, puis ordre d'arrivée (seq)
fn sort_pending<T>(pending: &mut [PendingItem<T>]) {
    pending.sort_by_key(|item| (item.priority, item.seq));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn executor_returning(
        value: u32,
        delay: Duration,
        running: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    ) -> Executor<u32> {
        Box::new(move |_token| {
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(value)
            })
        })
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let queue = RequestQueue::new("llm", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6u32 {
            let queue = queue.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        format!("song-{}", i),
                        10,
                        "provider",
                        executor_returning(i, Duration::from_millis(30), running, max_seen),
                    )
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().result.is_ok());
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn priority_orders_pending_fifo_on_ties() {
        // Concurrence 1 : le premier item occupe le slot pendant que les
        // suivants s'accumulent, puis sortent par (priorité, arrivée).
        let queue = RequestQueue::new("llm", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        "song-block",
                        0,
                        "provider",
                        Box::new(|_t| {
                            Box::pin(async {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok(0u32)
                            })
                        }),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut handles = Vec::new();
        for (song, priority) in [("a", 5), ("b", 1), ("c", 5), ("d", 1)] {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        song,
                        priority,
                        "provider",
                        Box::new(move |_t| {
                            Box::pin(async move {
                                order.lock().unwrap().push(song.to_string());
                                Ok(0u32)
                            })
                        }),
                    )
                    .await
                    .unwrap();
            }));
            // Laisser l'ordre d'arrivée se fixer
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn cancel_song_cancels_pending_and_active() {
        let queue = RequestQueue::new("image", 1);

        let active = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        "song-1",
                        0,
                        "provider",
                        Box::new(|token: CancellationToken| {
                            Box::pin(async move {
                                token.cancelled().await;
                                Err::<u32, _>(ExecError::Cancelled)
                            })
                        }),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        "song-1",
                        0,
                        "provider",
                        Box::new(|_t| Box::pin(async { Ok(1u32) })),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.cancel_song("song-1");

        let active = active.await.unwrap().unwrap();
        assert!(matches!(active.result, Err(ExecError::Cancelled)));
        let pending = pending.await.unwrap().unwrap();
        assert!(matches!(pending.result, Err(ExecError::Cancelled)));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test]
    async fn stopped_queue_refuses_enqueue() {
        let queue: RequestQueue<u32> = RequestQueue::new("llm", 1);
        queue.stop();

        let result = queue
            .enqueue(
                "song-1",
                0,
                "provider",
                Box::new(|_t| Box::pin(async { Ok(1u32) })),
            )
            .await;
        assert!(matches!(result, Err(QueueError::Stopped)));
    }

    #[tokio::test]
    async fn update_pending_priority_reorders() {
        let queue = RequestQueue::new("llm", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        "song-block",
                        0,
                        "provider",
                        Box::new(|_t| {
                            Box::pin(async {
                                tokio::time::sleep(Duration::from_millis(40)).await;
                                Ok(0u32)
                            })
                        }),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut handles = Vec::new();
        for song in ["a", "b"] {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        song,
                        10,
                        "provider",
                        Box::new(move |_t| {
                            Box::pin(async move {
                                order.lock().unwrap().push(song.to_string());
                                Ok(0u32)
                            })
                        }),
                    )
                    .await
                    .unwrap();
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        queue.update_pending_priority("b", 1);

        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(order.lock().unwrap().clone(), vec!["b", "a"]);
    }
}
