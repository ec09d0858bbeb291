//! RoomManager : registre singleton des rooms du processus.

use crate::room::{spawn_room, RoomHandle, RoomMsg, RoomTuning};
use itnstore::{Store, StoreEvent};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Singleton RoomManager
static ROOM_MANAGER: OnceCell<RoomManager> = OnceCell::new();

/// Registre des rooms (une instance par `roomId` dans le processus)
pub struct RoomManager {
    store: Arc<Store>,
    tuning: RoomTuning,
    rooms: RwLock<HashMap<String, RoomHandle>>,
}

impl RoomManager {
    fn new(store: Arc<Store>, tuning: RoomTuning) -> Self {
        Self {
            store,
            tuning,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Initialise le singleton et démarre le relais d'évènements du store
    pub fn init(store: Arc<Store>, tuning: RoomTuning) -> &'static RoomManager {
        let manager = ROOM_MANAGER.get_or_init(|| Self::new(store.clone(), tuning));

        // Relais : les changements de file côté génération rafraîchissent
        // les rooms concernées.
        let mut rx = store.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let relevant = matches!(
                    event,
                    StoreEvent::SongStatusChanged { .. }
                        | StoreEvent::PlaylistUpdated { .. }
                        | StoreEvent::PlaylistDeleted { .. }
                        | StoreEvent::PlaylistCreated { .. }
                );
                if relevant {
                    RoomManager::get().refresh_all_queues();
                }
            }
        });

        manager
    }

    /// Retourne le singleton
    ///
    /// # Panics
    ///
    /// Panique si `init` n'a pas encore été appelé.
    pub fn get() -> &'static RoomManager {
        ROOM_MANAGER
            .get()
            .expect("RoomManager not initialized. Call init() first.")
    }

    /// Récupère une room, en la créant depuis sa `playlistKey` si absente
    pub fn get_or_create(&self, room_id: &str, playlist_key: &str) -> RoomHandle {
        {
            let rooms = self.rooms.read().unwrap();
            if let Some(handle) = rooms.get(room_id) {
                return handle.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!(room_id = %room_id, playlist_key = %playlist_key, "Creating room");
                spawn_room(
                    room_id.to_string(),
                    playlist_key.to_string(),
                    self.store.clone(),
                    self.tuning,
                )
            })
            .clone()
    }

    /// Récupère une room existante
    pub fn get_room(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.read().unwrap().get(room_id).cloned()
    }

    /// Liste les identifiants de rooms vivantes
    pub fn list_rooms(&self) -> Vec<String> {
        self.rooms.read().unwrap().keys().cloned().collect()
    }

    /// Détruit une room (seul chemin de destruction : le delete explicite)
    pub fn delete_room(&self, room_id: &str) {
        let handle = self.rooms.write().unwrap().remove(room_id);
        if let Some(handle) = handle {
            info!(room_id = %room_id, "Deleting room");
            let _ = handle.try_send(RoomMsg::Shutdown);
        }
    }

    fn refresh_all_queues(&self) {
        let rooms = self.rooms.read().unwrap();
        for handle in rooms.values() {
            let _ = handle.try_send(RoomMsg::RefreshQueue);
        }
    }
}
