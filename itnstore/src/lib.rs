//! # itnstore - Service de données de génération
//!
//! Cette crate est la source de vérité du pipeline de génération :
//! morceaux, playlists, claims compare-and-set sur les statuts et
//! évènements de transition.
//!
//! - Les entités et leurs invariants sont définis dans [`model`]
//! - La persistance SQLite (écrivain unique derrière un mutex) est dans
//!   [`db`]
//! - Chaque transition publie un [`StoreEvent`] sur un canal broadcast
//!
//! # Exemple
//!
//! ```no_run
//! use itnstore::{Store, NewPlaylist, PlaylistMode};
//!
//! # fn main() -> itnstore::Result<()> {
//! let store = Store::open_in_memory()?;
//! let playlist = store.create_playlist(NewPlaylist {
//!     playlist_key: "kitchen".into(),
//!     name: "Kitchen Mix".into(),
//!     mode: PlaylistMode::Endless,
//!     prompt: "mellow electro".into(),
//! })?;
//!
//! let song = store.create_pending(&playlist.id, 0, 0, false, None)?;
//! assert!(store.claim_metadata(&song.id)?);
//! assert!(!store.claim_metadata(&song.id)?); // claim déjà pris
//! # Ok(())
//! # }
//! ```

mod db;
mod error;
mod events;
mod model;

pub use db::{NewPlaylist, Store, WorkQueueParams};
pub use error::{Error, Result};
pub use events::StoreEvent;
pub use model::{
    ManagerPlan, ManagerSlot, Playlist, PlaylistMode, PlaylistStatus, RecentDescription, Song,
    SongMetadata, SongStatus, UserRating, WorkQueue,
};

use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;

/// Singleton du store (un par processus serveur)
static STORE: OnceCell<Arc<Store>> = OnceCell::new();

/// Initialise le store global depuis un chemin de base
///
/// Idempotent : les appels suivants retournent l'instance existante.
pub fn init_store(db_path: &Path) -> Result<Arc<Store>> {
    if let Some(store) = STORE.get() {
        return Ok(store.clone());
    }
    let store = Arc::new(Store::open(db_path)?);
    Ok(STORE.get_or_init(|| store).clone())
}

/// Initialise le store global depuis la configuration
#[cfg(feature = "itnconfig")]
pub fn init_store_from_config() -> Result<Arc<Store>> {
    use std::path::PathBuf;

    let config = itnconfig::get_config();
    let dir = config
        .get_managed_dir(&["generation", "data_dir"], "data")
        .map_err(Error::Other)?;
    let db_file = config.get_string_or(&["generation", "db_file"], "infinitune.db");
    init_store(&PathBuf::from(dir).join(db_file))
}

/// Retourne le store global
///
/// # Panics
///
/// Panique si `init_store` n'a pas encore été appelé.
pub fn get_store() -> Arc<Store> {
    STORE
        .get()
        .cloned()
        .expect("Store not initialized. Call init_store() first.")
}
