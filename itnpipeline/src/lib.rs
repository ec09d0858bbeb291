//! # itnpipeline - Pipeline de génération
//!
//! Le cœur génératif d'Infinitune :
//!
//! - [`worker::SongWorker`] : un worker par morceau, machine à états
//!   pending → metadata → audio → saving → ready, claims compare-and-set,
//!   récupération après redémarrage
//! - [`supervisor::Pipeline`] : buffer roulant par playlist, discipline
//!   d'epoch (purge au pilotage), heartbeats et cycle de vie
//!   active → closing → closed, réconciliation au démarrage, extraction
//!   de persona en tâche de fond
//! - [`priority`] : calcul des priorités des trois files d'endpoints
//! - API REST + SSE de pilotage (feature `itnserver`)

pub mod ctx;
pub mod error;
pub mod priority;
pub mod prompts;
pub mod save;
pub mod settings;
pub mod supervisor;
pub mod worker;

pub mod testing;

#[cfg(feature = "itnserver")]
pub mod api;
#[cfg(feature = "itnserver")]
pub mod openapi;
#[cfg(feature = "itnserver")]
pub mod server_ext;
#[cfg(feature = "itnserver")]
pub mod sse;

pub use ctx::PipelineCtx;
pub use error::{Error, Result};
pub use priority::compute_priority;
pub use settings::GenerationSettings;
pub use supervisor::Pipeline;
pub use worker::SongWorker;

#[cfg(feature = "itnserver")]
pub use server_ext::GenerationExt;
