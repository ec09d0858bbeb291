//! # itnroom - Runtime de rooms de lecture synchronisée
//!
//! Une room est l'autorité de lecture d'un groupe de devices :
//!
//! - [`protocol`] : messages JSON taggés du canal full-duplex
//! - [`room`] : acteur mono-écrivain (roster, commandes, avancement de
//!   file, `startAt` monotone, correction de dérive)
//! - [`manager`] : registre singleton des rooms, auto-création au join
//! - [`clock`] : estimation d'offset d'horloge côté client
//! - [`ws`] : couche socket axum (`/ws/room`)

pub mod clock;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod room;
pub mod ws;

#[cfg(feature = "itnserver")]
pub mod api;
#[cfg(feature = "itnserver")]
pub mod openapi;
#[cfg(feature = "itnserver")]
pub mod server_ext;

pub use clock::ClockSync;
pub use error::{Error, Result};
pub use manager::RoomManager;
pub use protocol::{
    ClientMessage, Command, DeviceMode, DeviceRole, DeviceSnapshot, PlaybackState, ServerMessage,
    SongSnapshot, PROTOCOL_VERSION,
};
pub use room::{DeviceInfo, RoomHandle, RoomMsg, RoomTuning};

#[cfg(feature = "itnserver")]
pub use server_ext::RoomsExt;
