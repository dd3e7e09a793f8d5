//! TripSync real-time core.
//!
//! Pure Rust crate with no UI or platform dependencies: one signaling
//! session per room shared by presence, chat, location sharing and a
//! full-mesh peer call coordinator. Consumed by thin shells.
//!
//! Delivery across different event names follows transport arrival
//! order only; there is no reordering buffer.

pub mod api;
pub mod auth;
pub mod binder;
pub mod chat;
pub mod config;
pub mod errors;
pub mod events;
pub mod location;
pub mod media;
pub mod mesh;
pub mod presence;
pub mod protocol;
pub mod rtc;
pub mod session;
pub mod settings;
pub mod transport;

#[cfg(test)]
mod testing;

pub use binder::{RoomBinder, RoomHandle, RoomServices};
pub use config::ClientConfig;
pub use errors::RealtimeError;
pub use events::{TripEvent, TripEventListener};
pub use session::{Session, SessionRegistry};
