//! Mesh-topology meeting sessions.
//!
//! Each participant keeps one WebRTC connection to every other participant.
//! Presence and signaling go through a shared store (`memory://` or Redis);
//! a single coordinator task per session reconciles the roster, drives
//! per-peer negotiation and owns the local tracks.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod model;
pub mod peer;
pub mod session;
pub mod sse;
pub mod store;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use crate::error::{SessionError, SessionResult};
pub use crate::session::{join, SessionConfig, SessionDeps, SessionHandle, SessionView};
