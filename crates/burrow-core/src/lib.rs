//! Shared types for the burrow reverse tunnel server.
//!
//! Everything here is small and dependency-light so the tunnel engine, the
//! public proxy surface and the management API can agree on ids, errors and
//! configuration without pulling each other in.

pub mod config;
pub mod error;
pub mod id;

pub use config::{ServerConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SOCKETS};
pub use error::{Error, Result};
pub use id::ClientId;
