//! Management HTTP API.
//!
//! Served by the public listener on any request that does not match a
//! registered subdomain: tunnel creation (`GET /?new`, `GET /{id}`), server
//! status (`GET /api/status`) and a landing-page redirect for everything
//! else.

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use error::ApiError;
pub use router::build_router;
pub use state::ApiState;
