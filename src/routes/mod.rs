//! HTTP route handlers.
//!
//! Each sub-module corresponds to an endpoint group. Health endpoints may be
//! probed without a passphrase; the status endpoints, like every other
//! room-scoped surface, require one.

pub mod health;
pub mod status;
