//! API-key authentication for the HTTP surface.
//!
//! The engine itself never sees caller identity. Authentication is enforced by
//! [`middleware::ApiKeyAuth`], which checks the `Authorization` header of every
//! request in the `/v1` scope against a single Argon2 hash from configuration.

pub mod crypto;
pub mod header;
pub mod middleware;
