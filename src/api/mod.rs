//! HTTP surface: a client-facing listener and a separate admin listener,
//! mirroring the teacher's split between `api::client` and `api::admin`.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod health;
pub mod metrics;
pub mod request_id;
