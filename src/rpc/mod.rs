//! Binary framed RPC surface for publishers.

pub mod auth;
pub mod client;
pub mod server;
pub mod wire;
