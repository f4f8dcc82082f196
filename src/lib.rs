//! Agent Task Broker binary: CLI entry points, configuration, and the
//! axum server bootstrap (lease reaper + graceful shutdown) glueing
//! `broker-core`, `broker-store`, and `broker-http` together.

pub mod config;
pub mod migrate;
pub mod server;
