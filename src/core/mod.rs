// src/core/mod.rs

//! The central module containing the connection, pooling, pub/sub and caching
//! machinery of the client.

pub mod cache;
pub mod clock;
pub mod commands;
pub mod connection;
pub mod errors;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod pubsub;
pub mod runtime;
pub mod tasks;

pub use errors::ClientError;
pub use protocol::{Command, CommandFlags, RespFrame};
