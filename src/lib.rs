//! Remote filesystem client speaking a private msgpack RPC protocol to a
//! worker process spawned on the remote host.
//!
//! The layers, bottom up: [`wire`] frames requests and parcels, [`worker`]
//! runs one request/response channel, [`watch`] consumes pushed change
//! notices, [`pool`] shares workers by priority, [`cache`] keeps metadata and
//! encrypted file contents, and [`host`] ties them into a filesystem API.

pub mod cache;
pub mod channel;
pub mod cmd;
pub mod config;
pub mod connection;
pub mod diff;
pub mod error;
pub mod host;
pub mod pool;
pub mod watch;
pub mod wire;
pub mod worker;

pub use error::{Error, Result};
