//! Backend side of a sharding MySQL proxy.
//!
//! - [`backend`]: bounded pool of connections to one backend server
//! - [`mysql`]: packet framing with sequence tracking
//!
//! The crate emits `tracing` events but never installs a subscriber.

pub mod backend;
mod error;
pub mod mysql;

pub use backend::{
    BackendConnection, ConnectionPool, Connector, DbState, ExecResult, PoolConfig,
    PooledConnection,
};
pub use error::{BackendError, Result};
pub use mysql::{PacketIo, PacketSection};
