//! Pooled connections to one backend database server.
//!
//! Architecture:
//! - `connection`: Collaborator traits the pool drives (`Connector`, `BackendConnection`)
//! - `pool`: Bounded slot pool with reuse validation and borrowed handles

pub mod connection;
pub mod pool;


pub use connection::{BackendConnection, Connector, ExecResult};
pub use pool::{ConnectionPool, DbState, PoolConfig, PooledConnection};
