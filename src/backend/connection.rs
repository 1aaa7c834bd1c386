//! Backend connection collaborators.
//!
//! The pool does not speak the session protocol itself. It drives
//! connections through these two traits: a [`Connector`] that dials and
//! authenticates new sessions, and the [`BackendConnection`] it hands out.

use async_trait::async_trait;

use crate::error::Result;

/// Summary of an executed statement, as reported by the backend OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

/// One authenticated session to the backend server.
///
/// Every operation reports failure through its `Result`; the pool and
/// [`PooledConnection`](super::PooledConnection) decide from those results
/// whether the session may be reused. Dropping a connection must release
/// its transport.
#[async_trait]
pub trait BackendConnection: Send + 'static {
    /// Gracefully close the session (sends `COM_QUIT` where applicable).
    async fn close(&mut self);

    async fn ping(&mut self) -> Result<()>;

    fn is_in_transaction(&self) -> bool;

    async fn rollback(&mut self) -> Result<()>;

    fn is_auto_commit(&self) -> bool;

    async fn execute(&mut self, statement: &str) -> Result<ExecResult>;

    /// Character set currently negotiated for the session.
    fn charset(&self) -> &str;

    async fn set_charset(&mut self, charset: &str) -> Result<()>;
}

/// Factory establishing new backend sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: BackendConnection;

    async fn connect(
        &self,
        addr: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self::Conn>;
}
