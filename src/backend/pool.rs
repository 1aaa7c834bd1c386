//! Backend connection pool.
//!
//! The pool owns a fixed number of slots for one backend address. A slot is
//! either `Empty` (capacity reserved, not connected yet) or `Live`. All
//! slots start in the queue; borrowing takes one out and validates it,
//! returning or discarding puts one back, so the total never changes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::connection::{BackendConnection, Connector, ExecResult};
use crate::error::{BackendError, Result};
use crate::mysql::protocol::{DEFAULT_CHARSET, DEFAULT_MAX_CONN_NUM, INIT_CONN_COUNT};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Backend address (`host:port`)
    pub addr: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database selected on every new connection
    #[serde(default)]
    pub database: String,
    /// Maximum number of connections (0 = default capacity)
    #[serde(default)]
    pub max_connections: usize,
    /// Charset every connection is reset to before reuse
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

impl PoolConfig {
    /// Create a new pool configuration.
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            user: String::new(),
            password: String::new(),
            database: String::new(),
            max_connections: 0,
            charset: default_charset(),
        }
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn charset(mut self, charset: &str) -> Self {
        self.charset = charset.to_string();
        self
    }

    /// Resolve `(max_conn_num, init_conn_num)`.
    ///
    /// Small pools are connected eagerly in full, larger ones a quarter up
    /// front. Without a configured maximum the pool gets
    /// `DEFAULT_MAX_CONN_NUM` slots of which `INIT_CONN_COUNT` are eager.
    pub fn sizing(&self) -> (usize, usize) {
        match self.max_connections {
            0 => (DEFAULT_MAX_CONN_NUM, INIT_CONN_COUNT),
            max if max < INIT_CONN_COUNT => (max, max),
            max => (max, max / 4),
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .field("charset", &self.charset)
            .finish()
    }
}

// ============================================================================
// Health State
// ============================================================================

/// Backend health as last set by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbState {
    Up = 0,
    Down = 1,
    Unknown = 2,
}

impl DbState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbState::Up => "up",
            DbState::Down => "down",
            // Spelling is part of the admin interface
            DbState::Unknown => "unknow",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => DbState::Up,
            1 => DbState::Down,
            _ => DbState::Unknown,
        }
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Slot Queue
// ============================================================================

enum Slot<C> {
    /// Reserved capacity without a transport.
    Empty,
    Live(C),
}

/// Bounded FIFO of slots. The semaphore holds one permit per queued slot,
/// so waiting for a permit is waiting for a slot.
struct SlotQueue<C> {
    slots: Mutex<VecDeque<Slot<C>>>,
    ready: Semaphore,
    capacity: usize,
}

impl<C> SlotQueue<C> {
    fn new(slots: VecDeque<Slot<C>>, capacity: usize) -> Self {
        Self {
            ready: Semaphore::new(slots.len()),
            slots: Mutex::new(slots),
            capacity,
        }
    }

    /// Take the oldest slot, waiting while every slot is borrowed.
    async fn pop(&self) -> Result<Option<Slot<C>>> {
        let permit = self
            .ready
            .acquire()
            .await
            .map_err(|_| BackendError::PoolClosed)?;
        permit.forget();
        self.take_front()
    }

    /// Dequeue the slot a permit was taken for. Finds nothing only when
    /// `close` drained the queue in between.
    fn take_front(&self) -> Result<Option<Slot<C>>> {
        match self.slots.lock().pop_front() {
            Some(slot) => Ok(Some(slot)),
            None if self.ready.is_closed() => Err(BackendError::PoolClosed),
            None => Ok(None),
        }
    }

    /// Enqueue without waiting. Hands the slot back if the queue is full
    /// or closed.
    fn try_push(&self, slot: Slot<C>) -> std::result::Result<(), Slot<C>> {
        {
            let mut slots = self.slots.lock();
            if self.ready.is_closed() || slots.len() >= self.capacity {
                return Err(slot);
            }
            slots.push_back(slot);
        }
        self.ready.add_permits(1);
        Ok(())
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Wake all waiters with `PoolClosed` and hand back what was queued.
    fn close(&self) -> Vec<Slot<C>> {
        self.ready.close();
        self.slots.lock().drain(..).collect()
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection borrowed from the pool.
///
/// Call [`release`](Self::release) when done. A fatal error observed
/// through any of the wrapper methods (or flagged with
/// [`mark_broken`](Self::mark_broken)) makes release discard the
/// connection instead of returning it. Dropping an unreleased handle does
/// the same without a graceful close.
pub struct PooledConnection<F: Connector> {
    /// The actual connection (None once released)
    conn: Option<F::Conn>,
    /// Reference back to the pool
    pool: ConnectionPool<F>,
    /// Set once a fatal error was observed on this connection
    broken: bool,
}

impl<F: Connector> PooledConnection<F> {
    /// Execute a statement.
    pub async fn execute(&mut self, statement: &str) -> Result<ExecResult> {
        let result = self.conn_mut()?.execute(statement).await;
        self.observe(result)
    }

    pub async fn ping(&mut self) -> Result<()> {
        let result = self.conn_mut()?.ping().await;
        self.observe(result)
    }

    /// Rollback the current transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        let result = self.conn_mut()?.rollback().await;
        self.observe(result)
    }

    pub async fn set_charset(&mut self, charset: &str) -> Result<()> {
        let result = self.conn_mut()?.set_charset(charset).await;
        self.observe(result)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_in_transaction())
    }

    pub fn is_auto_commit(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_auto_commit())
    }

    pub fn charset(&self) -> Option<&str> {
        self.conn.as_ref().map(|c| c.charset())
    }

    /// Direct access to the connection. Callers going through here must
    /// report fatal failures with [`mark_broken`](Self::mark_broken).
    pub fn get_mut(&mut self) -> Option<&mut F::Conn> {
        self.conn.as_mut()
    }

    /// Discard the connection on release instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Hand the connection back to the pool. Calling it again is a no-op.
    pub async fn release(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken {
            self.pool.close_conn(conn).await;
        } else {
            self.pool.push_conn(conn, None).await;
        }
    }

    fn conn_mut(&mut self) -> Result<&mut F::Conn> {
        self.conn.as_mut().ok_or(BackendError::ConnNil)
    }

    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.broken = true;
            }
        }
        result
    }
}

impl<F: Connector> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken {
                drop(conn);
                self.pool.inner.restore_capacity();
            } else {
                self.pool.inner.requeue(conn);
            }
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Internal pool state.
struct PoolInner<F: Connector> {
    /// Pool configuration
    config: PoolConfig,
    max_conn_num: usize,
    init_conn_num: usize,
    /// `DbState` as u8
    state: AtomicU8,
    connector: F,
    /// Slot queue, detached (None) once the pool is closed
    slots: Mutex<Option<Arc<SlotQueue<F::Conn>>>>,
    /// Dedicated connection for health checks
    check_conn: tokio::sync::Mutex<Option<F::Conn>>,
}

impl<F: Connector> PoolInner<F> {
    fn slots(&self) -> Option<Arc<SlotQueue<F::Conn>>> {
        self.slots.lock().clone()
    }

    async fn connect(&self) -> Result<F::Conn> {
        self.connector
            .connect(
                &self.config.addr,
                &self.config.user,
                &self.config.password,
                &self.config.database,
            )
            .await
    }

    /// Put an `Empty` slot back in place of a discarded connection.
    fn restore_capacity(&self) {
        if let Some(queue) = self.slots() {
            if queue.try_push(Slot::Empty).is_err() {
                tracing::debug!(addr = %self.config.addr, "slot queue full or closed, replacement dropped");
            }
        }
    }

    /// Return a live connection without waiting. Connections that do not
    /// fit are dropped.
    fn requeue(&self, conn: F::Conn) {
        let rejected = match self.slots() {
            Some(queue) => queue.try_push(Slot::Live(conn)).err(),
            None => Some(Slot::Live(conn)),
        };
        if rejected.is_some() {
            tracing::debug!(addr = %self.config.addr, "dropping connection that could not be returned");
        }
    }

    /// Bring a reused connection back to a clean session state.
    async fn reset_session(&self, conn: &mut F::Conn) -> Result<()> {
        if conn.is_in_transaction() {
            conn.rollback().await?;
        }
        if !conn.is_auto_commit() {
            conn.execute("SET autocommit = 1").await?;
        }
        if conn.charset() != self.config.charset {
            conn.set_charset(&self.config.charset).await?;
        }
        Ok(())
    }
}

/// Restores an `Empty` slot unless disarmed, so a borrow that fails or is
/// cancelled mid-validation does not shrink the pool.
struct SlotReplacement<'a, F: Connector> {
    inner: &'a PoolInner<F>,
    armed: bool,
}

impl<F: Connector> SlotReplacement<'_, F> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<F: Connector> Drop for SlotReplacement<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.restore_capacity();
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A bounded pool of connections to one backend server.
///
/// Cloning is cheap and shares the same pool.
pub struct ConnectionPool<F: Connector> {
    inner: Arc<PoolInner<F>>,
}

impl<F: Connector> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Connector> ConnectionPool<F> {
    /// Open a pool: establish the health-check connection, then the eager slots.
    pub async fn open(config: PoolConfig, connector: F) -> Result<Self> {
        let (max_conn_num, init_conn_num) = config.sizing();

        let mut inner = PoolInner {
            config,
            max_conn_num,
            init_conn_num,
            state: AtomicU8::new(DbState::Unknown as u8),
            connector,
            slots: Mutex::new(None),
            check_conn: tokio::sync::Mutex::new(None),
        };

        let mut check_conn = match inner.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(addr = %inner.config.addr, error = %e, "health-check connection failed");
                return Err(BackendError::PoolClosed);
            }
        };

        let mut slots = VecDeque::with_capacity(max_conn_num);
        for _ in 0..init_conn_num {
            match inner.connect().await {
                Ok(conn) => slots.push_back(Slot::Live(conn)),
                Err(e) => {
                    tracing::error!(
                        addr = %inner.config.addr,
                        established = slots.len(),
                        error = %e,
                        "failed to pre-warm connection pool"
                    );
                    check_conn.close().await;
                    for slot in slots {
                        if let Slot::Live(mut conn) = slot {
                            conn.close().await;
                        }
                    }
                    return Err(BackendError::PoolInitFailed(Box::new(e)));
                }
            }
        }
        slots.extend((init_conn_num..max_conn_num).map(|_| Slot::Empty));

        *inner.slots.lock() = Some(Arc::new(SlotQueue::new(slots, max_conn_num)));
        *inner.check_conn.get_mut() = Some(check_conn);

        tracing::info!(
            addr = %inner.config.addr,
            max_conn_num,
            init_conn_num,
            "opened backend connection pool"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.config.addr
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn max_conn_num(&self) -> usize {
        self.inner.max_conn_num
    }

    pub fn init_conn_num(&self) -> usize {
        self.inner.init_conn_num
    }

    pub fn state(&self) -> DbState {
        DbState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Record the backend health. Driven by an external health checker.
    pub fn set_state(&self, state: DbState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Slots currently in the queue, connected or not.
    pub fn idle_conn_count(&self) -> usize {
        self.inner.slots().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slots.lock().is_none()
    }

    /// Ping the backend over the health-check connection, reconnecting it
    /// first if needed. A connection that fails its ping is closed so the
    /// next call starts over.
    pub async fn ping(&self) -> Result<()> {
        let mut check_conn = self.inner.check_conn.lock().await;
        // `close` detaches the queue before taking this lock
        if self.inner.slots().is_none() {
            return Err(BackendError::PoolClosed);
        }
        if check_conn.is_none() {
            *check_conn = Some(self.inner.connect().await?);
        }
        let Some(conn) = check_conn.as_mut() else {
            return Err(BackendError::ConnNil);
        };
        let result = conn.ping().await;
        if let Err(e) = &result {
            tracing::warn!(addr = %self.addr(), error = %e, "health-check ping failed");
            if let Some(mut conn) = check_conn.take() {
                conn.close().await;
            }
        }
        result
    }

    /// Borrow a connection, waiting only while every slot is in use.
    ///
    /// On validation failure the slot is discarded and replaced and the
    /// error returned; the caller may borrow again right away.
    pub async fn pop_conn(&self) -> Result<F::Conn> {
        let queue = self.inner.slots().ok_or(BackendError::PoolClosed)?;
        let slot = queue.pop().await?.ok_or(BackendError::ConnNil)?;
        drop(queue);

        let mut replacement = SlotReplacement {
            inner: &*self.inner,
            armed: true,
        };

        match slot {
            Slot::Empty => {
                let conn = self.inner.connect().await.map_err(|e| {
                    tracing::warn!(addr = %self.addr(), error = %e, "failed to connect empty slot");
                    e
                })?;
                replacement.disarm();
                tracing::debug!(addr = %self.addr(), "connected empty slot");
                Ok(conn)
            }
            Slot::Live(mut conn) => match self.inner.reset_session(&mut conn).await {
                Ok(()) => {
                    replacement.disarm();
                    Ok(conn)
                }
                Err(e) => {
                    tracing::warn!(addr = %self.addr(), error = %e, "discarding connection that failed reuse");
                    conn.close().await;
                    Err(e)
                }
            },
        }
    }

    /// Borrow a connection wrapped in a [`PooledConnection`].
    pub async fn get_conn(&self) -> Result<PooledConnection<F>> {
        let conn = self.pop_conn().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            broken: false,
        })
    }

    /// Return a connection. With `last_error` set it is discarded and its
    /// slot replaced; on a closed pool it is closed and not replaced.
    pub async fn push_conn(&self, mut conn: F::Conn, last_error: Option<&BackendError>) {
        let Some(queue) = self.inner.slots() else {
            conn.close().await;
            return;
        };

        if let Some(e) = last_error {
            tracing::warn!(addr = %self.addr(), error = %e, "discarding connection returned with error");
            self.close_conn(conn).await;
            return;
        }

        if let Err(Slot::Live(mut conn)) = queue.try_push(Slot::Live(conn)) {
            tracing::debug!(addr = %self.addr(), "slot queue full, closing returned connection");
            conn.close().await;
        }
    }

    /// Close a connection and put an empty slot in its place.
    pub(crate) async fn close_conn(&self, mut conn: F::Conn) {
        conn.close().await;
        self.inner.restore_capacity();
    }

    /// Close the pool. Waiting borrowers fail with `PoolClosed`, queued
    /// connections and the health-check connection are closed. Borrowed connections are
    /// closed when they come back.
    pub async fn close(&self) {
        let queue = self.inner.slots.lock().take();
        let Some(queue) = queue else {
            return;
        };

        let mut closed = 0;
        for slot in queue.close() {
            if let Slot::Live(mut conn) = slot {
                conn.close().await;
                closed += 1;
            }
        }
        if let Some(mut conn) = self.inner.check_conn.lock().await.take() {
            conn.close().await;
        }

        tracing::info!(addr = %self.addr(), closed, "closed backend connection pool");
    }
}
