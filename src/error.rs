//! Error types for the backend pool and packet layer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// Operation attempted after the pool was closed (or the health-check
    /// connection could not be established while opening it).
    #[error("database pool is closed")]
    PoolClosed,

    #[error("failed to initialize connection pool: {0}")]
    PoolInitFailed(#[source] Box<BackendError>),

    /// A slot permit was granted but the queue had nothing to hand out.
    #[error("connection slot is nil")]
    ConnNil,

    #[error("bad connection")]
    BadConnection,

    #[error("invalid sequence {got} != {expected}")]
    SequenceMismatch { got: u8, expected: u8 },

    #[error("invalid payload length {0}")]
    InvalidPayloadLength(usize),

    #[error("packet is empty")]
    EmptyPacket,

    /// Error reported by the backend server itself (ERR packet).
    #[error("backend error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the error leaves the connection unusable.
    ///
    /// Server-reported errors keep the session in sync; everything else
    /// means the transport or framing state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BackendError::Server { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
