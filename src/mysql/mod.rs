//! MySQL packet framing.
//!
//! Architecture:
//! - `protocol`: Wire constants and packet header encoding
//! - `packet`: Packet reader/writer with sequence tracking

pub mod protocol;
pub mod packet;


pub use packet::{PacketIo, PacketSection};
pub use protocol::{PacketHeader, DEFAULT_CHARSET, HEADER_LEN, MAX_PAYLOAD_LEN};
