//! TFTP server library
//!
//! An RFC 1350 TFTP server over UDP: read requests stream files out,
//! write requests store them, always in lock-step — one 512-byte DATA
//! packet in flight, each acknowledged before the next, with a bounded
//! retransmission budget per block.
//!
//! - Read (RRQ) and write (WRQ) requests, byte-for-byte regardless of
//!   the requested transfer mode
//! - One well-known listening port, one ephemeral port per transfer
//!   (the transfer ID scheme of the RFC)
//! - Concurrent sessions, capped; the dispatcher never blocks on one
//! - Path traversal protection on both roots
//! - Duplicate-suppressing retransmission: stale packets are ignored,
//!   timeouts resend, and the budget is never refunded mid-block
//!
//! # Running a server
//!
//! ```rust,no_run
//! use tftp::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = Server::new(ServerConfig::default());
//!     server.run().await
//! }
//! ```
//!
//! # Working with packets
//!
//! ```rust
//! use tftp::{Opcode, Packet};
//!
//! let ack = Packet::Ack(1);
//! assert_eq!(ack.to_bytes(), [0, 4, 0, 1]);
//! assert_eq!(ack.opcode(), Opcode::Ack);
//!
//! let decoded = Packet::from_bytes(&[0, 4, 0, 1]).unwrap();
//! assert_eq!(decoded, ack);
//! ```

mod error;
mod protocol;
mod server;
mod transfer;

pub use error::*;
pub use protocol::*;
pub use server::*;
pub use transfer::*;
