//! Session failure taxonomy and ERROR reporting.
//!
//! Every way a request or an active transfer can fail is one
//! [`TransferError`] variant. Failures are session-terminal: the session
//! maps its error to at most one ERROR packet via [`TransferError::reply`],
//! fires it, and exits. Nothing here is fatal to the server as a whole.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::protocol::{ErrorCode, Packet};

/// Why a transfer session (or the request that would have started one)
/// ended without completing.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The requested path escapes the configured root directory.
    #[error("access violation: {0:?}")]
    AccessViolation(String),
    /// A read request named a file that does not exist (or is not a
    /// regular file).
    #[error("file not found: {0:?}")]
    FileNotFound(String),
    /// A write request named an existing file while overwriting is off.
    #[error("file already exists: {0:?}")]
    FileExists(String),
    /// The peer never answered: the timeout expired on the same block
    /// more times than the retransmission budget allows.
    #[error("no {0} received after all retransmissions")]
    RetryExhausted(&'static str),
    /// The peer sent something that has no place in the current exchange.
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),
    /// The peer reported an error of its own. Terminal, never answered.
    #[error("peer error {code}: {message}")]
    Peer { code: u16, message: String },
    /// Local file I/O failed mid-transfer.
    #[error("file I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// The ERROR packet this failure owes the peer, if any.
    ///
    /// A [`TransferError::Peer`] failure gets `None`: an ERROR packet is
    /// never answered with another ERROR.
    pub fn reply(&self) -> Option<(ErrorCode, String)> {
        match self {
            Self::AccessViolation(_) => Some((
                ErrorCode::AccessViolation,
                ErrorCode::AccessViolation.default_message().to_string(),
            )),
            Self::FileNotFound(_) => Some((
                ErrorCode::FileNotFound,
                ErrorCode::FileNotFound.default_message().to_string(),
            )),
            Self::FileExists(_) => Some((
                ErrorCode::FileAlreadyExists,
                ErrorCode::FileAlreadyExists.default_message().to_string(),
            )),
            Self::RetryExhausted(what) => {
                Some((ErrorCode::NotDefined, format!("no {what} received")))
            }
            Self::UnexpectedPacket(detail) => {
                Some((ErrorCode::IllegalOperation, detail.clone()))
            }
            Self::Peer { .. } => None,
            Self::Io(err) => Some((ErrorCode::NotDefined, err.to_string())),
        }
    }
}

/// Fire one ERROR packet on a connected session socket.
///
/// Fire-and-forget: nothing acknowledges an ERROR, so a send failure is
/// logged and swallowed, never retried or propagated.
pub async fn send_error(socket: &UdpSocket, code: ErrorCode, message: &str) {
    let bytes = Packet::Error {
        code: code.as_u16(),
        message: message.to_string(),
    }
    .to_bytes();
    if let Err(e) = socket.send(&bytes).await {
        tracing::warn!("Failed to send ERROR packet: {}", e);
    }
}

/// Fire one ERROR packet at `peer` from an unconnected socket.
///
/// Used by the dispatcher, which rejects bad requests from throwaway
/// sockets before any session exists. Same fire-and-forget contract as
/// [`send_error`].
pub async fn send_error_to(
    socket: &UdpSocket,
    peer: SocketAddr,
    code: ErrorCode,
    message: &str,
) {
    let bytes = Packet::Error {
        code: code.as_u16(),
        message: message.to_string(),
    }
    .to_bytes();
    if let Err(e) = socket.send_to(&bytes, peer).await {
        tracing::warn!("Failed to send ERROR packet to {}: {}", peer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_PACKET_SIZE;

    #[test]
    fn replies_carry_rfc_codes() {
        let (code, message) = TransferError::AccessViolation("../etc/passwd".into())
            .reply()
            .unwrap();
        assert_eq!(code, ErrorCode::AccessViolation);
        assert_eq!(message, "Access violation");

        let (code, _) = TransferError::FileNotFound("missing.bin".into())
            .reply()
            .unwrap();
        assert_eq!(code, ErrorCode::FileNotFound);

        let (code, _) = TransferError::FileExists("taken.bin".into())
            .reply()
            .unwrap();
        assert_eq!(code, ErrorCode::FileAlreadyExists);

        let (code, message) = TransferError::RetryExhausted("ACK").reply().unwrap();
        assert_eq!(code, ErrorCode::NotDefined);
        assert_eq!(message, "no ACK received");

        let (code, message) = TransferError::UnexpectedPacket("expected ACK, got DATA".into())
            .reply()
            .unwrap();
        assert_eq!(code, ErrorCode::IllegalOperation);
        assert_eq!(message, "expected ACK, got DATA");

        let (code, _) = TransferError::from(io::Error::other("read failed"))
            .reply()
            .unwrap();
        assert_eq!(code, ErrorCode::NotDefined);
    }

    #[test]
    fn peer_errors_are_never_answered() {
        let err = TransferError::Peer {
            code: 3,
            message: "Disk full or allocation exceeded".to_string(),
        };
        assert!(err.reply().is_none());
    }

    #[tokio::test]
    async fn send_error_reaches_the_peer_decoded() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.connect(peer.local_addr().unwrap()).await.unwrap();

        send_error(&sender, ErrorCode::FileAlreadyExists, "File already exists").await;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = peer.recv(&mut buf).await.unwrap();
        assert_eq!(
            Packet::from_bytes(&buf[..len]).unwrap(),
            Packet::Error {
                code: 6,
                message: "File already exists".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn send_error_to_works_unconnected() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send_error_to(
            &sender,
            peer.local_addr().unwrap(),
            ErrorCode::IllegalOperation,
            "Illegal TFTP operation",
        )
        .await;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, sender.local_addr().unwrap());
        assert_eq!(
            Packet::from_bytes(&buf[..len]).unwrap(),
            Packet::Error {
                code: 4,
                message: "Illegal TFTP operation".to_string(),
            }
        );
    }
}
