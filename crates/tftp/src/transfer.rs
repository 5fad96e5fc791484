//! Transfer sessions
//!
//! One session serves exactly one request on its own ephemeral socket:
//! the sender role streams a file out for an RRQ, the receiver role
//! stores one for a WRQ. Transfers are lock-step — a single DATA packet
//! in flight, each one acknowledged before the next — with a bounded
//! retransmission budget per block.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use crate::error::{TransferError, send_error};
use crate::protocol::{BLOCK_SIZE, MAX_PACKET_SIZE, Packet};

const TIMEOUT_SECS: u64 = 3;
const MAX_RETRIES: usize = 5;

/// Per-session configuration, shared by both roles.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long to wait for the peer's answer to one packet.
    pub timeout: Duration,
    /// Resends allowed per block after the initial transmission.
    pub max_retries: usize,
    /// Let write requests replace existing files instead of refusing
    /// with `File already exists`.
    pub overwrite: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            overwrite: false,
        }
    }
}

/// Serve one read request: stream `path` to the client in acknowledged
/// 512-byte blocks.
///
/// Owns the whole session. Binds and connects the ephemeral socket, runs
/// the DATA/ACK loop, and on failure reports to the peer with a single
/// ERROR packet before returning. `filename` is the name as requested,
/// kept for logging; `path` is already resolved against the read root.
pub async fn handle_read_request(
    client: SocketAddr,
    filename: &str,
    path: &Path,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let socket = create_session_socket(client).await?;

    match send_file(&socket, path, config).await {
        Ok(bytes) => {
            tracing::info!("Sent '{}' ({} bytes) to {}", filename, bytes, client);
            Ok(())
        }
        Err(e) => {
            if let Some((code, message)) = e.reply() {
                send_error(&socket, code, &message).await;
            }
            Err(e)
        }
    }
}

/// Serve one write request: store what the client sends as `path`.
///
/// Same session shape as [`handle_read_request`], with the roles of DATA
/// and ACK swapped. A partial file from a failed transfer is left on
/// disk.
pub async fn handle_write_request(
    client: SocketAddr,
    filename: &str,
    path: &Path,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let socket = create_session_socket(client).await?;

    match receive_file(&socket, path, config).await {
        Ok(bytes) => {
            tracing::info!("Received '{}' ({} bytes) from {}", filename, bytes, client);
            Ok(())
        }
        Err(e) => {
            if let Some((code, message)) = e.reply() {
                send_error(&socket, code, &message).await;
            }
            Err(e)
        }
    }
}

/// Bind a fresh ephemeral socket matching the client's address family and
/// connect it to the client.
///
/// The OS-assigned port is this session's transfer ID. Connecting makes
/// the kernel drop datagrams from any other peer, so the session only
/// ever sees its own client.
async fn create_session_socket(client: SocketAddr) -> Result<UdpSocket, TransferError> {
    let bind_addr = match client {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(client).await?;

    tracing::debug!("Session socket {} connected to {}", socket.local_addr()?, client);
    Ok(socket)
}

/// Sender role: DATA out, ACK back, block numbers from 1.
///
/// Returns the number of file bytes served. The final block is the first
/// one shorter than [`BLOCK_SIZE`]; a file of exactly N×512 bytes ends
/// with an empty DATA, and an empty file is served as a single empty
/// DATA(1).
async fn send_file(
    socket: &UdpSocket,
    path: &Path,
    config: &TransferConfig,
) -> Result<u64, TransferError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| TransferError::FileNotFound(path.display().to_string()))?;
    if !metadata.is_file() {
        return Err(TransferError::FileNotFound(path.display().to_string()));
    }

    let mut file = File::open(path).await?;
    let mut block: u16 = 1;
    let mut sent: u64 = 0;

    loop {
        let chunk = read_block(&mut file).await?;
        let len = chunk.len();
        let packet = Packet::Data { block, data: chunk }.to_bytes();

        await_ack(socket, &packet, block, config).await?;
        sent += len as u64;

        if len < BLOCK_SIZE {
            return Ok(sent);
        }
        block = block.wrapping_add(1);
    }
}

/// Receiver role: ACK out, DATA back, starting from the ACK(0) that
/// accepts the request itself.
///
/// Returns the number of file bytes stored. Every accepted block is
/// written before it is acknowledged, so an acknowledged block is never
/// lost to a crash of this process.
async fn receive_file(
    socket: &UdpSocket,
    path: &Path,
    config: &TransferConfig,
) -> Result<u64, TransferError> {
    let mut file = if config.overwrite {
        File::create(path).await?
    } else {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    TransferError::FileExists(path.display().to_string())
                }
                _ => TransferError::Io(e),
            })?
    };

    let mut expected: u16 = 1;
    let mut written: u64 = 0;
    let mut last_ack = Packet::Ack(0).to_bytes();
    socket.send(&last_ack).await?;

    loop {
        let data = await_data(socket, &last_ack, expected, config).await?;
        file.write_all(&data).await?;
        written += data.len() as u64;

        last_ack = Packet::Ack(expected).to_bytes();
        socket.send(&last_ack).await?;

        if data.len() < BLOCK_SIZE {
            file.flush().await?;
            return Ok(written);
        }
        expected = expected.wrapping_add(1);
    }
}

/// Read the next block: up to [`BLOCK_SIZE`] bytes, shorter only at end
/// of file. A bare `read` may return short before EOF, so keep filling
/// until the block is full or the file ends.
async fn read_block(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;

    while filled < BLOCK_SIZE {
        let n = file.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    chunk.truncate(filled);
    Ok(chunk)
}

/// Send one DATA packet and wait for its ACK, resending on timeout up to
/// the configured budget.
///
/// One deadline per transmission: a stale ACK arriving inside the window
/// is ignored and the wait continues on the same deadline, so chatter
/// from the peer can neither extend the wait nor refund retries.
async fn await_ack(
    socket: &UdpSocket,
    packet: &[u8],
    block: u16,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut retries = 0;

    socket.send(packet).await?;
    let mut deadline = Instant::now() + config.timeout;

    loop {
        let received = match timeout_at(deadline, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                if retries >= config.max_retries {
                    return Err(TransferError::RetryExhausted("ACK"));
                }
                retries += 1;
                socket.send(packet).await?;
                deadline = Instant::now() + config.timeout;
                continue;
            }
        };

        match Packet::from_bytes(&buf[..received]) {
            Ok(Packet::Ack(n)) if n == block => return Ok(()),
            Ok(Packet::Ack(_)) => {
                // Stale ACK for an earlier block. Not an answer, not a
                // timeout: keep waiting.
            }
            Ok(Packet::Error { code, message }) => {
                return Err(TransferError::Peer { code, message });
            }
            Ok(other) => {
                return Err(TransferError::UnexpectedPacket(format!(
                    "expected ACK, got {}",
                    other.opcode()
                )));
            }
            Err(e) => {
                return Err(TransferError::UnexpectedPacket(format!(
                    "expected ACK, got undecodable datagram ({})",
                    e
                )));
            }
        }
    }
}

/// Wait for the DATA block numbered `expected`, re-sending `last_ack` on
/// timeout up to the configured budget.
///
/// A duplicate of the previous block means our ACK was lost or slow: it
/// is re-acknowledged but never rewritten, and it does not touch the
/// deadline or the retry count.
async fn await_data(
    socket: &UdpSocket,
    last_ack: &[u8],
    expected: u16,
    config: &TransferConfig,
) -> Result<Vec<u8>, TransferError> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut retries = 0;
    let mut deadline = Instant::now() + config.timeout;

    loop {
        let received = match timeout_at(deadline, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                if retries >= config.max_retries {
                    return Err(TransferError::RetryExhausted("DATA"));
                }
                retries += 1;
                socket.send(last_ack).await?;
                deadline = Instant::now() + config.timeout;
                continue;
            }
        };

        match Packet::from_bytes(&buf[..received]) {
            Ok(Packet::Data { block, data }) if block == expected => return Ok(data),
            Ok(Packet::Data { block, .. }) if block == expected.wrapping_sub(1) => {
                socket.send(last_ack).await?;
            }
            Ok(Packet::Data { block, .. }) => {
                return Err(TransferError::UnexpectedPacket(format!(
                    "expected DATA block {}, got block {}",
                    expected, block
                )));
            }
            Ok(Packet::Error { code, message }) => {
                return Err(TransferError::Peer { code, message });
            }
            Ok(other) => {
                return Err(TransferError::UnexpectedPacket(format!(
                    "expected DATA, got {}",
                    other.opcode()
                )));
            }
            Err(e) => {
                return Err(TransferError::UnexpectedPacket(format!(
                    "expected DATA, got undecodable datagram ({})",
                    e
                )));
            }
        }
    }
}
