//! Request dispatcher
//!
//! The server owns the well-known socket. It decodes each incoming
//! datagram, rejects what it must, and spawns an independent session
//! task for every acceptable read or write request. It never waits on a
//! session: the only socket it touches is its own, and the only shared
//! state is the configuration and the transfer-count semaphore.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::error::{TransferError, send_error_to};
use crate::protocol::{DecodeError, ErrorCode, MAX_PACKET_SIZE, Packet};
use crate::transfer::{TransferConfig, handle_read_request, handle_write_request};

/// Server configuration. Everything the server needs is passed in here;
/// there are no global knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Well-known address to listen on for requests.
    pub bind_address: String,
    /// Directory served to read requests.
    pub read_root: PathBuf,
    /// Directory write requests are stored into.
    pub write_root: PathBuf,
    /// Concurrent transfer cap. Requests beyond it are dropped, to be
    /// retried by the client rather than queued here.
    pub max_transfers: usize,
    /// Session-level settings handed to every transfer.
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4970".to_string(),
            read_root: PathBuf::from("./read"),
            write_root: PathBuf::from("./write"),
            max_transfers: 64,
            transfer: TransferConfig::default(),
        }
    }
}

/// The TFTP server: one dispatcher loop, many session tasks.
pub struct Server {
    config: ServerConfig,
    socket: Option<UdpSocket>,
    transfers: Arc<Semaphore>,
}

impl Server {
    /// Create a server from its configuration. Nothing is bound yet.
    pub fn new(config: ServerConfig) -> Self {
        let transfers = Arc::new(Semaphore::new(config.max_transfers));
        Self {
            config,
            socket: None,
            transfers,
        }
    }

    /// The server's configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The bound listening address, once [`Server::bind`] has succeeded.
    /// Lets tests bind port 0 and find out what they got.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the well-known socket and verify the root directories exist.
    pub async fn bind(&mut self) -> Result<()> {
        for root in [&self.config.read_root, &self.config.write_root] {
            if !root.is_dir() {
                return Err(anyhow!("root directory {} does not exist", root.display()));
            }
        }

        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .context("Failed to bind TFTP server socket")?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;

        tracing::info!(
            "TFTP server listening on {}, reading from {}, writing to {}",
            local_addr,
            self.config.read_root.display(),
            self.config.write_root.display()
        );

        self.socket = Some(socket);
        Ok(())
    }

    /// Bind and serve until the listening socket fails.
    pub async fn run(&mut self) -> Result<()> {
        self.bind().await?;
        self.serve().await
    }

    /// The dispatcher loop. Requires a prior successful [`Server::bind`].
    pub async fn serve(&self) -> Result<()> {
        let socket = self.socket.as_ref().context("Server is not bound")?;
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            let (len, client) = socket.recv_from(&mut buffer).await?;

            match Packet::from_bytes(&buffer[..len]) {
                Ok(Packet::Rrq { filename, mode }) => {
                    tracing::info!(
                        "Read request for '{}' ({} mode) from {}",
                        filename,
                        mode,
                        client
                    );
                    self.start_session(client, filename, false);
                }
                Ok(Packet::Wrq { filename, mode }) => {
                    tracing::info!(
                        "Write request for '{}' ({} mode) from {}",
                        filename,
                        mode,
                        client
                    );
                    self.start_session(client, filename, true);
                }
                Ok(other) => {
                    // DATA, ACK or ERROR aimed at the well-known port:
                    // no session owns that transfer ID.
                    tracing::debug!("{} from {} outside any session", other.opcode(), client);
                    tokio::spawn(reject_request(
                        client,
                        ErrorCode::IllegalOperation,
                        ErrorCode::IllegalOperation.default_message(),
                    ));
                }
                Err(DecodeError::UnknownOpcode(op)) => {
                    tracing::debug!("Unknown opcode {} from {}", op, client);
                    tokio::spawn(reject_request(
                        client,
                        ErrorCode::IllegalOperation,
                        ErrorCode::IllegalOperation.default_message(),
                    ));
                }
                Err(e) => {
                    // Malformed datagrams are dropped without an answer.
                    tracing::debug!("Dropping datagram from {}: {}", client, e);
                }
            }
        }
    }

    /// Resolve the request, reserve a transfer slot, and spawn the
    /// session task. Never blocks the dispatcher.
    fn start_session(&self, client: SocketAddr, filename: String, write: bool) {
        let root = if write {
            &self.config.write_root
        } else {
            &self.config.read_root
        };

        let path = match resolve_path(root, &filename) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Refusing request from {}: {}", client, e);
                if let Some((code, message)) = e.reply() {
                    tokio::spawn(async move {
                        reject_request(client, code, &message).await;
                    });
                }
                return;
            }
        };

        let permit = match Arc::clone(&self.transfers).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    "Transfer limit ({}) reached, dropping request from {}",
                    self.config.max_transfers,
                    client
                );
                return;
            }
        };

        let config = self.config.transfer.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = if write {
                handle_write_request(client, &filename, &path, &config).await
            } else {
                handle_read_request(client, &filename, &path, &config).await
            };
            if let Err(e) = result {
                tracing::warn!("Transfer of '{}' with {} failed: {}", filename, client, e);
            }
        });
    }
}

/// Bind and run a server until its listening socket fails.
///
/// Convenience for binaries that want nothing but the loop.
pub async fn run(config: ServerConfig) -> Result<()> {
    let mut server = Server::new(config);
    server.run().await
}

/// Resolve a requested filename against a root directory, refusing
/// anything that could land outside it.
///
/// The check is lexical: write targets do not exist yet, so
/// canonicalization is not an option. Only plain name components pass;
/// absolute paths, `..`, and drive prefixes are all violations.
fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    let relative = Path::new(filename);

    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(TransferError::AccessViolation(filename.to_string())),
        }
    }

    Ok(root.join(relative))
}

/// Answer a rejected request with one ERROR from a throwaway ephemeral
/// socket, keeping the well-known port free of ERROR traffic.
async fn reject_request(client: SocketAddr, code: ErrorCode, message: &str) {
    let bind_addr = match client {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };

    match UdpSocket::bind(bind_addr).await {
        Ok(socket) => send_error_to(&socket, client, code, message).await,
        Err(e) => tracing::warn!("Failed to bind reject socket for {}: {}", client, e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::time::timeout;

    use super::*;

    fn test_config(read_root: &Path, write_root: &Path) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            read_root: read_root.to_path_buf(),
            write_root: write_root.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:4970");
        assert_eq!(config.read_root, PathBuf::from("./read"));
        assert_eq!(config.write_root, PathBuf::from("./write"));
        assert_eq!(config.max_transfers, 64);
    }

    #[test]
    fn test_resolve_path_accepts_plain_names() {
        let root = Path::new("/srv/tftp");
        assert_eq!(
            resolve_path(root, "boot.img").unwrap(),
            PathBuf::from("/srv/tftp/boot.img")
        );
        assert_eq!(
            resolve_path(root, "images/v2/boot.img").unwrap(),
            PathBuf::from("/srv/tftp/images/v2/boot.img")
        );
    }

    #[test]
    fn test_resolve_path_rejects_traversal() {
        let root = Path::new("/srv/tftp");
        for bad in ["../secret", "a/../../secret", "/etc/passwd", "..", "./x"] {
            let err = resolve_path(root, bad).unwrap_err();
            assert!(matches!(err, TransferError::AccessViolation(_)), "{bad}");
        }
    }

    #[test]
    fn test_server_starts_unbound() {
        let server = Server::new(ServerConfig::default());
        assert!(server.local_addr().is_none());
        assert_eq!(server.config().max_transfers, 64);
    }

    #[tokio::test]
    async fn test_bind_requires_existing_roots() {
        let present = tempdir().unwrap();
        let missing = present.path().join("nope");

        let mut server = Server::new(test_config(present.path(), &missing));
        assert!(server.bind().await.is_err());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let read = tempdir().unwrap();
        let write = tempdir().unwrap();

        let mut server = Server::new(test_config(read.path(), write.path()));
        server.bind().await.unwrap();

        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_non_request_packets_get_illegal_operation() {
        let read = tempdir().unwrap();
        let write = tempdir().unwrap();

        let mut server = Server::new(test_config(read.path(), write.path()));
        server.bind().await.unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(async move { server.serve().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&Packet::Ack(3).to_bytes(), addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // The rejection comes from a throwaway port, not the well-known one.
        assert_ne!(from, addr);
        assert_eq!(
            Packet::from_bytes(&buf[..len]).unwrap(),
            Packet::Error {
                code: 4,
                message: "Illegal TFTP operation".to_string(),
            }
        );

        // Opcodes outside the RFC table get the same answer.
        client.send_to(&[0, 9, 0, 0], addr).await.unwrap();
        let (len, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Packet::from_bytes(&buf[..len]).unwrap(),
            Packet::Error { code: 4, .. }
        ));

        server_task.abort();
    }

    #[tokio::test]
    async fn test_undecodable_datagrams_are_dropped_silently() {
        let read = tempdir().unwrap();
        let write = tempdir().unwrap();

        let mut server = Server::new(test_config(read.path(), write.path()));
        server.bind().await.unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(async move { server.serve().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xff], addr).await.unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let reply = timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "expected no reply to an undecodable datagram");

        server_task.abort();
    }
}
