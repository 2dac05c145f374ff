//! Per-request Unix socket exchange with the requester.
//!
//! Every pending request is a `SOCK_SEQPACKET` listener at
//! `{sock_dir}/{request_id}`, created by the requester. Message boundaries
//! are preserved, so one `read` is one message.
//!
//! # Protocol
//!
//! ```text
//! requester (RequestEndpoint)          relay (UnixChannel)
//!   accept ◄──────────────────────────── connect
//!   write request ─────────────────────► read_request: read once, close
//!   read → 0 bytes (probe), loop
//!   accept ◄──────────────────────────── connect
//!   write request ─────────────────────► send_reply: read once (drain)
//!   read reply ◄──────────────────────── write reply once
//! ```
//!
//! The requester writes before it reads, so a reply writer must consume
//! that message first. Nothing here retries; callers own retry and timeout
//! policy.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::constants::{ENDPOINT_BACKLOG, ENDPOINT_MODE, MAX_MESSAGE_SIZE, MAX_SOCKET_PATH};
use crate::request::RequestId;

/// Errors from the local IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Socket path does not fit in `sun_path`.
    #[error("socket path too long ({len} bytes, max {max}): {}", .path.display(), max = MAX_SOCKET_PATH - 1)]
    PathTooLong {
        /// Offending path.
        path: PathBuf,
        /// Its length in bytes.
        len: usize,
    },
    /// Could not create or bind the requester's listener.
    #[error("failed to bind {}: {source}", .path.display())]
    Bind {
        /// Endpoint path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Could not connect to the endpoint.
    #[error("failed to connect to {}: {source}", .path.display())]
    Connect {
        /// Endpoint path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Accepting a connection failed.
    #[error("failed to accept on {}: {source}", .path.display())]
    Accept {
        /// Endpoint path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Reading a message failed.
    #[error("failed to read from {}: {source}", .path.display())]
    Read {
        /// Endpoint path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Writing a message failed.
    #[error("failed to write to {}: {source}", .path.display())]
    Write {
        /// Endpoint path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The peer closed the connection without sending a message.
    #[error("peer at {} closed without sending a message", .0.display())]
    Closed(PathBuf),
    /// Message does not fit in a single read.
    #[error("message of {0} bytes exceeds the {max} byte limit", max = MAX_MESSAGE_SIZE)]
    TooLarge(usize),
    /// Zero-length messages are indistinguishable from a closed peer.
    #[error("refusing to send an empty reply")]
    EmptyReply,
}

/// Endpoint path for a request id.
pub fn endpoint_path(sock_dir: &Path, id: &RequestId) -> PathBuf {
    sock_dir.join(id.as_str())
}

fn check_path(path: &Path) -> Result<(), IpcError> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        return Err(IpcError::PathTooLong {
            path: path.to_path_buf(),
            len,
        });
    }
    Ok(())
}

fn seqpacket_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Connect to a requester endpoint.
///
/// The socket is non-blocking before `connect`, so a listener with a full
/// backlog yields an error instead of stalling the runtime.
fn connect(path: &Path) -> Result<UnixStream, IpcError> {
    check_path(path)?;
    let connect_err = |source| IpcError::Connect {
        path: path.to_path_buf(),
        source,
    };
    let socket = seqpacket_socket().map_err(connect_err)?;
    let addr = SockAddr::unix(path).map_err(connect_err)?;
    socket.connect(&addr).map_err(connect_err)?;
    let stream: std::os::unix::net::UnixStream = socket.into();
    UnixStream::from_std(stream).map_err(connect_err)
}

/// Read one message (up to [`MAX_MESSAGE_SIZE`] bytes).
async fn read_message(stream: &mut UnixStream, path: &Path) -> Result<Vec<u8>, IpcError> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let n = stream.read(&mut buf).await.map_err(|source| IpcError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    buf.truncate(n);
    Ok(buf)
}

/// Connect to `path` and read the request message once.
pub async fn read_request(path: &Path) -> Result<Vec<u8>, IpcError> {
    let mut stream = connect(path)?;
    let payload = read_message(&mut stream, path).await?;
    if payload.is_empty() {
        return Err(IpcError::Closed(path.to_path_buf()));
    }
    log::debug!("[Ipc] Read {} byte request from {}", payload.len(), path.display());
    Ok(payload)
}

/// Connect to `path`, drain the pending request message, then write
/// `payload` as one message.
pub async fn send_reply(path: &Path, payload: &[u8]) -> Result<(), IpcError> {
    if payload.is_empty() {
        return Err(IpcError::EmptyReply);
    }
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::TooLarge(payload.len()));
    }

    let mut stream = connect(path)?;
    let drained = read_message(&mut stream, path).await?;
    if drained.is_empty() {
        return Err(IpcError::Closed(path.to_path_buf()));
    }
    stream
        .write_all(payload)
        .await
        .map_err(|source| IpcError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    log::debug!("[Ipc] Wrote {} byte reply to {}", payload.len(), path.display());
    Ok(())
}

/// Request/reply access to requester endpoints, keyed by request id.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Read the request payload once.
    async fn read_request(&self, id: &RequestId) -> Result<Vec<u8>, IpcError>;

    /// Deliver the reply once.
    async fn send_reply(&self, id: &RequestId, payload: &[u8]) -> Result<(), IpcError>;
}

/// [`RequestChannel`] over the endpoints in a socket directory.
#[derive(Debug, Clone)]
pub struct UnixChannel {
    sock_dir: PathBuf,
}

impl UnixChannel {
    /// Channel for endpoints under `sock_dir`.
    pub fn new(sock_dir: impl Into<PathBuf>) -> Self {
        Self {
            sock_dir: sock_dir.into(),
        }
    }
}

#[async_trait]
impl RequestChannel for UnixChannel {
    async fn read_request(&self, id: &RequestId) -> Result<Vec<u8>, IpcError> {
        read_request(&endpoint_path(&self.sock_dir, id)).await
    }

    async fn send_reply(&self, id: &RequestId, payload: &[u8]) -> Result<(), IpcError> {
        send_reply(&endpoint_path(&self.sock_dir, id), payload).await
    }
}

/// Requester side of the exchange.
///
/// Binds the endpoint, hands the request to every connection, and waits
/// for the first connection that writes something back. The socket file is
/// removed on drop.
#[derive(Debug)]
pub struct RequestEndpoint {
    id: RequestId,
    path: PathBuf,
    listener: UnixListener,
}

impl RequestEndpoint {
    /// Bind `{sock_dir}/{id}` with mode 0660.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(sock_dir: &Path, id: RequestId) -> Result<Self, IpcError> {
        let path = endpoint_path(sock_dir, &id);
        check_path(&path)?;
        let bind_err = |source| IpcError::Bind {
            path: path.clone(),
            source,
        };

        let socket = seqpacket_socket().map_err(bind_err)?;
        let addr = SockAddr::unix(&path).map_err(bind_err)?;
        socket.bind(&addr).map_err(bind_err)?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(ENDPOINT_MODE))
                .map_err(bind_err)?;
        }

        socket.listen(ENDPOINT_BACKLOG).map_err(bind_err)?;
        let listener: std::os::unix::net::UnixListener = socket.into();
        let listener = UnixListener::from_std(listener).map_err(bind_err)?;

        log::info!("[Ipc] Request endpoint listening on {}", path.display());
        Ok(Self { id, path, listener })
    }

    /// Request id (endpoint file name).
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Endpoint path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve `request` until some connection replies; return the reply.
    ///
    /// Connections that close without writing are probes or read-only
    /// readers and are skipped. Per-connection I/O errors are logged and
    /// skipped. Never returns on its own if nobody replies; wrap it in a
    /// timeout.
    pub async fn serve(&self, request: &[u8]) -> Result<Vec<u8>, IpcError> {
        loop {
            let (mut stream, _addr) =
                self.listener
                    .accept()
                    .await
                    .map_err(|source| IpcError::Accept {
                        path: self.path.clone(),
                        source,
                    })?;

            if let Err(e) = stream.write_all(request).await {
                log::warn!("[Ipc] Failed to hand request to peer: {e}");
                continue;
            }

            match read_message(&mut stream, &self.path).await {
                Ok(reply) if reply.is_empty() => {
                    log::debug!("[Ipc] Peer closed without replying, waiting for another");
                }
                Ok(reply) => return Ok(reply),
                Err(e) => log::warn!("[Ipc] {e}"),
            }
        }
    }
}

impl Drop for RequestEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("[Ipc] Failed to remove {}: {e}", self.path.display());
        }
    }
}
