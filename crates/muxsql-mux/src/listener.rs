use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionService};
use crate::error::{MuxError, Result};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[cfg(unix)]
const DEFAULT_SOCKET_MODE: u32 = 0o600;

enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixSocket),
}

/// Accepts physical connections and serves each one on its own task.
pub struct Listener<S: ConnectionService> {
    bound: Bound,
    service: Arc<S>,
    config: ConnectionConfig,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

impl<S: ConnectionService> Listener<S> {
    /// Bind a TCP listener.
    pub async fn bind_tcp(
        addr: impl ToSocketAddrs,
        service: Arc<S>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = ?listener.local_addr().ok(), "listening on tcp");
        Ok(Self::from_bound(Bound::Tcp(listener), service, config))
    }

    /// Bind a Unix domain socket. A stale socket file at `path` is replaced;
    /// any other existing file is an error.
    #[cfg(unix)]
    pub fn bind_unix(
        path: impl AsRef<Path>,
        service: Arc<S>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let socket = UnixSocket::bind(path.as_ref())?;
        Ok(Self::from_bound(Bound::Unix(socket), service, config))
    }

    fn from_bound(bound: Bound, service: Arc<S>, config: ConnectionConfig) -> Self {
        Self {
            bound,
            service,
            config,
            next_conn_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Bound TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.bound {
            Bound::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Bound::Unix(_) => None,
        }
    }

    /// Bound socket path, if this is a Unix listener.
    #[cfg(unix)]
    pub fn path(&self) -> Option<&Path> {
        match &self.bound {
            Bound::Unix(socket) => Some(&socket.path),
            Bound::Tcp(_) => None,
        }
    }

    /// Token that stops the accept loop and every connection it started.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token fires.
    ///
    /// Returns once every connection it started has closed its streams.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(open = self.connections.len(), "listener shutting down");
                    self.connections.close();
                    self.connections.wait().await;
                    debug!("all connections closed");
                    return Ok(());
                }
                accepted = self.accept_next() => {
                    if let Err(err) = accepted {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    async fn accept_next(&self) -> Result<()> {
        match &self.bound {
            Bound::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(error = %err, "could not set TCP_NODELAY");
                }
                self.spawn(stream, peer.to_string());
            }
            #[cfg(unix)]
            Bound::Unix(socket) => {
                let (stream, _addr) = socket.listener.accept().await?;
                self.spawn(stream, "unix".to_string());
            }
        }
        Ok(())
    }

    fn spawn<T>(&self, io: T, peer: String)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("conn-{id}");
        info!(conn = %conn_id, %peer, "accepted connection");

        let connection = Connection::new(
            conn_id.clone(),
            Arc::clone(&self.service),
            self.config.clone(),
        );
        let cancel = self.shutdown.child_token();
        self.connections.spawn(async move {
            match connection.serve_until(io, cancel).await {
                Ok(()) => debug!(conn = %conn_id, "connection finished"),
                Err(MuxError::HandshakeFailed { message, .. }) => {
                    info!(conn = %conn_id, %message, "connection refused")
                }
                Err(err) => info!(conn = %conn_id, error = %err, "connection ended"),
            }
        });
    }
}

#[cfg(unix)]
struct UnixSocket {
    listener: tokio::net::UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

#[cfg(unix)]
impl UnixSocket {
    fn bind(path: &Path) -> Result<Self> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};

        // Remove a stale socket, but never remove anything else.
        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if !metadata.file_type().is_socket() {
                return Err(MuxError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a unix socket", path.display()),
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(path)?;
        }

        let listener = tokio::net::UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(DEFAULT_SOCKET_MODE))?;
        let created = std::fs::symlink_metadata(path)?;
        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            created_inode: Some((created.dev(), created.ino())),
        })
    }
}

#[cfg(unix)]
impl Drop for UnixSocket {
    fn drop(&mut self) {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let Some((dev, ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket() && metadata.dev() == dev && metadata.ino() == ino {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}
