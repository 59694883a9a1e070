//! Session endpoints and their assignment
//!
//! Every launch gets a fresh endpoint before the backend is spawned: either a
//! loopback TCP port reserved from the configured range or a unix-domain
//! socket path unique to the identity and launch. The reservation is held by
//! an [`EndpointLease`] and released when the lease is dropped.

use crate::auth::Identity;
use crate::config::{EndpointType, SessionConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Longest unix socket path accepted by `sockaddr_un` on common platforms
const MAX_SOCKET_PATH_LEN: usize = 100;

/// A connected byte stream to a backend, whatever the transport
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

/// Where a session backend listens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    pub async fn connect(&self) -> std::io::Result<Box<dyn BackendIo>> {
        match self {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix-domain sockets are not supported on this platform",
            )),
        }
    }

    /// Value for the `Host` header of forwarded requests
    pub fn host_header(&self) -> String {
        match self {
            Endpoint::Tcp(addr) => addr.to_string(),
            Endpoint::Unix(_) => "localhost".to_string(),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp(addr) => Some(addr.port()),
            Endpoint::Unix(_) => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AllocationError {
    #[error("no free port in range {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },
    #[error("cannot prepare socket directory {path}: {message}")]
    SocketDir { path: String, message: String },
    #[error("socket path {0} is too long")]
    PathTooLong(String),
}

enum Pool {
    Tcp {
        start: u16,
        end: u16,
        state: Mutex<PortState>,
    },
    Unix {
        dir: PathBuf,
        sequence: AtomicU64,
    },
}

struct PortState {
    reserved: HashSet<u16>,
    cursor: u16,
}

/// Hands out endpoints that no other live session is using
pub struct EndpointAllocator {
    pool: Pool,
}

impl EndpointAllocator {
    pub fn tcp(start: u16, end: u16) -> Arc<Self> {
        Arc::new(Self {
            pool: Pool::Tcp {
                start,
                end,
                state: Mutex::new(PortState {
                    reserved: HashSet::new(),
                    cursor: start,
                }),
            },
        })
    }

    pub fn unix(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            pool: Pool::Unix {
                dir: dir.into(),
                sequence: AtomicU64::new(1),
            },
        })
    }

    pub fn from_config(config: &SessionConfig) -> Arc<Self> {
        match config.endpoint {
            EndpointType::Tcp => Self::tcp(config.port_range_start, config.port_range_end),
            EndpointType::Unix => Self::unix(config.socket_dir()),
        }
    }

    /// Reserve an endpoint for a new session of `identity`
    pub fn allocate(self: &Arc<Self>, identity: &Identity) -> Result<EndpointLease, AllocationError> {
        let endpoint = match &self.pool {
            Pool::Tcp { start, end, state } => {
                let port = allocate_port(*start, *end, &mut state.lock())?;
                Endpoint::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            }
            Pool::Unix { dir, sequence } => {
                std::fs::create_dir_all(dir).map_err(|e| AllocationError::SocketDir {
                    path: dir.display().to_string(),
                    message: e.to_string(),
                })?;

                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                let path = dir.join(format!("{}-{}.sock", identity.file_safe(), seq));
                if path.as_os_str().len() > MAX_SOCKET_PATH_LEN {
                    return Err(AllocationError::PathTooLong(path.display().to_string()));
                }
                // Left behind by a previous gateway run
                if path.exists() {
                    warn!(path = %path.display(), "Removing stale session socket");
                    let _ = std::fs::remove_file(&path);
                }
                Endpoint::Unix(path)
            }
        };

        debug!(%identity, %endpoint, "Endpoint assigned");
        Ok(EndpointLease {
            endpoint,
            allocator: Arc::clone(self),
        })
    }

    /// Number of TCP ports currently reserved
    pub fn reserved_ports(&self) -> usize {
        match &self.pool {
            Pool::Tcp { state, .. } => state.lock().reserved.len(),
            Pool::Unix { .. } => 0,
        }
    }

    fn release(&self, endpoint: &Endpoint) {
        match (&self.pool, endpoint) {
            (Pool::Tcp { state, .. }, Endpoint::Tcp(addr)) => {
                state.lock().reserved.remove(&addr.port());
            }
            (Pool::Unix { .. }, Endpoint::Unix(path)) => {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "Failed to remove session socket");
                    }
                }
            }
            _ => {}
        }
        debug!(%endpoint, "Endpoint released");
    }
}

fn allocate_port(start: u16, end: u16, state: &mut PortState) -> Result<u16, AllocationError> {
    let span = (end as u32).saturating_sub(start as u32) + 1;

    for _ in 0..span {
        let port = state.cursor;
        state.cursor = if port >= end { start } else { port + 1 };

        if !state.reserved.contains(&port) && is_port_available(port) {
            state.reserved.insert(port);
            return Ok(port);
        }
    }

    Err(AllocationError::PortsExhausted { start, end })
}

/// Check if a port is free on loopback
fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Exclusive use of an endpoint until dropped
pub struct EndpointLease {
    endpoint: Endpoint,
    allocator: Arc<EndpointAllocator>,
}

impl EndpointLease {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl std::fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EndpointLease").field(&self.endpoint).finish()
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.allocator.release(&self.endpoint);
    }
}
