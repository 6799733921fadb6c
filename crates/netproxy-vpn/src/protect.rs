//! Socket Protection
//!
//! Every socket the tunnel processor opens towards the upstream proxy or
//! server has to bypass the tunnel, otherwise its packets are routed back
//! into the tunnel and the session loops on itself.
//!
//! The platform supplies a [`ProtectDelegate`]; the [`SocketProtector`]
//! holds the one currently installed and is shared with the processor.
//!
//! ```rust,ignore
//! let protector = SocketProtector::new();
//! assert!(!protector.protect(SocketHandle(7))); // nothing installed yet
//!
//! protector.set_active_delegate(Some(platform.protect_delegate()));
//! let stream = connect_protected(&protector, upstream, Duration::from_secs(10))?;
//! ```

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// OS-level socket handle (file descriptor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub i32);

#[cfg(unix)]
impl SocketHandle {
    pub fn of<S: std::os::fd::AsRawFd>(socket: &S) -> Self {
        Self(socket.as_raw_fd())
    }
}

impl std::fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd={}", self.0)
    }
}

/// Platform hook that exempts a socket from tunnel routing
pub trait ProtectDelegate: Send + Sync {
    /// Returns whether the platform accepted the request
    fn protect(&self, socket: SocketHandle) -> bool;
}

impl<F> ProtectDelegate for F
where
    F: Fn(SocketHandle) -> bool + Send + Sync,
{
    fn protect(&self, socket: SocketHandle) -> bool {
        self(socket)
    }
}

/// Socket protection failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtectError {
    #[error("No protect delegate installed ({0})")]
    NoDelegate(SocketHandle),

    #[error("Platform refused to protect socket {0}")]
    Refused(SocketHandle),

    #[error("Socket error: {0}")]
    Socket(String),
}

/// Registry of the active protect delegate
#[derive(Default)]
pub struct SocketProtector {
    delegate: RwLock<Option<Arc<dyn ProtectDelegate>>>,
}

impl SocketProtector {
    /// Create a protector with no delegate
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (`Some`) or clear (`None`) the platform delegate
    pub fn set_active_delegate(&self, delegate: Option<Arc<dyn ProtectDelegate>>) {
        let installed = delegate.is_some();
        *self.delegate.write() = delegate;
        if installed {
            debug!("Socket protect delegate installed");
        } else {
            debug!("Socket protect delegate cleared");
        }
    }

    /// Whether a delegate is installed
    pub fn has_delegate(&self) -> bool {
        self.delegate.read().is_some()
    }

    /// Exempt `socket` from the tunnel.
    ///
    /// Returns `false` when no delegate is installed; the processor may
    /// still be opening sockets while a session tears down.
    pub fn protect(&self, socket: SocketHandle) -> bool {
        self.try_protect(socket).is_ok()
    }

    /// Exempt `socket`, reporting why protection failed
    pub fn try_protect(&self, socket: SocketHandle) -> Result<(), ProtectError> {
        // Never call into the platform with the lock held
        let delegate = self.delegate.read().clone();
        let Some(delegate) = delegate else {
            warn!("No protect delegate for socket {}", socket);
            return Err(ProtectError::NoDelegate(socket));
        };

        if delegate.protect(socket) {
            Ok(())
        } else {
            warn!("Socket {} protection failed", socket);
            Err(ProtectError::Refused(socket))
        }
    }
}

impl std::fmt::Debug for SocketProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketProtector")
            .field("has_delegate", &self.has_delegate())
            .finish()
    }
}

/// Open a TCP connection that bypasses the tunnel.
///
/// The socket is protected before `connect`; a refused protection aborts
/// the attempt so the caller can retry or fail the upstream connection.
#[cfg(unix)]
pub fn connect_protected(
    protector: &SocketProtector,
    addr: std::net::SocketAddr,
    timeout: std::time::Duration,
) -> Result<std::net::TcpStream, ProtectError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ProtectError::Socket(e.to_string()))?;
    protector.try_protect(SocketHandle::of(&socket))?;

    socket
        .connect_timeout(&addr.into(), timeout)
        .map_err(|e| ProtectError::Socket(e.to_string()))?;
    Ok(socket.into())
}

/// Bind a UDP socket that bypasses the tunnel.
#[cfg(unix)]
pub fn bind_protected_udp(
    protector: &SocketProtector,
    local: std::net::SocketAddr,
) -> Result<std::net::UdpSocket, ProtectError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ProtectError::Socket(e.to_string()))?;
    protector.try_protect(SocketHandle::of(&socket))?;

    socket
        .bind(&local.into())
        .map_err(|e| ProtectError::Socket(e.to_string()))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_no_delegate() {
        let protector = SocketProtector::new();

        assert!(!protector.has_delegate());
        assert!(!protector.protect(SocketHandle(3)));
        assert_eq!(
            protector.try_protect(SocketHandle(3)),
            Err(ProtectError::NoDelegate(SocketHandle(3)))
        );
    }

    #[test]
    fn test_delegate_result_passed_through() {
        let protector = SocketProtector::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        protector.set_active_delegate(Some(Arc::new(move |socket: SocketHandle| {
            seen.fetch_add(1, Ordering::SeqCst);
            socket.0 % 2 == 0
        })));

        assert!(protector.protect(SocketHandle(4)));
        assert!(!protector.protect(SocketHandle(5)));
        assert_eq!(
            protector.try_protect(SocketHandle(5)),
            Err(ProtectError::Refused(SocketHandle(5)))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cleared_delegate() {
        let protector = SocketProtector::new();
        protector.set_active_delegate(Some(Arc::new(|_: SocketHandle| true)));
        assert!(protector.protect(SocketHandle(1)));

        protector.set_active_delegate(None);
        assert!(!protector.has_delegate());
        assert!(!protector.protect(SocketHandle(1)));
    }

    #[cfg(unix)]
    #[test]
    fn test_connect_protected() {
        use std::time::Duration;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let protector = SocketProtector::new();

        let result = connect_protected(&protector, addr, Duration::from_secs(2));
        assert!(matches!(result, Err(ProtectError::NoDelegate(_))));

        let protected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = protected.clone();
        protector.set_active_delegate(Some(Arc::new(move |socket: SocketHandle| {
            record.lock().push(socket);
            true
        })));

        let stream = connect_protected(&protector, addr, Duration::from_secs(2)).unwrap();
        assert_eq!(protected.lock().as_slice(), &[SocketHandle::of(&stream)]);
    }

    #[cfg(unix)]
    #[test]
    fn test_udp_refused() {
        let protector = SocketProtector::new();
        protector.set_active_delegate(Some(Arc::new(|_: SocketHandle| false)));

        let result = bind_protected_udp(&protector, "127.0.0.1:0".parse().unwrap());
        assert!(matches!(result, Err(ProtectError::Refused(_))));
    }
}
