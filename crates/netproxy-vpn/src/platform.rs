//! Platform Abstraction
//!
//! The OS side of the tunnel: an interface builder in the style of a VPN
//! service builder, capability queries in place of scattered version
//! checks, consent state, and the socket protect hook.

use crate::config::AppId;
use crate::protect::ProtectDelegate;
use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

/// Optional features of the running platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Routes can be excluded from the tunnel
    pub exclude_routes: bool,
    /// The interface can be marked unmetered
    pub metering: bool,
    /// An HTTP proxy can be advertised with the interface
    pub http_proxy: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            exclude_routes: true,
            metering: true,
            http_proxy: true,
        }
    }

    pub fn none() -> Self {
        Self {
            exclude_routes: false,
            metering: false,
            http_proxy: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Platform errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("VPN permission not granted")]
    PermissionDenied,

    #[error("Another VPN owns the routing table")]
    ConflictingVpn,

    #[error("Directive rejected: {0}")]
    Rejected(String),

    #[error("Unknown application: {0}")]
    UnknownApplication(AppId),

    #[error("Unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Establish failed: {0}")]
    Establish(String),
}

/// Established virtual interface (raw IP packets)
pub trait TunDevice: Send + Sync {
    /// Read one packet, blocking
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    fn write_packet(&self, packet: &[u8]) -> io::Result<usize>;

    /// Release the OS handle
    fn close(&self) -> io::Result<()>;
}

/// Accumulates interface configuration until [`TunBuilder::establish`]
pub trait TunBuilder: Send {
    fn set_mtu(&mut self, mtu: u32) -> Result<(), PlatformError>;

    fn add_address(&mut self, addr: IpAddr, prefix_len: u8) -> Result<(), PlatformError>;

    fn add_route(&mut self, network: IpNet) -> Result<(), PlatformError>;

    fn exclude_route(&mut self, network: IpNet) -> Result<(), PlatformError>;

    fn add_allowed_application(&mut self, app: &AppId) -> Result<(), PlatformError>;

    fn add_disallowed_application(&mut self, app: &AppId) -> Result<(), PlatformError>;

    fn set_http_proxy(&mut self, host: &str, port: u16) -> Result<(), PlatformError>;

    fn set_metered(&mut self, metered: bool) -> Result<(), PlatformError>;

    fn set_blocking(&mut self, blocking: bool) -> Result<(), PlatformError>;

    fn set_session(&mut self, name: &str) -> Result<(), PlatformError>;

    /// Create the interface. Atomic: on error nothing is left behind.
    fn establish(self: Box<Self>) -> Result<Box<dyn TunDevice>, PlatformError>;
}

/// The VPN facility of the host OS
pub trait VpnPlatform: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Identifier of the hosting application
    fn own_app_id(&self) -> AppId;

    /// Whether the user already consented to VPN creation
    fn is_prepared(&self) -> bool;

    /// Kick off the platform's consent flow; the caller re-issues start
    /// once it completes
    fn request_consent(&self);

    fn new_builder(&self) -> Box<dyn TunBuilder>;

    /// Delegate installed into the socket protector while a session runs
    fn protect_delegate(&self) -> Arc<dyn ProtectDelegate>;

    /// A session became active (foreground notice)
    fn session_started(&self) {}

    /// The active session ended
    fn session_stopped(&self) {}
}
