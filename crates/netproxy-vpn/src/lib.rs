//! NetProxy VPN - Tunnel session and routing policy
//!
//! Routes device traffic into a local intercepting proxy through a virtual
//! interface. This crate decides which packets enter the tunnel, which
//! destinations and applications bypass it, keeps the proxy's own upstream
//! sockets out of it, and manages the session lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   Command    ┌───────────────────┐
//! │   UI layer   │─────────────▶│    VpnService     │
//! └──────────────┘              └─────────┬─────────┘
//!                                         ▼
//!                               ┌───────────────────┐
//!                               │ SessionController │
//!                               └──┬─────────────┬──┘
//!          routes::resolve ◀───────┤             │ spawn
//!          apps::resolve   ◀───────┤             ▼
//!                       ┌──────────▼───────┐  ┌─────────────────┐
//!                       │ InterfaceBuilder │  │ TunnelProcessor │
//!                       └──────────┬───────┘  └───┬─────────┬───┘
//!                                  ▼  TunnelHandle│         │ protect()
//!                       ┌──────────────────┐      │  ┌──────▼──────────┐
//!                       │   VpnPlatform    │◀─────┘  │ SocketProtector │
//!                       └──────────────────┘         └─────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one session per controller, transitions serialized
//! - The hosting application never enters the tunnel
//! - Loopback is never excluded from the tunnel
//! - The protect delegate outlives the processor's use of the tunnel

mod apps;
mod builder;
mod command;
mod config;
mod platform;
mod processor;
mod protect;
mod routes;
mod session;
pub mod simulated;
mod tunnel;

pub use apps::{AppFilterMode, AppFilterPolicy};
pub use builder::{BuildError, InterfaceBuilder, InterfacePlan};
pub use command::{Command, CommandError, CommandOutput, VpnService};
pub use config::{AppId, CommandArgs, ConfigError, HostSettings, SessionConfig};
pub use platform::{Capabilities, PlatformError, TunBuilder, TunDevice, VpnPlatform};
pub use processor::{
    CancelSignal, ProcessorContext, ProcessorError, ProcessorWorker, TunnelProcessor,
};
#[cfg(unix)]
pub use protect::{bind_protected_udp, connect_protected};
pub use protect::{ProtectDelegate, ProtectError, SocketHandle, SocketProtector};
pub use routes::{ExcludeRoute, RouteDirectiveError, RouteKind};
pub use session::{SessionController, SessionError, SessionState};
pub use tunnel::{TunnelHandle, TunnelStats};

/// Resolve pass-through entries into exclude-route directives
pub fn resolve_exclude_routes<I, S>(entries: I) -> Vec<ExcludeRoute>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    routes::resolve(entries)
}

/// Resolve allow/disallow lists into the session's application policy
pub fn resolve_app_filter(
    own_app: &AppId,
    allowed: Option<&std::collections::BTreeSet<AppId>>,
    disallowed: Option<&std::collections::BTreeSet<AppId>>,
) -> AppFilterPolicy {
    apps::resolve(own_app, allowed, disallowed)
}
