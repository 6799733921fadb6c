//! Interface Builder
//!
//! Applies a session's routing and application policy to a platform
//! builder and establishes the tunnel interface.
//!
//! Order of operations:
//!
//! 1. Base interface: virtual address, MTU, catch-all route, blocking I/O
//! 2. Exclude-routes (best effort, only if the platform supports them)
//! 3. Application policy: allowed *or* disallowed apps, never both
//! 4. Advertised HTTP proxy (if requested and supported)
//! 5. Unmetered (if supported)
//! 6. Establish

use crate::apps::{self, AppFilterMode, AppFilterPolicy};
use crate::config::{AppId, HostSettings, SessionConfig};
use crate::platform::{PlatformError, TunBuilder, VpnPlatform};
use crate::routes::{self, ExcludeRoute};
use crate::tunnel::TunnelHandle;
use ipnet::{IpNet, Ipv4Net};
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

/// Interface establishment failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to configure interface: {0}")]
    Configure(PlatformError),

    #[error("Failed to establish interface: {0}")]
    Establish(PlatformError),
}

/// Resolved policy of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePlan {
    pub exclude_routes: Vec<ExcludeRoute>,
    pub app_filter: AppFilterPolicy,
}

impl InterfacePlan {
    /// Compute the policy for `config` without touching the platform
    pub fn resolve(platform: &dyn VpnPlatform, config: &SessionConfig) -> Self {
        let exclude_routes = if config.pass_through_entries.is_empty() {
            Vec::new()
        } else {
            routes::resolve(&config.pass_through_entries)
        };
        let app_filter = apps::resolve(
            &platform.own_app_id(),
            config.allowed_apps.as_ref(),
            config.disallowed_apps.as_ref(),
        );

        Self {
            exclude_routes,
            app_filter,
        }
    }
}

/// Builds tunnel interfaces on a platform
pub struct InterfaceBuilder<'a> {
    platform: &'a dyn VpnPlatform,
    settings: &'a HostSettings,
}

impl<'a> InterfaceBuilder<'a> {
    pub fn new(platform: &'a dyn VpnPlatform, settings: &'a HostSettings) -> Self {
        Self { platform, settings }
    }

    /// Configure and establish the interface for `config`.
    ///
    /// May block on the platform (consent prompts); never call it from a
    /// UI thread.
    pub fn build(&self, config: &SessionConfig, mtu: u32) -> Result<TunnelHandle, BuildError> {
        let capabilities = self.platform.capabilities();
        let plan = InterfacePlan::resolve(self.platform, config);
        let mut builder = self.platform.new_builder();

        self.configure_base(builder.as_mut(), mtu)
            .map_err(BuildError::Configure)?;

        if capabilities.exclude_routes {
            apply_exclude_routes(builder.as_mut(), &plan.exclude_routes);
        } else if !plan.exclude_routes.is_empty() {
            debug!(
                "Platform cannot exclude routes, ignoring {} pass-through routes",
                plan.exclude_routes.len()
            );
        }

        apply_app_filter(builder.as_mut(), &plan.app_filter, &self.platform.own_app_id())
            .map_err(BuildError::Configure)?;

        if config.enable_system_proxy && capabilities.http_proxy {
            debug!("Set system proxy {}", config.proxy_endpoint());
            if let Err(e) = builder.set_http_proxy(&config.proxy_host, config.proxy_port) {
                warn!("Failed to set system proxy: {}", e);
            }
        }

        if capabilities.metering {
            if let Err(e) = builder.set_metered(false) {
                warn!("Failed to mark interface unmetered: {}", e);
            }
        }

        match builder.establish() {
            Ok(device) => {
                info!(
                    "Tunnel interface established ({} excluded routes, {:?} of {} apps)",
                    plan.exclude_routes.len(),
                    plan.app_filter.mode,
                    plan.app_filter.identifiers.len()
                );
                Ok(TunnelHandle::new(device))
            }
            Err(e) => {
                error!("Tunnel interface establish failed: {}", e);
                Err(BuildError::Establish(e))
            }
        }
    }

    fn configure_base(&self, builder: &mut dyn TunBuilder, mtu: u32) -> Result<(), PlatformError> {
        builder.set_mtu(mtu)?;
        builder.add_address(
            IpAddr::V4(self.settings.virtual_address),
            self.settings.virtual_prefix,
        )?;
        builder.add_route(IpNet::V4(Ipv4Net::default()))?;
        builder.set_session(&self.settings.session_name)?;
        builder.set_blocking(true)?;
        Ok(())
    }
}

fn apply_exclude_routes(builder: &mut dyn TunBuilder, routes: &[ExcludeRoute]) {
    for route in routes {
        match builder.exclude_route(route.network) {
            Ok(()) => debug!("Added exclude route {}", route),
            Err(e) => warn!("Exclude route {} rejected: {}", route, e),
        }
    }
}

/// Issue the application directives of `policy`.
///
/// Unknown apps are skipped, but the hosting app must end up outside the
/// tunnel: an allow-list with no accepted entry degrades to excluding
/// `own_app`, and a rejected exclusion of `own_app` is fatal.
fn apply_app_filter(
    builder: &mut dyn TunBuilder,
    policy: &AppFilterPolicy,
    own_app: &AppId,
) -> Result<(), PlatformError> {
    match policy.mode {
        AppFilterMode::AllowList => {
            let mut accepted = 0;
            for app in &policy.identifiers {
                match builder.add_allowed_application(app) {
                    Ok(()) => accepted += 1,
                    Err(e) => warn!("Application {} skipped: {}", app, e),
                }
            }
            if accepted == 0 {
                warn!("No allowed application accepted, excluding {} only", own_app);
                builder.add_disallowed_application(own_app)?;
            }
        }
        AppFilterMode::DisallowList => {
            for app in &policy.identifiers {
                match builder.add_disallowed_application(app) {
                    Ok(()) => {}
                    Err(e) if app == own_app => return Err(e),
                    Err(e) => warn!("Application {} skipped: {}", app, e),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Capabilities;
    use crate::simulated::{BuilderCall, SimulatedPlatform};

    fn settings() -> HostSettings {
        HostSettings::default()
    }

    #[test]
    fn test_base_interface() {
        let platform = SimulatedPlatform::new("com.self");
        let settings = settings();
        let config = SessionConfig::new("127.0.0.1", 9099).with_system_proxy(false);

        InterfaceBuilder::new(&platform, &settings)
            .build(&config, 1500)
            .unwrap();

        let calls = platform.last_interface().unwrap();
        assert_eq!(calls[0], BuilderCall::Mtu(1500));
        assert!(calls.contains(&BuilderCall::Address("10.0.0.2".parse().unwrap(), 32)));
        assert!(calls.contains(&BuilderCall::Route("0.0.0.0/0".parse().unwrap())));
        assert!(calls.contains(&BuilderCall::Blocking(true)));
        assert!(calls.contains(&BuilderCall::Session("NetProxy".into())));
        assert!(calls.contains(&BuilderCall::Metered(false)));
        assert!(!calls.iter().any(|c| matches!(c, BuilderCall::HttpProxy(..))));
        assert_eq!(
            calls.last(),
            Some(&BuilderCall::Metered(false))
        );
        assert!(calls.contains(&BuilderCall::Disallowed(AppId::from("com.self"))));
    }

    #[test]
    fn test_exclude_routes_and_proxy() {
        let platform = SimulatedPlatform::new("com.self");
        platform.reject_route("10.0.0.0/8".parse().unwrap());
        let settings = settings();
        let config = SessionConfig::new("127.0.0.1", 9099).with_pass_through([
            "10.0.0.0/8",
            "192.168.0.0/16",
            "example.com",
            "8.8.8.8",
        ]);

        InterfaceBuilder::new(&platform, &settings)
            .build(&config, 1500)
            .unwrap();

        let calls = platform.last_interface().unwrap();
        let excluded: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                BuilderCall::ExcludeRoute(net) => Some(net.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(excluded, vec!["192.168.0.0/16", "8.8.8.8/32"]);
        assert!(calls.contains(&BuilderCall::HttpProxy("127.0.0.1".into(), 9099)));
    }

    #[test]
    fn test_capabilities_gate_optional_steps() {
        let platform = SimulatedPlatform::new("com.self").with_capabilities(Capabilities::none());
        let settings = settings();
        let config = SessionConfig::new("127.0.0.1", 9099).with_pass_through(["192.168.0.0/16"]);

        InterfaceBuilder::new(&platform, &settings)
            .build(&config, 1400)
            .unwrap();

        let calls = platform.last_interface().unwrap();
        assert!(!calls.iter().any(|c| matches!(
            c,
            BuilderCall::ExcludeRoute(_) | BuilderCall::HttpProxy(..) | BuilderCall::Metered(_)
        )));
    }

    #[test]
    fn test_only_one_app_directive_kind() {
        let platform = SimulatedPlatform::new("com.self");
        let settings = settings();
        let config = SessionConfig::new("127.0.0.1", 9099)
            .with_allowed_apps(["com.a", "com.self"])
            .with_disallowed_apps(["com.a", "com.b"]);

        InterfaceBuilder::new(&platform, &settings)
            .build(&config, 1500)
            .unwrap();

        let calls = platform.last_interface().unwrap();
        assert!(calls.contains(&BuilderCall::Allowed(AppId::from("com.a"))));
        assert!(!calls.iter().any(|c| matches!(c, BuilderCall::Disallowed(_))));
    }

    #[test]
    fn test_establish_failure() {
        let platform = SimulatedPlatform::new("com.self");
        platform.fail_establish(Some(PlatformError::ConflictingVpn));
        let settings = settings();

        let result = InterfaceBuilder::new(&platform, &settings)
            .build(&SessionConfig::new("127.0.0.1", 9099), 1500);

        assert_eq!(result.unwrap_err(), BuildError::Establish(PlatformError::ConflictingVpn));
        assert_eq!(platform.established_count(), 0);
    }

    #[test]
    fn test_unknown_allowed_apps_keep_self_excluded() {
        let platform = SimulatedPlatform::new("com.self");
        platform.forget_app("com.gone");
        let settings = settings();
        let config = SessionConfig::new("127.0.0.1", 9099).with_allowed_apps(["com.gone"]);

        InterfaceBuilder::new(&platform, &settings)
            .build(&config, 1500)
            .unwrap();

        let calls = platform.last_interface().unwrap();
        assert!(!calls.iter().any(|c| matches!(c, BuilderCall::Allowed(_))));
        assert!(calls.contains(&BuilderCall::Disallowed(AppId::from("com.self"))));
    }

    #[test]
    fn test_partially_known_allow_list() {
        let platform = SimulatedPlatform::new("com.self");
        platform.forget_app("com.gone");
        let settings = settings();
        let config =
            SessionConfig::new("127.0.0.1", 9099).with_allowed_apps(["com.gone", "com.browser"]);

        InterfaceBuilder::new(&platform, &settings)
            .build(&config, 1500)
            .unwrap();

        let calls = platform.last_interface().unwrap();
        assert!(calls.contains(&BuilderCall::Allowed(AppId::from("com.browser"))));
        assert!(!calls.iter().any(|c| matches!(c, BuilderCall::Disallowed(_))));
    }

    #[test]
    fn test_rejected_self_exclusion_is_fatal() {
        let platform = SimulatedPlatform::new("com.self");
        platform.forget_app("com.self");
        platform.forget_app("com.gone");
        let settings = settings();
        let config = SessionConfig::new("127.0.0.1", 9099).with_disallowed_apps(["com.gone"]);

        let result = InterfaceBuilder::new(&platform, &settings).build(&config, 1500);

        assert_eq!(
            result.unwrap_err(),
            BuildError::Configure(PlatformError::UnknownApplication(AppId::from("com.self")))
        );
        assert_eq!(platform.established_count(), 0);
    }
}
