//! Per-application tunnel policy.
//!
//! The hosting application (the proxy itself) must never have its traffic
//! captured, whatever the user selected.

use crate::config::AppId;
use std::collections::BTreeSet;
use tracing::debug;

/// Which directive kind the interface receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppFilterMode {
    /// Only the listed applications enter the tunnel
    AllowList,
    /// Every application except the listed ones enters the tunnel
    DisallowList,
}

/// Final, conflict-free application policy for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppFilterPolicy {
    pub mode: AppFilterMode,
    pub identifiers: BTreeSet<AppId>,
}

impl AppFilterPolicy {
    /// Whether traffic of `app` would enter the tunnel
    pub fn tunnels(&self, app: &AppId) -> bool {
        match self.mode {
            AppFilterMode::AllowList => self.identifiers.contains(app),
            AppFilterMode::DisallowList => !self.identifiers.contains(app),
        }
    }
}

/// Resolve the allow/disallow lists into a single policy.
pub fn resolve(
    own_app: &AppId,
    allowed: Option<&BTreeSet<AppId>>,
    disallowed: Option<&BTreeSet<AppId>>,
) -> AppFilterPolicy {
    let allowed: BTreeSet<AppId> = allowed
        .into_iter()
        .flatten()
        .filter(|app| *app != own_app)
        .cloned()
        .collect();

    if !allowed.is_empty() {
        // Allow wins: disallow entries can neither remove an allowed app
        // nor be issued alongside the allow-list.
        if let Some(disallowed) = disallowed {
            for app in disallowed.intersection(&allowed) {
                debug!("Ignoring disallow for {} (also allowed)", app);
            }
        }
        return AppFilterPolicy {
            mode: AppFilterMode::AllowList,
            identifiers: allowed,
        };
    }

    let mut identifiers: BTreeSet<AppId> = disallowed.cloned().unwrap_or_default();
    identifiers.insert(own_app.clone());

    AppFilterPolicy {
        mode: AppFilterMode::DisallowList,
        identifiers,
    }
}
