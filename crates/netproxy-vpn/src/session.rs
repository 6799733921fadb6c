//! Session Controller
//!
//! Owns the one tunnel session of the process and drives it through
//! `Idle → Establishing → Running → Stopping → Idle`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::new(platform, processor, HostSettings::default());
//!
//! controller.start(SessionConfig::new("127.0.0.1", 9099))?;
//! assert!(controller.is_running());
//!
//! controller.stop();
//! controller.stop(); // no-op
//! ```
//!
//! # Ordering
//!
//! The protect delegate is installed before the processor sees the tunnel
//! and is cleared only after the processor has been joined (or the bounded
//! wait expired). The tunnel handle is closed last, once nothing else holds it.

use crate::builder::{BuildError, InterfaceBuilder};
use crate::config::{ConfigError, HostSettings, SessionConfig};
use crate::platform::VpnPlatform;
use crate::processor::{ProcessorContext, ProcessorError, ProcessorWorker, TunnelProcessor};
use crate::protect::SocketProtector;
use crate::tunnel::{TunnelHandle, TunnelStats};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Idle,
    /// Interface is being built
    Establishing,
    /// Tunnel is up and the processor runs
    Running,
    /// Processor is being stopped
    Stopping,
}

impl SessionState {
    /// Tunnel is up
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// No session, a start is accepted
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session already active ({0:?})")]
    AlreadyActive(SessionState),

    #[error("Previous tunnel still held by its processor")]
    TunnelStillHeld,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Tunnel could not be established: {0}")]
    Establish(#[from] BuildError),

    #[error("Tunnel processor error: {0}")]
    Processor(#[from] ProcessorError),
}

struct ActiveSession {
    config: Arc<SessionConfig>,
    tunnel: Arc<TunnelHandle>,
    protector: Arc<SocketProtector>,
    worker: ProcessorWorker,
    started_at: Instant,
}

#[derive(Default)]
struct Inner {
    active: Option<ActiveSession>,
    last_config: Option<Arc<SessionConfig>>,
    /// Tunnel of a stopped session whose processor has not let go yet
    unreleased: Option<Weak<TunnelHandle>>,
}

impl Inner {
    fn tunnel_still_held(&mut self) -> bool {
        if self.unreleased.as_ref().is_some_and(|t| t.strong_count() > 0) {
            return true;
        }
        self.unreleased = None;
        false
    }

    /// Close `tunnel`, or remember it until its last holder lets go
    fn release(&mut self, tunnel: Arc<TunnelHandle>) {
        match Arc::try_unwrap(tunnel) {
            Ok(tunnel) => {
                if let Err(e) = tunnel.close() {
                    warn!("Failed to close tunnel interface: {}", e);
                }
            }
            Err(tunnel) => {
                warn!("Tunnel still held by processor, closing on release");
                self.unreleased = Some(Arc::downgrade(&tunnel));
            }
        }
    }
}

/// Tunnel session state machine
pub struct SessionController {
    platform: Arc<dyn VpnPlatform>,
    processor: Arc<dyn TunnelProcessor>,
    /// Protector of the current or most recent session
    protector: RwLock<Arc<SocketProtector>>,
    settings: HostSettings,
    /// Readable at any time, written only with `inner` held
    state: RwLock<SessionState>,
    /// Serializes transitions
    inner: Mutex<Inner>,
}

impl SessionController {
    pub fn new(
        platform: Arc<dyn VpnPlatform>,
        processor: Arc<dyn TunnelProcessor>,
        settings: HostSettings,
    ) -> Self {
        Self {
            platform,
            processor,
            protector: RwLock::new(Arc::new(SocketProtector::new())),
            settings,
            state: RwLock::new(SessionState::Idle),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether a session is running
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Host settings this controller was created with
    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    /// Platform the sessions are built on
    pub fn platform(&self) -> &Arc<dyn VpnPlatform> {
        &self.platform
    }

    /// Protector handed to the current (or last) session's processor.
    ///
    /// Each session gets a fresh one; a stopped session's protector stays
    /// cleared.
    pub fn protector(&self) -> Arc<SocketProtector> {
        self.protector.read().clone()
    }

    /// Configuration of the running session
    pub fn active_config(&self) -> Option<Arc<SessionConfig>> {
        self.inner.lock().active.as_ref().map(|s| s.config.clone())
    }

    /// Most recently requested configuration, kept across stops
    pub fn last_config(&self) -> Option<Arc<SessionConfig>> {
        self.inner.lock().last_config.clone()
    }

    /// Remember `config` for a later start without starting now
    pub fn remember(&self, config: SessionConfig) {
        self.inner.lock().last_config = Some(Arc::new(config));
    }

    /// Time since the running session started
    pub fn uptime(&self) -> Option<Duration> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|s| s.started_at.elapsed())
    }

    /// Packet counters of the running session
    pub fn tunnel_stats(&self) -> Option<TunnelStats> {
        self.inner.lock().active.as_ref().map(|s| s.tunnel.stats())
    }

    /// Start a session. Only valid from `Idle`.
    ///
    /// Blocks while the platform establishes the interface.
    pub fn start(&self, config: SessionConfig) -> Result<(), SessionError> {
        config.validate()?;

        let mut inner = self.inner.lock();
        let current = self.state();
        if !current.is_idle() {
            warn!("Start rejected, session is {:?}", current);
            return Err(SessionError::AlreadyActive(current));
        }
        if inner.tunnel_still_held() {
            warn!("Start rejected, previous tunnel not yet released");
            return Err(SessionError::TunnelStillHeld);
        }

        info!(
            "Starting tunnel session via proxy {} (system proxy: {}, {} pass-through entries)",
            config.proxy_endpoint(),
            config.enable_system_proxy,
            config.pass_through_entries.len()
        );
        self.set_state(SessionState::Establishing);

        let config = Arc::new(config);
        inner.last_config = Some(config.clone());

        let tunnel = match InterfaceBuilder::new(self.platform.as_ref(), &self.settings)
            .build(&config, self.settings.mtu)
        {
            Ok(tunnel) => Arc::new(tunnel),
            Err(e) => {
                error!("Tunnel session not started: {}", e);
                self.set_state(SessionState::Idle);
                return Err(e.into());
            }
        };

        let protector = Arc::new(SocketProtector::new());
        protector.set_active_delegate(Some(self.platform.protect_delegate()));
        *self.protector.write() = protector.clone();

        let worker = ProcessorWorker::spawn(self.processor.clone(), |cancel| ProcessorContext {
            tunnel: tunnel.clone(),
            protector: protector.clone(),
            proxy_host: config.proxy_host.clone(),
            proxy_port: config.proxy_port,
            pass_through: config.pass_through_entries.clone(),
            cancel,
        });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                error!("Tunnel processor not started: {}", e);
                protector.set_active_delegate(None);
                inner.release(tunnel);
                self.set_state(SessionState::Idle);
                return Err(e.into());
            }
        };

        inner.active = Some(ActiveSession {
            config,
            tunnel,
            protector,
            worker,
            started_at: Instant::now(),
        });
        self.platform.session_started();
        self.set_state(SessionState::Running);

        info!("Tunnel session running");
        Ok(())
    }

    /// Stop the session. A no-op when already idle.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        let Some(active) = inner.active.take() else {
            debug!("Stop requested, no active session");
            return;
        };

        info!("Stopping tunnel session");
        self.set_state(SessionState::Stopping);

        let ActiveSession {
            tunnel,
            protector,
            worker,
            started_at,
            ..
        } = active;

        if !worker.join(self.settings.stop_timeout()) {
            // Protection fails from here on, so the processor's upstream
            // connects abort instead of looping through the tunnel.
            warn!("Clearing protect delegate with processor still running");
        }
        protector.set_active_delegate(None);
        inner.release(tunnel);

        self.platform.session_stopped();
        self.set_state(SessionState::Idle);

        info!("Tunnel session stopped after {:?}", started_at.elapsed());
    }

    /// Stop, then start with `config`.
    ///
    /// Observers may see `is_running() == false` in between.
    pub fn restart(&self, config: SessionConfig) -> Result<(), SessionError> {
        config.validate()?;
        self.stop();
        self.start(config)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        debug!("Session state {:?} -> {:?}", *current, state);
        *current = state;
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}
