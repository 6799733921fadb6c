//! In-memory platform
//!
//! A [`VpnPlatform`] that records every builder call instead of touching
//! the OS, plus a processor that idles until cancelled. Used by the host
//! binary and by tests.

use crate::config::AppId;
use crate::platform::{Capabilities, PlatformError, TunBuilder, TunDevice, VpnPlatform};
use crate::processor::{ProcessorContext, ProcessorError, TunnelProcessor};
use crate::protect::{ProtectDelegate, SocketHandle};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// One accepted builder call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderCall {
    Mtu(u32),
    Address(IpAddr, u8),
    Route(IpNet),
    ExcludeRoute(IpNet),
    Allowed(AppId),
    Disallowed(AppId),
    HttpProxy(String, u16),
    Metered(bool),
    Blocking(bool),
    Session(String),
}

/// Shared close counter of a simulated device
#[derive(Debug, Clone, Default)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Simulated tunnel device
#[derive(Default)]
pub struct SimulatedDevice {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    closes: CloseCounter,
    open_devices: Option<Arc<AtomicUsize>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn tracked(open_devices: Arc<AtomicUsize>) -> Self {
        open_devices.fetch_add(1, Ordering::SeqCst);
        Self {
            open_devices: Some(open_devices),
            ..Self::default()
        }
    }

    pub fn close_counter(&self) -> CloseCounter {
        self.closes.clone()
    }

    /// Queue a packet for the next `read_packet`
    pub fn inject_packet(&self, packet: Vec<u8>) {
        self.inbound.lock().push_back(packet);
    }
}

impl TunDevice for SimulatedDevice {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound
            .lock()
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        Ok(packet.len())
    }

    fn close(&self) -> io::Result<()> {
        self.closes.0.fetch_add(1, Ordering::SeqCst);
        if let Some(open) = &self.open_devices {
            open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    prepared: AtomicBool,
    protect_result: AtomicBool,
    consent_requests: AtomicUsize,
    sessions_started: AtomicUsize,
    sessions_stopped: AtomicUsize,
    open_devices: Arc<AtomicUsize>,
    establish_failure: Mutex<Option<PlatformError>>,
    establish_delay: Mutex<Duration>,
    rejected_routes: Mutex<HashSet<IpNet>>,
    unknown_apps: Mutex<HashSet<AppId>>,
    interfaces: Mutex<Vec<Vec<BuilderCall>>>,
    protected: Mutex<Vec<SocketHandle>>,
}

/// Recording VPN platform
pub struct SimulatedPlatform {
    own_app: AppId,
    capabilities: Capabilities,
    shared: Arc<Shared>,
}

impl SimulatedPlatform {
    pub fn new(own_app: impl Into<AppId>) -> Self {
        let shared = Shared::default();
        shared.prepared.store(true, Ordering::SeqCst);
        shared.protect_result.store(true, Ordering::SeqCst);

        Self {
            own_app: own_app.into(),
            capabilities: Capabilities::all(),
            shared: Arc::new(shared),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn set_prepared(&self, prepared: bool) {
        self.shared.prepared.store(prepared, Ordering::SeqCst);
    }

    pub fn set_protect_result(&self, result: bool) {
        self.shared.protect_result.store(result, Ordering::SeqCst);
    }

    /// Make every following `establish` fail (or succeed again with `None`)
    pub fn fail_establish(&self, failure: Option<PlatformError>) {
        *self.shared.establish_failure.lock() = failure;
    }

    /// Hold every following `establish` for `delay`, like a slow platform
    pub fn set_establish_delay(&self, delay: Duration) {
        *self.shared.establish_delay.lock() = delay;
    }

    pub fn reject_route(&self, network: IpNet) {
        self.shared.rejected_routes.lock().insert(network);
    }

    pub fn forget_app(&self, app: impl Into<AppId>) {
        self.shared.unknown_apps.lock().insert(app.into());
    }

    pub fn consent_requests(&self) -> usize {
        self.shared.consent_requests.load(Ordering::SeqCst)
    }

    pub fn established_count(&self) -> usize {
        self.shared.interfaces.lock().len()
    }

    /// Devices established and not yet closed
    pub fn open_devices(&self) -> usize {
        self.shared.open_devices.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> usize {
        self.shared.sessions_started.load(Ordering::SeqCst)
    }

    pub fn sessions_stopped(&self) -> usize {
        self.shared.sessions_stopped.load(Ordering::SeqCst)
    }

    /// Builder calls of the most recently established interface
    pub fn last_interface(&self) -> Option<Vec<BuilderCall>> {
        self.shared.interfaces.lock().last().cloned()
    }

    pub fn protected_sockets(&self) -> Vec<SocketHandle> {
        self.shared.protected.lock().clone()
    }
}

impl VpnPlatform for SimulatedPlatform {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn own_app_id(&self) -> AppId {
        self.own_app.clone()
    }

    fn is_prepared(&self) -> bool {
        self.shared.prepared.load(Ordering::SeqCst)
    }

    fn request_consent(&self) {
        debug!("Simulated consent requested");
        self.shared.consent_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn new_builder(&self) -> Box<dyn TunBuilder> {
        Box::new(SimulatedBuilder {
            calls: Vec::new(),
            shared: self.shared.clone(),
        })
    }

    fn protect_delegate(&self) -> Arc<dyn ProtectDelegate> {
        let shared = self.shared.clone();
        Arc::new(move |socket: SocketHandle| {
            shared.protected.lock().push(socket);
            shared.protect_result.load(Ordering::SeqCst)
        })
    }

    fn session_started(&self) {
        self.shared.sessions_started.fetch_add(1, Ordering::SeqCst);
    }

    fn session_stopped(&self) {
        self.shared.sessions_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct SimulatedBuilder {
    calls: Vec<BuilderCall>,
    shared: Arc<Shared>,
}

impl SimulatedBuilder {
    fn record(&mut self, call: BuilderCall) -> Result<(), PlatformError> {
        self.calls.push(call);
        Ok(())
    }
}

impl TunBuilder for SimulatedBuilder {
    fn set_mtu(&mut self, mtu: u32) -> Result<(), PlatformError> {
        self.record(BuilderCall::Mtu(mtu))
    }

    fn add_address(&mut self, addr: IpAddr, prefix_len: u8) -> Result<(), PlatformError> {
        self.record(BuilderCall::Address(addr, prefix_len))
    }

    fn add_route(&mut self, network: IpNet) -> Result<(), PlatformError> {
        self.record(BuilderCall::Route(network))
    }

    fn exclude_route(&mut self, network: IpNet) -> Result<(), PlatformError> {
        if self.shared.rejected_routes.lock().contains(&network) {
            return Err(PlatformError::Rejected(network.to_string()));
        }
        self.record(BuilderCall::ExcludeRoute(network))
    }

    fn add_allowed_application(&mut self, app: &AppId) -> Result<(), PlatformError> {
        if self.shared.unknown_apps.lock().contains(app) {
            return Err(PlatformError::UnknownApplication(app.clone()));
        }
        self.record(BuilderCall::Allowed(app.clone()))
    }

    fn add_disallowed_application(&mut self, app: &AppId) -> Result<(), PlatformError> {
        if self.shared.unknown_apps.lock().contains(app) {
            return Err(PlatformError::UnknownApplication(app.clone()));
        }
        self.record(BuilderCall::Disallowed(app.clone()))
    }

    fn set_http_proxy(&mut self, host: &str, port: u16) -> Result<(), PlatformError> {
        self.record(BuilderCall::HttpProxy(host.to_string(), port))
    }

    fn set_metered(&mut self, metered: bool) -> Result<(), PlatformError> {
        self.record(BuilderCall::Metered(metered))
    }

    fn set_blocking(&mut self, blocking: bool) -> Result<(), PlatformError> {
        self.record(BuilderCall::Blocking(blocking))
    }

    fn set_session(&mut self, name: &str) -> Result<(), PlatformError> {
        self.record(BuilderCall::Session(name.to_string()))
    }

    fn establish(self: Box<Self>) -> Result<Box<dyn TunDevice>, PlatformError> {
        let SimulatedBuilder { calls, shared } = *self;
        let delay = *shared.establish_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(failure) = shared.establish_failure.lock().clone() {
            return Err(failure);
        }
        shared.interfaces.lock().push(calls);
        Ok(Box::new(SimulatedDevice::tracked(shared.open_devices.clone())))
    }
}

/// Processor that holds the tunnel until cancelled.
///
/// Protects one placeholder upstream socket on start so the protect path
/// is exercised end to end.
pub struct IdleProcessor;

impl TunnelProcessor for IdleProcessor {
    fn run(&self, ctx: ProcessorContext) -> Result<(), ProcessorError> {
        debug!(
            "Idle processor for proxy {}:{}",
            ctx.proxy_host, ctx.proxy_port
        );
        if let Err(e) = ctx.protector.try_protect(SocketHandle(-1)) {
            warn!("Upstream connection aborted: {}", e);
        }
        ctx.cancel.wait();
        Ok(())
    }
}
