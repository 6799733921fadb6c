//! Tunnel Processor Worker
//!
//! The packet engine that relays tunnel traffic to the proxy lives outside
//! this crate and plugs in through [`TunnelProcessor`]. This module runs it
//! on a dedicated thread with panic isolation, hands it a cancellation
//! signal, and lets the session join on its termination with a bound.

use crate::protect::{ProtectError, SocketProtector};
use crate::tunnel::TunnelHandle;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Processor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("Failed to spawn processor thread: {0}")]
    Spawn(String),

    #[error("Tunnel I/O error: {0}")]
    Io(String),

    #[error("Socket protection failed: {0}")]
    Protect(#[from] ProtectError),

    #[error("Processor failed: {0}")]
    Failed(String),
}

/// Cancellation signal delivered to the processor.
///
/// Cancelled once the session drops the sending side.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Receiver<()>,
}

impl CancelSignal {
    fn pair() -> (Sender<()>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (tx, Self { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait up to `timeout`; returns `true` if cancelled meanwhile
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }

    /// Block until cancelled
    pub fn wait(&self) {
        while self.rx.recv().is_ok() {}
    }

    /// Raw receiver, for `crossbeam_channel::select!`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Everything the processor receives at session start
pub struct ProcessorContext {
    /// Established interface; the processor is its only reader
    pub tunnel: Arc<TunnelHandle>,
    /// Protect every upstream socket with this before use
    pub protector: Arc<SocketProtector>,
    pub proxy_host: String,
    pub proxy_port: u16,
    /// Pass-through entries, for rules the processor applies itself
    pub pass_through: Vec<String>,
    pub cancel: CancelSignal,
}

/// Packet-forwarding engine
pub trait TunnelProcessor: Send + Sync + 'static {
    /// Run until `ctx.cancel` fires or the tunnel fails. Must drop the
    /// context (and with it the tunnel handle) before returning.
    fn run(&self, ctx: ProcessorContext) -> Result<(), ProcessorError>;
}

/// Handle to a running processor thread
pub struct ProcessorWorker {
    cancel_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProcessorWorker {
    /// Spawn `processor` on its own thread.
    ///
    /// `build_context` receives the cancellation signal for this worker.
    pub fn spawn<F>(processor: Arc<dyn TunnelProcessor>, build_context: F) -> Result<Self, ProcessorError>
    where
        F: FnOnce(CancelSignal) -> ProcessorContext,
    {
        let (cancel_tx, cancel) = CancelSignal::pair();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let ctx = build_context(cancel);

        let thread = thread::Builder::new()
            .name("tunnel-processor".to_string())
            .spawn(move || {
                // Disconnects when this thread ends, panicking or not
                let _done = done_tx;
                info!("Tunnel processor started");
                run_isolated(processor, ctx);
                info!("Tunnel processor stopped");
            })
            .map_err(|e| ProcessorError::Spawn(e.to_string()))?;

        Ok(Self {
            cancel_tx: Some(cancel_tx),
            done_rx,
            thread: Some(thread),
        })
    }

    /// Whether the processor has already terminated
    pub fn is_finished(&self) -> bool {
        matches!(self.done_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Deliver the cancellation signal
    pub fn cancel(&mut self) {
        if self.cancel_tx.take().is_some() {
            debug!("Cancellation sent to tunnel processor");
        }
    }

    /// Cancel and wait up to `timeout` for the processor to terminate.
    ///
    /// Returns `false` on timeout; the thread is then detached.
    pub fn join(mut self, timeout: Duration) -> bool {
        self.cancel();

        match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                error!("Tunnel processor did not stop within {:?}", timeout);
                self.thread.take();
                false
            }
            _ => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        warn!("Tunnel processor thread panicked");
                    }
                }
                true
            }
        }
    }
}

impl Drop for ProcessorWorker {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_isolated(processor: Arc<dyn TunnelProcessor>, ctx: ProcessorContext) {
    let result = panic::catch_unwind(AssertUnwindSafe(move || processor.run(ctx)));

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Tunnel processor exited with error: {}", e),
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!("Tunnel processor panicked: {}", msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{IdleProcessor, SimulatedDevice};

    fn context(cancel: CancelSignal) -> ProcessorContext {
        ProcessorContext {
            tunnel: Arc::new(TunnelHandle::new(Box::new(SimulatedDevice::new()))),
            protector: Arc::new(SocketProtector::new()),
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 9099,
            pass_through: Vec::new(),
            cancel,
        }
    }

    struct Stubborn;

    impl TunnelProcessor for Stubborn {
        fn run(&self, ctx: ProcessorContext) -> Result<(), ProcessorError> {
            ctx.cancel.wait();
            thread::sleep(Duration::from_millis(500));
            Ok(())
        }
    }

    struct Panicky;

    impl TunnelProcessor for Panicky {
        fn run(&self, _ctx: ProcessorContext) -> Result<(), ProcessorError> {
            panic!("engine blew up");
        }
    }

    #[test]
    fn test_cancel_signal() {
        let (tx, signal) = CancelSignal::pair();
        assert!(!signal.is_cancelled());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));

        drop(tx);
        assert!(signal.is_cancelled());
        assert!(signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_cancel_signal_in_select() {
        let (tx, signal) = CancelSignal::pair();
        let packets = crossbeam_channel::never::<Vec<u8>>();
        drop(tx);

        crossbeam_channel::select! {
            recv(packets) -> _ => panic!("no packets expected"),
            recv(signal.receiver()) -> msg => assert!(msg.is_err()),
            default(Duration::from_secs(1)) => panic!("cancellation not observed"),
        }
    }

    #[test]
    fn test_join_releases_tunnel() {
        let processor: Arc<dyn TunnelProcessor> = Arc::new(IdleProcessor);
        let mut tunnel = None;
        let worker = ProcessorWorker::spawn(processor, |cancel| {
            let ctx = context(cancel);
            tunnel = Some(ctx.tunnel.clone());
            ctx
        })
        .unwrap();

        let tunnel = tunnel.unwrap();
        assert!(!worker.is_finished());
        assert!(worker.join(Duration::from_secs(5)));
        assert_eq!(Arc::strong_count(&tunnel), 1);
    }

    #[test]
    fn test_join_timeout() {
        let worker = ProcessorWorker::spawn(Arc::new(Stubborn), context).unwrap();
        assert!(!worker.join(Duration::from_millis(20)));
    }

    #[test]
    fn test_panic_is_contained() {
        let worker = ProcessorWorker::spawn(Arc::new(Panicky), context).unwrap();
        assert!(worker.join(Duration::from_secs(5)));
    }
}
