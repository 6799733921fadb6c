//! Tunnel Handle
//!
//! Owning wrapper around an established [`TunDevice`]. The session shares
//! it with the processor as `Arc<TunnelHandle>`; the device is closed
//! exactly once, by [`TunnelHandle::close`] or when the last owner drops it.

use crate::platform::TunDevice;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Packet counters of one tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub packets_read: u64,
    pub packets_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Established tunnel interface
pub struct TunnelHandle {
    device: Box<dyn TunDevice>,
    closed: AtomicBool,
    packets_read: AtomicU64,
    packets_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl TunnelHandle {
    pub fn new(device: Box<dyn TunDevice>) -> Self {
        Self {
            device,
            closed: AtomicBool::new(false),
            packets_read: AtomicU64::new(0),
            packets_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read one raw IP packet
    pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let n = self.device.read_packet(buf)?;
        self.packets_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Write one raw IP packet
    pub fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let n = self.device.write_packet(packet)?;
        self.packets_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Close the interface
    pub fn close(self) -> io::Result<()> {
        self.release()
    }

    fn release(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing tunnel interface");
        self.device.close()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel closed"))
        } else {
            Ok(())
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to close tunnel interface: {}", e);
        }
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedDevice;

    #[test]
    fn test_closed_exactly_once() {
        let device = SimulatedDevice::new();
        let closes = device.close_counter();
        let handle = TunnelHandle::new(Box::new(device));

        handle.close().unwrap();
        assert_eq!(closes.get(), 1);

        let device = SimulatedDevice::new();
        let closes = device.close_counter();
        drop(TunnelHandle::new(Box::new(device)));
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_packet_io_and_stats() {
        let device = SimulatedDevice::new();
        device.inject_packet(vec![0x45; 20]);
        let handle = TunnelHandle::new(Box::new(device));

        let mut buf = [0u8; 1500];
        assert_eq!(handle.read_packet(&mut buf).unwrap(), 20);
        assert_eq!(handle.write_packet(&buf[..20]).unwrap(), 20);

        let stats = handle.stats();
        assert_eq!(stats.packets_read, 1);
        assert_eq!(stats.bytes_written, 20);
    }
}
