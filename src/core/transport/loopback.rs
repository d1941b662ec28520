//! In-memory loopback transport
//!
//! Every payload sent is handed back by a later `receive`, routing id
//! included. `inject` lets a test play the device side.

use super::{RxFrame, Routing, Transport, TransportError, TransportStats};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Loopback transport
pub struct LoopbackTransport {
    tx: Sender<RxFrame>,
    rx: Receiver<RxFrame>,
    open: AtomicBool,
    stats: RwLock<TransportStats>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Create a closed loopback
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            open: AtomicBool::new(false),
            stats: RwLock::new(TransportStats::default()),
        }
    }

    /// Queue a payload as if the far end had sent it
    pub fn inject(&self, data: &[u8], remote_id: Option<u32>) {
        let _ = self
            .tx
            .send(RxFrame::data(Bytes::copy_from_slice(data), remote_id));
    }

    /// Payloads waiting to be received
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Is open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Get statistics
    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }
}

impl Transport for LoopbackTransport {
    fn open(&self) -> Result<(), TransportError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }

    fn send(&self, data: &[u8], routing: Routing) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(RxFrame::data(Bytes::copy_from_slice(data), routing.remote_id))
            .map_err(|e| TransportError::SendError(e.to_string()))?;

        let mut stats = self.stats.write();
        stats.bytes_sent += data.len() as u64;
        stats.packets_sent += 1;
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<RxFrame, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                let mut stats = self.stats.write();
                stats.bytes_received += frame.msg.as_ref().map_or(0, |m| m.len() as u64);
                stats.packets_received += 1;
                Ok(frame)
            }
            Err(RecvTimeoutError::Timeout) => Ok(RxFrame::empty()),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn describe(&self) -> String {
        String::from("loopback")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_echo() {
        let lo = LoopbackTransport::new();
        lo.open().unwrap();
        lo.send(b"Hello", Routing::to(5)).unwrap();

        let frame = lo.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.msg.as_deref(), Some(&b"Hello"[..]));
        assert_eq!(frame.remote_id, Some(5));
        assert_eq!(lo.stats().packets_sent, 1);
    }

    #[test]
    fn test_loopback_timeout_is_empty() {
        let lo = LoopbackTransport::new();
        lo.open().unwrap();
        assert!(lo.receive(Duration::from_millis(5)).unwrap().is_empty());
    }

    #[test]
    fn test_loopback_closed() {
        let lo = LoopbackTransport::new();
        assert!(matches!(
            lo.send(b"x", Routing::default()),
            Err(TransportError::NotConnected)
        ));
        lo.open().unwrap();
        lo.inject(b"stale", None);
        lo.close().unwrap();
        assert_eq!(lo.pending(), 0);
    }
}
