//! Proxy channel: the stand-in transport a subscriber owns

use super::dispatch::{ProxyFrame, ProxyRequest, SubscriberId};
use super::{ProxyError, ProxyShared, ProxyTarget};
use crate::core::transport::{RxFrame, Routing, Transport, TransportError};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Stand-in transport for one proxy subscriber.
///
/// Sends are queued to the proxy owner; receives read this channel's own
/// queue, which the owner fills. The channel never touches the real
/// transport. Clones share the same queue.
#[derive(Clone)]
pub struct ProxyChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    inbox_tx: Sender<ProxyFrame>,
    inbox_rx: Receiver<ProxyFrame>,
    binding: RwLock<Option<Binding>>,
    open: AtomicBool,
}

pub(crate) struct Binding {
    pub hub: Weak<ProxyShared>,
    pub id: SubscriberId,
    pub requests: Sender<ProxyRequest>,
}

impl Default for ProxyChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyChannel {
    /// Create an unbound channel
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            inner: Arc::new(ChannelInner {
                inbox_tx,
                inbox_rx,
                binding: RwLock::new(None),
                open: AtomicBool::new(false),
            }),
        }
    }

    /// True once a proxy has attached this channel
    pub fn is_bound(&self) -> bool {
        self.inner.binding.read().is_some()
    }

    /// Is open
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Name of the proxy this channel is bound to
    pub fn proxy_name(&self) -> Option<String> {
        self.hub().map(|hub| hub.name.clone())
    }

    /// Frames waiting to be received
    pub fn pending(&self) -> usize {
        self.inner.inbox_rx.len()
    }

    /// The real transport behind the proxy.
    ///
    /// Fails with [`ProxyError::NotBound`] before a proxy attaches this
    /// channel, and with [`ProxyError::RemoteTransport`] when the transport
    /// lives in a proxy child process.
    pub fn physical(&self) -> Result<Arc<dyn Transport>, ProxyError> {
        let hub = self.hub().ok_or(ProxyError::NotBound)?;
        let target = hub.target.read();
        match &*target {
            ProxyTarget::Local(transport) => Ok(transport.clone()),
            ProxyTarget::Process(_) => Err(ProxyError::RemoteTransport(hub.name.clone())),
        }
    }

    /// Same underlying channel
    pub fn same_channel(&self, other: &ProxyChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn bind(&self, binding: Binding) {
        *self.inner.binding.write() = Some(binding);
    }

    /// Queue a frame for this subscriber; dropped while the channel is closed
    pub(crate) fn push(&self, frame: ProxyFrame) {
        if self.is_open() {
            let _ = self.inner.inbox_tx.send(frame);
        }
    }

    fn hub(&self) -> Option<Arc<ProxyShared>> {
        self.inner.binding.read().as_ref().and_then(|b| b.hub.upgrade())
    }

    fn drain(&self) {
        while self.inner.inbox_rx.try_recv().is_ok() {}
    }
}

impl Transport for ProxyChannel {
    fn open(&self) -> Result<(), TransportError> {
        let hub = self.hub().ok_or(TransportError::NotBound)?;
        if self.inner.open.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.drain();
        hub.acquire().map_err(|e| {
            self.inner.open.store(false, Ordering::SeqCst);
            TransportError::ConnectionFailed(e.to_string())
        })
    }

    fn close(&self) -> Result<(), TransportError> {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.drain();
        if let Some(hub) = self.hub() {
            hub.release();
        }
        Ok(())
    }

    fn send(&self, data: &[u8], routing: Routing) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let binding = self.inner.binding.read();
        let binding = binding.as_ref().ok_or(TransportError::NotBound)?;
        binding
            .requests
            .send(ProxyRequest {
                from: binding.id,
                msg: Bytes::copy_from_slice(data),
                remote_id: routing.remote_id,
            })
            .map_err(|_| TransportError::Disconnected)
    }

    fn receive(&self, timeout: Duration) -> Result<RxFrame, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        match self.inner.inbox_rx.recv_timeout(timeout) {
            Ok(frame) => Ok(RxFrame::data(frame.msg, frame.remote_id)),
            Err(RecvTimeoutError::Timeout) => Ok(RxFrame::empty()),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn as_proxy_channel(&self) -> Option<ProxyChannel> {
        Some(self.clone())
    }

    fn describe(&self) -> String {
        match self.proxy_name() {
            Some(name) => format!("proxy channel ({})", name),
            None => String::from("proxy channel (unbound)"),
        }
    }
}
