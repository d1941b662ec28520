//! Proxy dispatch
//!
//! The fan-out / fan-in algorithm, written once against [`HubLink`]. The
//! thread-based proxy drives it over an in-process [`LocalLink`]; the
//! process-based proxy drives the same code in `auxlink-proxyd` over a
//! stream link.

use super::channel::ProxyChannel;
use crate::core::trace::{Direction, TraceSink};
use crate::core::transport::{Routing, Transport};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Index of a subscriber within its proxy
pub type SubscriberId = u32;

/// One frame queued for a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyFrame {
    /// Payload
    #[serde(with = "crate::core::hex_serde")]
    pub msg: Bytes,
    /// Source id reported by the real transport
    pub remote_id: Option<u32>,
}

/// A subscriber asking the proxy owner to send on its behalf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Sending subscriber
    pub from: SubscriberId,
    /// Payload
    #[serde(with = "crate::core::hex_serde")]
    pub msg: Bytes,
    /// Routing id for the real transport
    pub remote_id: Option<u32>,
}

/// A frame addressed to one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Recipient
    pub to: SubscriberId,
    /// Frame
    pub frame: ProxyFrame,
}

/// The other end of the link went away
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Proxy link closed")]
pub struct LinkClosed;

/// Duplex capability between the proxy owner and its subscribers
pub trait HubLink: Send + Sync {
    /// Next pending send request, `None` on timeout
    fn next_request(&self, timeout: Duration) -> Result<Option<ProxyRequest>, LinkClosed>;

    /// Queue a frame for one subscriber
    fn deliver(&self, to: SubscriberId, frame: ProxyFrame) -> Result<(), LinkClosed>;
}

/// In-process link: requests come from a crossbeam queue, deliveries go
/// straight into the subscribers' stand-ins
pub struct LocalLink {
    requests: Receiver<ProxyRequest>,
    routes: HashMap<SubscriberId, ProxyChannel>,
}

impl LocalLink {
    /// Create a link over the proxy's request queue
    pub fn new(
        requests: Receiver<ProxyRequest>,
        routes: HashMap<SubscriberId, ProxyChannel>,
    ) -> Self {
        Self { requests, routes }
    }
}

impl HubLink for LocalLink {
    fn next_request(&self, timeout: Duration) -> Result<Option<ProxyRequest>, LinkClosed> {
        match self.requests.recv_timeout(timeout) {
            Ok(request) => Ok(Some(request)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LinkClosed),
        }
    }

    fn deliver(&self, to: SubscriberId, frame: ProxyFrame) -> Result<(), LinkClosed> {
        match self.routes.get(&to) {
            Some(channel) => channel.push(frame),
            None => tracing::debug!(subscriber = to, "No route for delivery"),
        }
        Ok(())
    }
}

/// Fan-out / fan-in over one real transport
pub struct Dispatcher<L> {
    name: String,
    link: L,
    transport: Arc<dyn Transport>,
    subscribers: Vec<String>,
    trace: Option<Arc<TraceSink>>,
}

impl<L: HubLink> Dispatcher<L> {
    /// Create a dispatcher; subscriber ids are indices into `subscribers`
    pub fn new(
        name: impl Into<String>,
        link: L,
        transport: Arc<dyn Transport>,
        subscribers: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            link,
            transport,
            subscribers,
            trace: None,
        }
    }

    /// Record forwarded frames
    #[must_use]
    pub fn with_trace(mut self, trace: Option<Arc<TraceSink>>) -> Self {
        self.trace = trace;
        self
    }

    fn ids(&self) -> impl Iterator<Item = SubscriberId> {
        0..self.subscribers.len() as SubscriberId
    }

    /// Handle at most one pending send.
    ///
    /// The payload goes out once on the real transport, then to every
    /// subscriber except the sender. Returns true when a request was handled.
    pub fn forward_once(&self, timeout: Duration) -> Result<bool, LinkClosed> {
        let Some(request) = self.link.next_request(timeout)? else {
            return Ok(false);
        };
        let origin = self.subscribers.get(request.from as usize).map(String::as_str);

        let routing = Routing {
            remote_id: request.remote_id,
        };
        if let Err(e) = self.transport.send(&request.msg, routing) {
            tracing::warn!(
                proxy = %self.name,
                from = origin.unwrap_or("?"),
                error = %e,
                "Forward failed"
            );
            return Ok(true);
        }
        if let Some(trace) = &self.trace {
            trace.record(Direction::Tx, origin, request.remote_id, &request.msg);
        }

        let frame = ProxyFrame {
            msg: request.msg,
            remote_id: request.remote_id,
        };
        for id in self.ids().filter(|&id| id != request.from) {
            self.link.deliver(id, frame.clone())?;
        }
        Ok(true)
    }

    /// Read at most one frame from the real transport and hand it to every
    /// subscriber. Returns true when a frame was read.
    pub fn receive_once(&self, timeout: Duration) -> Result<bool, LinkClosed> {
        let rx = match self.transport.receive(timeout) {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(proxy = %self.name, error = %e, "Receive failed");
                thread::sleep(timeout);
                return Ok(false);
            }
        };
        let Some(msg) = rx.msg else {
            return Ok(false);
        };
        if let Some(trace) = &self.trace {
            trace.record(Direction::Rx, None, rx.remote_id, &msg);
        }

        let frame = ProxyFrame {
            msg,
            remote_id: rx.remote_id,
        };
        for id in self.ids() {
            self.link.deliver(id, frame.clone())?;
        }
        Ok(true)
    }

    /// Forward until `running` clears or the link closes
    pub fn run_forward(&self, running: &AtomicBool, poll: Duration) {
        while running.load(Ordering::SeqCst) {
            if self.forward_once(poll).is_err() {
                tracing::debug!(proxy = %self.name, "Link closed, forward loop exiting");
                running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Receive until `running` clears or the link closes
    pub fn run_receive(&self, running: &AtomicBool, poll: Duration) {
        while running.load(Ordering::SeqCst) {
            if self.receive_once(poll).is_err() {
                tracing::debug!(proxy = %self.name, "Link closed, receive loop exiting");
                running.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{MockTransport, RxFrame};
    use crossbeam_channel::{unbounded, Sender};
    use parking_lot::Mutex;

    /// Link that records deliveries per subscriber
    struct RecordingLink {
        requests: Receiver<ProxyRequest>,
        delivered: Mutex<HashMap<SubscriberId, Vec<ProxyFrame>>>,
    }

    impl RecordingLink {
        fn new() -> (Sender<ProxyRequest>, Self) {
            let (tx, rx) = unbounded();
            (
                tx,
                Self {
                    requests: rx,
                    delivered: Mutex::new(HashMap::new()),
                },
            )
        }

        fn frames(&self, id: SubscriberId) -> Vec<ProxyFrame> {
            self.delivered.lock().get(&id).cloned().unwrap_or_default()
        }
    }

    impl HubLink for RecordingLink {
        fn next_request(&self, timeout: Duration) -> Result<Option<ProxyRequest>, LinkClosed> {
            match self.requests.recv_timeout(timeout) {
                Ok(r) => Ok(Some(r)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(LinkClosed),
            }
        }

        fn deliver(&self, to: SubscriberId, frame: ProxyFrame) -> Result<(), LinkClosed> {
            self.delivered.lock().entry(to).or_default().push(frame);
            Ok(())
        }
    }

    fn names() -> Vec<String> {
        vec!["aux_a".into(), "aux_b".into()]
    }

    #[test]
    fn test_physical_receive_fans_out_to_everyone() {
        let mut mock = MockTransport::new();
        mock.expect_receive()
            .times(1)
            .returning(|_| Ok(RxFrame::data(Bytes::from_static(b"ABC"), Some(5))));

        let (_tx, link) = RecordingLink::new();
        let dispatcher = Dispatcher::new("proxy", link, Arc::new(mock), names());
        assert!(dispatcher.receive_once(Duration::from_millis(10)).unwrap());

        let expected = ProxyFrame {
            msg: Bytes::from_static(b"ABC"),
            remote_id: Some(5),
        };
        assert_eq!(dispatcher.link.frames(0), vec![expected.clone()]);
        assert_eq!(dispatcher.link.frames(1), vec![expected]);
    }

    #[test]
    fn test_send_excludes_sender_and_hits_transport_once() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|data, routing| data == b"XYZ" && routing.remote_id.is_none())
            .times(1)
            .returning(|_, _| Ok(()));

        let (tx, link) = RecordingLink::new();
        let dispatcher = Dispatcher::new("proxy", link, Arc::new(mock), names());
        tx.send(ProxyRequest {
            from: 0,
            msg: Bytes::from_static(b"XYZ"),
            remote_id: None,
        })
        .unwrap();

        assert!(dispatcher.forward_once(Duration::from_millis(10)).unwrap());
        assert!(dispatcher.link.frames(0).is_empty());
        assert_eq!(dispatcher.link.frames(1)[0].msg, Bytes::from_static(b"XYZ"));
    }

    #[test]
    fn test_failed_send_is_not_echoed() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_, _| Err(crate::core::transport::TransportError::NotConnected));

        let (tx, link) = RecordingLink::new();
        let dispatcher = Dispatcher::new("proxy", link, Arc::new(mock), names());
        tx.send(ProxyRequest {
            from: 1,
            msg: Bytes::from_static(b"Q"),
            remote_id: Some(2),
        })
        .unwrap();

        assert!(dispatcher.forward_once(Duration::from_millis(10)).unwrap());
        assert!(dispatcher.link.frames(0).is_empty());
    }

    #[test]
    fn test_forward_reports_closed_link() {
        let (tx, link) = RecordingLink::new();
        drop(tx);
        let dispatcher = Dispatcher::new("proxy", link, Arc::new(MockTransport::new()), names());
        assert_eq!(dispatcher.forward_once(Duration::from_millis(1)), Err(LinkClosed));
    }

    #[test]
    fn test_frames_serialize_as_hex() {
        let delivery = Delivery {
            to: 1,
            frame: ProxyFrame {
                msg: Bytes::from_static(b"\x01\xff"),
                remote_id: Some(9),
            },
        };
        let json = serde_json::to_string(&delivery).unwrap();
        assert_eq!(json, r#"{"to":1,"frame":{"msg":"01ff","remote_id":9}}"#);
        assert_eq!(serde_json::from_str::<Delivery>(&json).unwrap(), delivery);
    }
}
