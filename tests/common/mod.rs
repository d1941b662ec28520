//! Shared fixtures for integration tests

#![allow(dead_code)]

use auxlink_core::{AckType, Message, MessageKind, Routing, RxFrame, Transport, TransportError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Fake device: answers each command with the next scripted reply.
///
/// `Some(kind)` acks with `kind`, `None` stays silent. Once the script runs
/// out the device acks everything.
pub struct ScriptedDevice {
    script: Mutex<VecDeque<Option<AckType>>>,
    inbound: Mutex<VecDeque<(Bytes, Option<u32>)>>,
    sent: Mutex<Vec<Message>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl ScriptedDevice {
    pub fn new(script: impl IntoIterator<Item = Option<AckType>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    /// Device that never answers
    pub fn silent() -> Arc<Self> {
        Self::new(std::iter::repeat(None).take(64))
    }

    /// Queue a device-initiated message
    pub fn emit(&self, msg: &Message) {
        self.emit_from(msg, None);
    }

    /// Queue a device-initiated message tagged with a source id
    pub fn emit_from(&self, msg: &Message, remote_id: Option<u32>) {
        self.inbound
            .lock()
            .push_back((Bytes::from(msg.serialize()), remote_id));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn commands_sent(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| matches!(m.kind, MessageKind::Command(_)))
            .count()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedDevice {
    fn open(&self) -> Result<(), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, data: &[u8], _routing: Routing) -> Result<(), TransportError> {
        let msg = Message::parse(data).map_err(|e| TransportError::SendError(e.to_string()))?;
        if matches!(msg.kind, MessageKind::Command(_)) {
            let reply = self.script.lock().pop_front().unwrap_or(Some(AckType::Ack));
            if let Some(kind) = reply {
                self.emit(&msg.ack(kind));
            }
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<RxFrame, TransportError> {
        if let Some((raw, remote_id)) = self.inbound.lock().pop_front() {
            return Ok(RxFrame::data(raw, remote_id));
        }
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Ok(RxFrame::empty())
    }

    fn describe(&self) -> String {
        String::from("scripted device")
    }
}
