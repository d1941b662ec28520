//! Command/response engine
//!
//! An [`Auxiliary`] owns one transport and turns it into a blocking command
//! API. A background receive loop decodes every inbound message and routes
//! it: acks go to the waiter holding the matching token, reports are queued
//! for [`Auxiliary::wait_report`], device logs go to `tracing`. Commands are
//! executed either on a transmit loop or inline on the caller thread.

mod config;
mod error;

pub use config::AuxiliaryConfig;
pub use error::{AuxiliaryError, AuxiliaryResult};

use crate::core::context::ControllerContext;
use crate::core::lifecycle::{AuxiliaryState, Lifecycle, StateTransition};
use crate::core::protocol::{AckType, CommandType, LogType, Message, MessageKind, Tlv, TlvTag};
use crate::core::registry::{Registry, RegistryError, RegistryLink};
use crate::core::transport::{Routing, Transport};
use crate::core::worker::LoopGroup;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Payload of a command besides its type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandData {
    /// Test suite identifier
    pub test_suite: u8,
    /// Test case identifier
    pub test_case: u8,
    /// Extension fields
    pub tlv: Tlv,
}

impl CommandData {
    /// Command data for a suite / case pair
    pub fn new(test_suite: u8, test_case: u8) -> Self {
        Self {
            test_suite,
            test_case,
            tlv: Tlv::new(),
        }
    }

    /// Attach extension fields
    #[must_use]
    pub fn with_tlv(mut self, tlv: Tlv) -> Self {
        self.tlv = tlv;
        self
    }
}

/// Outcome of one executed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// The command as sent
    pub command: Message,
    /// True when the device acked it
    pub acknowledged: bool,
}

impl From<CommandResponse> for bool {
    fn from(response: CommandResponse) -> Self {
        response.acknowledged
    }
}

/// One auxiliary instance.
///
/// Cheap to clone; every clone drives the same instance.
#[derive(Clone)]
pub struct Auxiliary {
    inner: Arc<AuxiliaryInner>,
}

struct AuxiliaryInner {
    name: String,
    config: AuxiliaryConfig,
    ctx: Arc<ControllerContext>,
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes create / delete / suspend / resume
    op_lock: Mutex<()>,
    /// Serializes `run_command` callers
    command_lock: Mutex<()>,
    command_tx: Sender<Message>,
    command_rx: Receiver<Message>,
    response_tx: Sender<CommandResponse>,
    response_rx: Receiver<CommandResponse>,
    report_tx: Sender<Message>,
    report_rx: Receiver<Message>,
    pending_acks: Mutex<HashMap<u8, Sender<Message>>>,
    rx_active: AtomicBool,
    loops: Mutex<Option<LoopGroup>>,
    registry: OnceLock<RegistryLink>,
}

impl Auxiliary {
    /// Create a stopped auxiliary over `transport`
    pub fn new(
        name: impl Into<String>,
        config: AuxiliaryConfig,
        transport: Arc<dyn Transport>,
        ctx: Arc<ControllerContext>,
    ) -> Self {
        let (command_tx, command_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        let (report_tx, report_rx) = unbounded();
        Self {
            inner: Arc::new(AuxiliaryInner {
                name: name.into(),
                config,
                ctx,
                transport,
                lifecycle: Mutex::new(Lifecycle::new()),
                op_lock: Mutex::new(()),
                command_lock: Mutex::new(()),
                command_tx,
                command_rx,
                response_tx,
                response_rx,
                report_tx,
                report_rx,
                pending_acks: Mutex::new(HashMap::new()),
                rx_active: AtomicBool::new(false),
                loops: Mutex::new(None),
                registry: OnceLock::new(),
            }),
        }
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Engine settings
    pub fn config(&self) -> &AuxiliaryConfig {
        &self.inner.config
    }

    /// Shared controller state
    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.inner.ctx
    }

    /// Transport owned by this instance
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> AuxiliaryState {
        self.inner.state()
    }

    /// True while running
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Recent lifecycle transitions, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.lifecycle.lock().history().to_vec()
    }

    /// May be attached to a proxy
    pub fn is_proxy_capable(&self) -> bool {
        self.inner.config.proxy_capable
    }

    /// Two handles to the same instance
    pub fn same_instance(&self, other: &Auxiliary) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open the transport, handshake and start the loops.
    ///
    /// Succeeds without doing anything when already running. A suspended
    /// instance is brought back with [`Auxiliary::resume`] only.
    pub fn create_instance(&self) -> AuxiliaryResult<()> {
        let _op = self.inner.op_lock.lock();
        if self.inner.state() == AuxiliaryState::Suspended {
            return Err(AuxiliaryError::InvalidTransition {
                name: self.inner.name.clone(),
                from: AuxiliaryState::Suspended,
                to: AuxiliaryState::Creating,
            });
        }
        self.create_locked()
    }

    fn create_locked(&self) -> AuxiliaryResult<()> {
        let inner = &self.inner;
        if inner.state().is_running() {
            return Ok(());
        }

        inner.transition(AuxiliaryState::Creating, "create_instance")?;
        tracing::info!(
            aux = %inner.name,
            transport = %inner.transport.describe(),
            "Creating instance"
        );
        inner.drain_reports();

        if let Err(e) = inner.transport.open() {
            inner.transition(AuxiliaryState::Stopped, "transport open failed")?;
            return Err(AuxiliaryError::Creation {
                name: inner.name.clone(),
                reason: format!("transport open failed: {}", e),
            });
        }

        if inner.config.handshake && !inner.ping() {
            inner.close_transport();
            inner.transition(AuxiliaryState::Stopped, "handshake failed")?;
            return Err(AuxiliaryError::Creation {
                name: inner.name.clone(),
                reason: String::from("handshake was never acknowledged"),
            });
        }

        if let Err(e) = self.start_loops() {
            inner.close_transport();
            inner.transition(AuxiliaryState::Stopped, "loop spawn failed")?;
            return Err(AuxiliaryError::Spawn(e));
        }

        inner.transition(AuxiliaryState::Running, "created")?;
        tracing::info!(aux = %inner.name, "Instance running");
        Ok(())
    }

    /// Stop the loops, close the transport and return to `Stopped`.
    ///
    /// Idempotent; returns true once the instance is stopped.
    pub fn delete_instance(&self) -> bool {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();

        match inner.state() {
            AuxiliaryState::Stopped => return true,
            AuxiliaryState::Suspended => {
                return inner
                    .transition(AuxiliaryState::Stopped, "delete_instance")
                    .is_ok()
            }
            _ => {}
        }

        if let Err(e) = inner.transition(AuxiliaryState::Stopping, "delete_instance") {
            tracing::error!(aux = %inner.name, error = %e, "Cannot delete instance");
            return false;
        }
        self.stop_loops();
        inner.close_transport();

        let stopped = inner.transition(AuxiliaryState::Stopped, "deleted").is_ok();
        tracing::info!(aux = %inner.name, "Instance deleted");
        stopped
    }

    /// Park a running instance, releasing its transport
    pub fn suspend(&self) -> AuxiliaryResult<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock();
        if !inner.state().is_running() {
            tracing::debug!(aux = %inner.name, state = ?inner.state(), "Nothing to suspend");
            return Ok(());
        }

        self.stop_loops();
        inner.close_transport();
        inner.transition(AuxiliaryState::Suspended, "suspend")?;
        tracing::info!(aux = %inner.name, "Instance suspended");
        Ok(())
    }

    /// Recreate a suspended instance
    pub fn resume(&self) -> AuxiliaryResult<()> {
        let _op = self.inner.op_lock.lock();
        if self.inner.state() != AuxiliaryState::Suspended {
            return Ok(());
        }
        tracing::info!(aux = %self.inner.name, "Resuming instance");
        self.create_locked()
    }

    /// Run one command against the device.
    ///
    /// Returns `timeout_result` straight away when a stop was requested, and
    /// when `blocking` is set but no response arrives within `timeout`
    /// (`None` means the configured default). A non-blocking call returns the
    /// response only if it is already available.
    pub fn run_command<T>(
        &self,
        command: CommandType,
        data: CommandData,
        blocking: bool,
        timeout: Option<Duration>,
        timeout_result: T,
    ) -> AuxiliaryResult<T>
    where
        T: From<CommandResponse>,
    {
        let inner = &self.inner;
        let _cmd = inner.command_lock.lock();

        if inner.ctx.run().is_stop_requested() {
            tracing::debug!(aux = %inner.name, ?command, "Stop requested, command skipped");
            return Ok(timeout_result);
        }
        if !inner.state().is_running() {
            return Err(AuxiliaryError::NotStarted(inner.name.clone()));
        }

        let msg = Message::command(inner.ctx.tokens(), command, data.test_suite, data.test_case)
            .with_tlv(data.tlv);
        let token = msg.token;
        tracing::debug!(aux = %inner.name, %msg, "Running command");

        if inner.config.tx_loop {
            if inner.command_tx.send(msg).is_err() {
                return Ok(timeout_result);
            }
        } else {
            let response = inner.execute(msg);
            let _ = inner.response_tx.send(response);
        }

        let wait = blocking.then(|| timeout.unwrap_or_else(|| inner.config.command_timeout()));
        Ok(inner
            .take_response(token, wait)
            .map(T::from)
            .unwrap_or(timeout_result))
    }

    /// Send `msg` and wait for its ack, retrying up to `tries` times.
    ///
    /// A missing response or a NACK counts as a failed try. Returns false
    /// after the last try, or immediately once a stop was requested.
    pub fn send_and_wait_ack(&self, msg: &Message, per_try_timeout: Duration, tries: u32) -> bool {
        self.inner.send_and_wait_ack(msg, per_try_timeout, tries)
    }

    /// Probe the device with a ping
    pub fn ping(&self) -> bool {
        self.inner.ping()
    }

    /// Abort the running command.
    ///
    /// When the soft abort is not acked the instance is deleted and created
    /// again, and the abort is reported as failed whatever the reset does.
    pub fn abort_command(&self, timeout: Option<Duration>) -> AuxiliaryResult<bool> {
        let inner = &self.inner;
        if !inner.state().is_running() {
            return Err(AuxiliaryError::NotStarted(inner.name.clone()));
        }

        let abort = Message::command(inner.ctx.tokens(), CommandType::Abort, 0, 0);
        let per_try = timeout.unwrap_or_else(|| inner.config.ack_timeout());
        if inner.send_and_wait_ack(&abort, per_try, inner.config.abort_tries) {
            tracing::info!(aux = %inner.name, "Abort acknowledged");
            return Ok(true);
        }
        if inner.ctx.run().is_stop_requested() {
            return Ok(false);
        }

        tracing::warn!(aux = %inner.name, "Abort not acknowledged, resetting instance");
        self.delete_instance();
        if let Err(e) = self.create_instance() {
            tracing::error!(aux = %inner.name, error = %e, "Hard reset failed");
        }
        Ok(false)
    }

    /// Next report sent by the device
    pub fn wait_report(&self, timeout: Option<Duration>) -> Option<Message> {
        let inner = &self.inner;
        if inner.ctx.run().is_stop_requested() {
            return None;
        }
        let timeout = timeout.unwrap_or_else(|| inner.config.command_timeout());
        inner.report_rx.recv_timeout(timeout).ok()
    }

    /// Build a second instance from this one's registry entry, suspending
    /// this one first if it is running
    pub fn create_copy(&self, overrides: &toml::Table) -> Result<Auxiliary, RegistryError> {
        let (registry, alias) = self.registry_link()?;
        registry.create_copy(&alias, overrides)
    }

    /// Drop the copy and resume this instance if it was running before
    pub fn destroy_copy(&self) -> Result<(), RegistryError> {
        let (registry, alias) = self.registry_link()?;
        registry.destroy_copy(&alias)
    }

    pub(crate) fn attach_registry(&self, link: RegistryLink) {
        let _ = self.inner.registry.set(link);
    }

    fn registry_link(&self) -> Result<(Registry, String), RegistryError> {
        let link = self
            .inner
            .registry
            .get()
            .ok_or_else(|| RegistryError::NotRegistered(self.inner.name.clone()))?;
        let registry = link
            .registry()
            .ok_or_else(|| RegistryError::NotRegistered(self.inner.name.clone()))?;
        Ok((registry, link.alias.clone()))
    }

    fn start_loops(&self) -> std::io::Result<()> {
        let inner = &self.inner;
        let mut group = LoopGroup::new();

        let weak = Arc::downgrade(&self.inner);
        group.spawn(format!("{}-rx", inner.name), move |running| rx_loop(weak, running))?;
        inner.rx_active.store(true, Ordering::SeqCst);

        if inner.config.tx_loop {
            let weak = Arc::downgrade(&self.inner);
            if let Err(e) = group.spawn(format!("{}-tx", inner.name), move |running| {
                tx_loop(weak, running)
            }) {
                inner.rx_active.store(false, Ordering::SeqCst);
                group.stop();
                return Err(e);
            }
        }

        *inner.loops.lock() = Some(group);
        Ok(())
    }

    fn stop_loops(&self) {
        let inner = &self.inner;
        inner.rx_active.store(false, Ordering::SeqCst);
        let group = inner.loops.lock().take();
        if let Some(mut group) = group {
            group.stop();
        }
        while inner.command_rx.try_recv().is_ok() {}
        inner.drain_reports();
    }
}

impl std::fmt::Debug for Auxiliary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auxiliary")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl AuxiliaryInner {
    fn state(&self) -> AuxiliaryState {
        self.lifecycle.lock().state()
    }

    fn transition(&self, to: AuxiliaryState, reason: &str) -> AuxiliaryResult<()> {
        self.lifecycle
            .lock()
            .transition(to, Some(reason))
            .map_err(|e| AuxiliaryError::InvalidTransition {
                name: self.name.clone(),
                from: e.from,
                to: e.to,
            })
    }

    fn drain_reports(&self) {
        let stale = self.report_rx.try_iter().count();
        if stale > 0 {
            tracing::debug!(aux = %self.name, stale, "Dropping unread reports");
        }
    }

    fn routing(&self) -> Routing {
        Routing {
            remote_id: self.config.remote_id,
        }
    }

    fn close_transport(&self) {
        if let Err(e) = self.transport.close() {
            tracing::warn!(aux = %self.name, error = %e, "Transport close failed");
        }
    }

    fn ping(&self) -> bool {
        let ping = Message::command(self.ctx.tokens(), CommandType::Ping, 0, 0);
        self.send_and_wait_ack(&ping, self.config.ack_timeout(), self.config.handshake_tries)
    }

    fn execute(&self, command: Message) -> CommandResponse {
        let acknowledged =
            self.send_and_wait_ack(&command, self.config.ack_timeout(), self.config.ack_tries);
        CommandResponse {
            command,
            acknowledged,
        }
    }

    fn take_response(&self, token: u8, wait: Option<Duration>) -> Option<CommandResponse> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let next = match deadline {
                Some(deadline) => self.response_rx.recv_deadline(deadline).ok(),
                None => self.response_rx.try_recv().ok(),
            };
            let response = next?;
            if response.command.token == token {
                return Some(response);
            }
            tracing::debug!(
                aux = %self.name,
                token = response.command.token,
                "Discarding stale response"
            );
        }
    }

    fn send_and_wait_ack(&self, msg: &Message, per_try: Duration, tries: u32) -> bool {
        // Once the receive loop runs it owns the transport's inbound side;
        // before that (handshake) the transport is read directly.
        let waiter = if self.rx_active.load(Ordering::SeqCst) {
            let (tx, rx) = bounded(8);
            self.pending_acks.lock().insert(msg.token, tx);
            Some(rx)
        } else {
            None
        };

        let acked = self.ack_attempts(msg, per_try, tries, waiter.as_ref());

        if waiter.is_some() {
            self.pending_acks.lock().remove(&msg.token);
        }
        acked
    }

    fn ack_attempts(
        &self,
        msg: &Message,
        per_try: Duration,
        tries: u32,
        waiter: Option<&Receiver<Message>>,
    ) -> bool {
        let raw = msg.serialize();
        for attempt in 1..=tries {
            if self.ctx.run().is_stop_requested() {
                tracing::debug!(aux = %self.name, token = msg.token, "Stop requested, not sending");
                return false;
            }
            if let Err(e) = self.transport.send(&raw, self.routing()) {
                tracing::warn!(
                    aux = %self.name,
                    token = msg.token,
                    attempt,
                    error = %e,
                    "Send failed"
                );
                continue;
            }

            let response = match waiter {
                Some(rx) => rx.recv_timeout(per_try).ok(),
                None => self.read_direct(msg, per_try),
            };
            match response {
                Some(resp) if resp.is_positive_ack() => {
                    tracing::debug!(aux = %self.name, token = msg.token, attempt, "Acked");
                    return true;
                }
                Some(resp) => tracing::debug!(
                    aux = %self.name,
                    token = msg.token,
                    attempt,
                    response = %resp,
                    "Negative response"
                ),
                None => {
                    tracing::debug!(aux = %self.name, token = msg.token, attempt, "No response")
                }
            }
        }
        tracing::warn!(aux = %self.name, tries, "No ack for {}", msg);
        false
    }

    fn read_direct(&self, msg: &Message, timeout: Duration) -> Option<Message> {
        let frame = match self.transport.receive(timeout) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(aux = %self.name, error = %e, "Receive failed");
                return None;
            }
        };
        if !self.config.accepts(frame.remote_id) {
            return None;
        }
        let raw = frame.msg?;
        match Message::parse(&raw) {
            Ok(resp) if msg.matches(&resp) => Some(resp),
            Ok(other) => {
                tracing::debug!(aux = %self.name, received = %other, "Unrelated message");
                None
            }
            Err(e) => {
                tracing::debug!(aux = %self.name, error = %e, "Malformed response");
                None
            }
        }
    }

    fn handle_inbound(&self, raw: &[u8]) {
        let msg = match Message::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(
                    aux = %self.name,
                    error = %e,
                    raw = %hex::encode(raw),
                    "Dropping malformed message"
                );
                return;
            }
        };

        match msg.kind {
            MessageKind::Ack(_) => {
                let waiter = self.pending_acks.lock().get(&msg.token).cloned();
                match waiter {
                    Some(tx) => {
                        let _ = tx.try_send(msg);
                    }
                    None => tracing::debug!(aux = %self.name, received = %msg, "Stray ack"),
                }
            }
            MessageKind::Report(_) => {
                self.acknowledge(&msg);
                tracing::debug!(aux = %self.name, report = %msg, "Report received");
                let _ = self.report_tx.send(msg);
            }
            MessageKind::Log(level) => {
                self.acknowledge(&msg);
                emit_device_log(&self.name, level, &msg);
            }
            MessageKind::Command(_) => {
                tracing::trace!(aux = %self.name, received = %msg, "Ignoring inbound command")
            }
        }
    }

    fn acknowledge(&self, msg: &Message) {
        let ack = msg.ack(AckType::Ack);
        if let Err(e) = self.transport.send(&ack.serialize(), self.routing()) {
            tracing::warn!(
                aux = %self.name,
                token = msg.token,
                error = %e,
                "Failed to ack device message"
            );
        }
    }
}

impl Drop for AuxiliaryInner {
    fn drop(&mut self) {
        if self.rx_active.load(Ordering::SeqCst) {
            if let Some(group) = self.loops.get_mut().as_ref() {
                group.signal();
            }
            self.close_transport();
        }
    }
}

fn emit_device_log(name: &str, level: LogType, msg: &Message) {
    let text = msg.tlv.get_text(TlvTag::LogMessage).unwrap_or_default();
    let (suite, case) = (msg.test_suite, msg.test_case);
    match level {
        LogType::Error => tracing::error!(aux = %name, suite, case, "device: {}", text),
        LogType::Warning => tracing::warn!(aux = %name, suite, case, "device: {}", text),
        LogType::Info => tracing::info!(aux = %name, suite, case, "device: {}", text),
        LogType::Debug | LogType::Reserved => {
            tracing::debug!(aux = %name, suite, case, "device: {}", text)
        }
    }
}

fn rx_loop(inner: Weak<AuxiliaryInner>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let Some(inner) = inner.upgrade() else { break };
        let poll = inner.config.poll_interval();
        match inner.transport.receive(poll) {
            Ok(frame) => match frame.msg {
                Some(raw) if inner.config.accepts(frame.remote_id) => inner.handle_inbound(&raw),
                Some(_) => tracing::trace!(
                    aux = %inner.name,
                    source = ?frame.remote_id,
                    "Frame for another auxiliary"
                ),
                None => {}
            },
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(aux = %inner.name, error = %e, "Receive failed");
                }
                drop(inner);
                thread::sleep(poll);
            }
        }
    }
}

fn tx_loop(inner: Weak<AuxiliaryInner>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let Some(inner) = inner.upgrade() else { break };
        match inner.command_rx.recv_timeout(inner.config.poll_interval()) {
            Ok(command) => {
                let response = inner.execute(command);
                let _ = inner.response_tx.send(response);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
