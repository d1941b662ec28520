//! Proxy multiplexer
//!
//! Lets several auxiliaries share one real transport as if each had it to
//! itself. Each subscriber owns a [`ProxyChannel`] stand-in; the proxy owner
//! is the only thing that ever touches the real transport.
//!
//! - Sends from one subscriber go out once and are echoed to every *other*
//!   subscriber (nobody sees their own echo).
//! - Frames read from the transport go to *every* subscriber, with the
//!   source id attached.
//!
//! The dispatch loops run on threads ([`ProxyTarget::Local`]) or inside an
//! `auxlink-proxyd` child process ([`ProxyTarget::Process`]). They start when
//! the first channel opens and stop when the last one closes.

mod channel;
mod dispatch;
mod remote;

pub use channel::ProxyChannel;
pub use dispatch::{
    Delivery, Dispatcher, HubLink, LinkClosed, LocalLink, ProxyFrame, ProxyRequest, SubscriberId,
};
pub use remote::{serve, StreamLink, PROXYD_BIN};

use crate::core::auxiliary::Auxiliary;
use crate::core::trace::{TraceConfig, TraceSink};
use crate::core::transport::{Transport, TransportConfig, TransportError};
use crate::core::worker::LoopGroup;
use channel::Binding;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use remote::{ProcessBridge, ProcessSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Subscriber rejected at attach time
    #[error("Subscriber {name} cannot be proxied: {reason}")]
    IncompatibleSubscriber {
        /// Subscriber name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Channel used before a proxy attached it
    #[error("Proxy channel is not bound to a proxy")]
    NotBound,

    /// The real transport lives in a proxy child process
    #[error("Transport of proxy {0} lives in a child process")]
    RemoteTransport(String),

    /// Real transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Thread or child process could not be started
    #[error("Failed to spawn proxy worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Trace file could not be opened
    #[error("Failed to open trace file: {0}")]
    Trace(#[source] std::io::Error),

    /// Cross-process link failure
    #[error("Proxy link error: {0}")]
    Link(String),
}

/// Where the real transport lives
#[derive(Clone)]
pub enum ProxyTarget {
    /// In this process; dispatch loops run on threads
    Local(Arc<dyn Transport>),
    /// Built and opened inside an `auxlink-proxyd` child
    Process(TransportConfig),
}

impl ProxyTarget {
    fn describe(&self) -> String {
        match self {
            ProxyTarget::Local(transport) => transport.describe(),
            ProxyTarget::Process(config) => format!("{:?} (child process)", config),
        }
    }
}

/// Dispatch model, as found in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Dispatch on threads
    #[default]
    Thread,
    /// Dispatch in a child process
    Process,
}

/// Proxy tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Record forwarded frames
    pub trace: Option<TraceConfig>,
    /// Poll interval of the dispatch loops
    pub poll_interval_ms: u64,
    /// Proxy host binary for process mode
    pub program: Option<PathBuf>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            trace: None,
            poll_interval_ms: 20,
            program: None,
        }
    }
}

impl ProxyOptions {
    fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn program(&self) -> PathBuf {
        self.program.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(PROXYD_BIN)))
                .filter(|path| path.exists())
                .unwrap_or_else(|| PathBuf::from(PROXYD_BIN))
        })
    }
}

enum Runner {
    Threads {
        loops: LoopGroup,
        transport: Arc<dyn Transport>,
    },
    Process(ProcessBridge),
}

#[derive(Default)]
struct RunState {
    /// Open channels
    holders: usize,
    /// Started explicitly through `create_instance`
    pinned: bool,
    runner: Option<Runner>,
}

/// State shared between the proxy owner and its channels
pub(crate) struct ProxyShared {
    pub(crate) name: String,
    pub(crate) target: RwLock<ProxyTarget>,
    options: ProxyOptions,
    subscribers: Vec<(String, ProxyChannel)>,
    request_tx: Sender<ProxyRequest>,
    request_rx: Receiver<ProxyRequest>,
    state: Mutex<RunState>,
}

impl ProxyShared {
    /// A channel opened
    pub(crate) fn acquire(&self) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        if state.runner.is_none() {
            state.runner = Some(self.start_runner()?);
        }
        state.holders += 1;
        Ok(())
    }

    /// A channel closed
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.holders = state.holders.saturating_sub(1);
        if state.holders == 0 && !state.pinned {
            if let Some(runner) = state.runner.take() {
                tracing::debug!(proxy = %self.name, "Last channel closed");
                self.stop_runner(runner);
            }
        }
    }

    fn routes(&self) -> HashMap<SubscriberId, ProxyChannel> {
        self.subscribers
            .iter()
            .enumerate()
            .map(|(id, (_, channel))| (id as SubscriberId, channel.clone()))
            .collect()
    }

    fn names(&self) -> Vec<String> {
        self.subscribers.iter().map(|(name, _)| name.clone()).collect()
    }

    fn start_runner(&self) -> Result<Runner, ProxyError> {
        while self.request_rx.try_recv().is_ok() {}
        let target = self.target.read().clone();
        tracing::info!(proxy = %self.name, target = %target.describe(), "Starting proxy");

        match target {
            ProxyTarget::Local(transport) => self.start_threads(transport),
            ProxyTarget::Process(config) => {
                let spec = ProcessSpec {
                    name: &self.name,
                    program: self.options.program(),
                    transport: &config,
                    subscribers: self.names(),
                    trace: self.options.trace.as_ref(),
                    poll: self.options.poll(),
                };
                let bridge = ProcessBridge::spawn(&spec, self.request_rx.clone(), self.routes())?;
                Ok(Runner::Process(bridge))
            }
        }
    }

    fn start_threads(&self, transport: Arc<dyn Transport>) -> Result<Runner, ProxyError> {
        let trace = match &self.options.trace {
            Some(config) => Some(Arc::new(TraceSink::create(config).map_err(ProxyError::Trace)?)),
            None => None,
        };
        transport.open()?;

        let link = LocalLink::new(self.request_rx.clone(), self.routes());
        let dispatcher = Arc::new(
            Dispatcher::new(self.name.clone(), link, transport.clone(), self.names())
                .with_trace(trace),
        );
        let poll = self.options.poll();

        let mut loops = LoopGroup::new();
        let forward = dispatcher.clone();
        let spawned = loops
            .spawn(format!("{}-forward", self.name), move |running| {
                forward.run_forward(&running, poll)
            })
            .and_then(|()| {
                loops.spawn(format!("{}-receive", self.name), move |running| {
                    dispatcher.run_receive(&running, poll)
                })
            });

        if let Err(e) = spawned {
            loops.stop();
            let _ = transport.close();
            return Err(ProxyError::Spawn(e));
        }
        Ok(Runner::Threads { loops, transport })
    }

    fn stop_runner(&self, runner: Runner) {
        match runner {
            Runner::Threads {
                mut loops,
                transport,
            } => {
                loops.stop();
                if let Err(e) = transport.close() {
                    tracing::warn!(proxy = %self.name, error = %e, "Transport close failed");
                }
            }
            Runner::Process(mut bridge) => bridge.stop(),
        }
        tracing::info!(proxy = %self.name, "Proxy stopped");
    }
}

/// The proxy owner: holds the real transport on behalf of its subscribers
pub struct ProxyAuxiliary {
    shared: Arc<ProxyShared>,
}

impl ProxyAuxiliary {
    /// Attach `subscribers` to a new proxy.
    ///
    /// Every subscriber must be proxy-capable and own an unbound
    /// [`ProxyChannel`] as its transport; otherwise nothing is attached and
    /// [`ProxyError::IncompatibleSubscriber`] is returned.
    pub fn new(
        name: impl Into<String>,
        target: ProxyTarget,
        subscribers: &[Auxiliary],
        options: ProxyOptions,
    ) -> Result<Self, ProxyError> {
        let name = name.into();
        let mut attached: Vec<(String, ProxyChannel)> = Vec::with_capacity(subscribers.len());

        for aux in subscribers {
            let reject = |reason: &str| ProxyError::IncompatibleSubscriber {
                name: aux.name().to_string(),
                reason: reason.to_string(),
            };
            if !aux.is_proxy_capable() {
                return Err(reject("auxiliary is not proxy capable"));
            }
            let channel = aux
                .transport()
                .as_proxy_channel()
                .ok_or_else(|| reject("transport is not a proxy channel"))?;
            if channel.is_bound() {
                return Err(reject("channel is already bound to a proxy"));
            }
            if attached.iter().any(|(_, c)| c.same_channel(&channel)) {
                return Err(reject("channel attached twice"));
            }
            attached.push((aux.name().to_string(), channel));
        }

        let (request_tx, request_rx) = unbounded();
        let shared = Arc::new(ProxyShared {
            name,
            target: RwLock::new(target),
            options,
            subscribers: attached,
            request_tx,
            request_rx,
            state: Mutex::new(RunState::default()),
        });

        for (id, (_, channel)) in shared.subscribers.iter().enumerate() {
            channel.bind(Binding {
                hub: Arc::downgrade(&shared),
                id: id as SubscriberId,
                requests: shared.request_tx.clone(),
            });
        }
        tracing::debug!(proxy = %shared.name, subscribers = ?shared.names(), "Proxy created");
        Ok(Self { shared })
    }

    /// Proxy name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Subscriber names, in id order
    pub fn subscribers(&self) -> Vec<String> {
        self.shared.names()
    }

    /// True while the dispatch loops run
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().runner.is_some()
    }

    /// Start the dispatch loops now and keep them running until
    /// `delete_instance`, whether or not a channel is open
    pub fn create_instance(&self) -> Result<(), ProxyError> {
        let mut state = self.shared.state.lock();
        if state.runner.is_none() {
            state.runner = Some(self.shared.start_runner()?);
        }
        state.pinned = true;
        Ok(())
    }

    /// Stop the dispatch loops. Idempotent.
    pub fn delete_instance(&self) -> bool {
        let mut state = self.shared.state.lock();
        state.pinned = false;
        if let Some(runner) = state.runner.take() {
            if state.holders > 0 {
                tracing::warn!(
                    proxy = %self.shared.name,
                    open = state.holders,
                    "Stopping proxy with open channels"
                );
            }
            self.shared.stop_runner(runner);
        }
        true
    }

    /// Replace the real transport.
    ///
    /// Channels reference the proxy, not the transport, so the swap is
    /// transparent; it takes effect the next time the loops start.
    pub fn swap_transport(&self, target: ProxyTarget) {
        tracing::info!(proxy = %self.shared.name, target = %target.describe(), "Transport swapped");
        *self.shared.target.write() = target;
        if self.is_running() {
            tracing::info!(proxy = %self.shared.name, "Swap applies after the proxy restarts");
        }
    }

    /// The real transport, when it lives in this process
    pub fn physical(&self) -> Result<Arc<dyn Transport>, ProxyError> {
        match &*self.shared.target.read() {
            ProxyTarget::Local(transport) => Ok(transport.clone()),
            ProxyTarget::Process(_) => Err(ProxyError::RemoteTransport(self.shared.name.clone())),
        }
    }
}

impl Drop for ProxyAuxiliary {
    fn drop(&mut self) {
        self.delete_instance();
    }
}
