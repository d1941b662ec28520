//! Cross-process proxy link
//!
//! The process-based proxy runs its dispatcher inside `auxlink-proxyd`.
//! Parent and child exchange newline-delimited JSON over the child's stdio:
//! [`ProxyRequest`] lines go in on stdin, [`Delivery`] lines come back on
//! stdout. Payloads are hex-encoded.

use super::channel::ProxyChannel;
use super::dispatch::{
    Delivery, Dispatcher, HubLink, LinkClosed, ProxyFrame, ProxyRequest, SubscriberId,
};
use super::ProxyError;
use crate::core::trace::{TraceConfig, TraceSink};
use crate::core::transport::{Transport, TransportConfig};
use crate::core::worker::LoopGroup;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Name of the proxy host binary
pub const PROXYD_BIN: &str = "auxlink-proxyd";

const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Link over a line-oriented byte stream, used inside the proxy child
pub struct StreamLink<W> {
    requests: Receiver<ProxyRequest>,
    writer: Mutex<W>,
}

impl<W: Write + Send> StreamLink<W> {
    /// Start reading requests from `reader` on a background thread
    pub fn new<R>(reader: R, writer: W) -> io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("proxy-link-reader".into())
            .spawn(move || read_lines(reader, "request", |request| tx.send(request).is_ok()))?;
        Ok(Self {
            requests: rx,
            writer: Mutex::new(writer),
        })
    }
}

impl<W: Write + Send> HubLink for StreamLink<W> {
    fn next_request(&self, timeout: Duration) -> Result<Option<ProxyRequest>, LinkClosed> {
        match self.requests.recv_timeout(timeout) {
            Ok(request) => Ok(Some(request)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LinkClosed),
        }
    }

    fn deliver(&self, to: SubscriberId, frame: ProxyFrame) -> Result<(), LinkClosed> {
        let mut writer = self.writer.lock();
        write_line(&mut *writer, &Delivery { to, frame }).map_err(|e| {
            tracing::debug!(error = %e, "Delivery write failed");
            LinkClosed
        })
    }
}

/// Parse one JSON value per line until EOF or until `handle` returns false
fn read_lines<R, T, F>(reader: R, what: &str, mut handle: F)
where
    R: BufRead,
    T: DeserializeOwned,
    F: FnMut(T) -> bool,
{
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Proxy link read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(value) => {
                if !handle(value) {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed {} line", what),
        }
    }
}

fn write_line<W: Write + ?Sized, T: serde::Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Run a proxy dispatcher over a stream pair until the request side closes.
///
/// Opens `transport` first and closes it on the way out.
pub fn serve<R, W>(
    name: &str,
    transport: Arc<dyn Transport>,
    reader: R,
    writer: W,
    subscribers: Vec<String>,
    trace: Option<Arc<TraceSink>>,
    poll: Duration,
) -> Result<(), ProxyError>
where
    R: BufRead + Send + 'static,
    W: Write + Send,
{
    transport.open()?;
    tracing::info!(
        proxy = %name,
        transport = %transport.describe(),
        subscribers = subscribers.len(),
        "Proxy serving"
    );

    let link = StreamLink::new(reader, writer).map_err(ProxyError::Spawn)?;
    let dispatcher = Dispatcher::new(name, link, transport.clone(), subscribers).with_trace(trace);
    let running = AtomicBool::new(true);

    thread::scope(|s| {
        s.spawn(|| dispatcher.run_receive(&running, poll));
        dispatcher.run_forward(&running, poll);
    });

    tracing::info!(proxy = %name, "Proxy link closed");
    transport.close()?;
    Ok(())
}

/// Everything the parent needs to start a proxy child
pub(crate) struct ProcessSpec<'a> {
    pub name: &'a str,
    pub program: PathBuf,
    pub transport: &'a TransportConfig,
    pub subscribers: Vec<String>,
    pub trace: Option<&'a TraceConfig>,
    pub poll: Duration,
}

impl ProcessSpec<'_> {
    fn command(&self) -> Result<Command, ProxyError> {
        let transport_json =
            serde_json::to_string(self.transport).map_err(|e| ProxyError::Link(e.to_string()))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("--name")
            .arg(self.name)
            .arg("--transport-json")
            .arg(transport_json)
            .arg("--poll-ms")
            .arg(self.poll.as_millis().to_string());
        for subscriber in &self.subscribers {
            cmd.arg("--subscriber").arg(subscriber);
        }
        if let Some(trace) = self.trace {
            cmd.arg("--trace")
                .arg(&trace.path)
                .arg("--trace-format")
                .arg(trace.format.as_str());
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        Ok(cmd)
    }
}

/// Parent side of a running proxy child
pub(crate) struct ProcessBridge {
    name: String,
    child: Child,
    loops: LoopGroup,
}

impl ProcessBridge {
    /// Spawn the child and start pumping requests in and deliveries out
    pub fn spawn(
        spec: &ProcessSpec<'_>,
        requests: Receiver<ProxyRequest>,
        routes: HashMap<SubscriberId, ProxyChannel>,
    ) -> Result<Self, ProxyError> {
        let mut child = spec.command()?.spawn().map_err(ProxyError::Spawn)?;
        tracing::info!(
            proxy = %spec.name,
            pid = child.id(),
            program = %spec.program.display(),
            "Proxy child started"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Link("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Link("child stdout unavailable".into()))?;

        let mut bridge = Self {
            name: spec.name.to_string(),
            child,
            loops: LoopGroup::new(),
        };

        let poll = spec.poll;
        let pump = bridge.loops.spawn(format!("{}-pump", spec.name), move |running| {
            let mut stdin = BufWriter::new(stdin);
            while running.load(Ordering::SeqCst) {
                match requests.recv_timeout(poll) {
                    Ok(request) => {
                        if let Err(e) = write_line(&mut stdin, &request) {
                            tracing::warn!(error = %e, "Proxy child stdin closed");
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Dropping stdin here is what tells the child to exit
        });

        let deliveries = pump.and_then(|()| {
            bridge.loops.spawn(format!("{}-deliveries", spec.name), move |_running| {
                // Runs until the child closes stdout
                read_lines(BufReader::new(stdout), "delivery", |delivery: Delivery| {
                    match routes.get(&delivery.to) {
                        Some(channel) => channel.push(delivery.frame),
                        None => tracing::debug!(subscriber = delivery.to, "No route for delivery"),
                    }
                    true
                });
            })
        });

        if let Err(e) = deliveries {
            bridge.stop();
            return Err(ProxyError::Spawn(e));
        }
        Ok(bridge)
    }

    /// Close the child's stdin, wait for it to exit, then join the pumps
    pub fn stop(&mut self) {
        self.loops.signal();
        let deadline = Instant::now() + CHILD_EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(proxy = %self.name, %status, "Proxy child exited");
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => {
                    tracing::warn!(proxy = %self.name, "Proxy child did not exit, killing it");
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
                Err(e) => {
                    tracing::warn!(proxy = %self.name, error = %e, "Cannot query proxy child");
                    break;
                }
            }
        }
        self.loops.stop();
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
