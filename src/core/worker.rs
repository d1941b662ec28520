//! Background loop threads sharing one running flag

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A set of named threads stopped together.
///
/// Each loop polls the shared flag between bounded waits, so `stop` returns
/// once every loop finishes its current wait.
pub(crate) struct LoopGroup {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl LoopGroup {
    /// Create an empty group in the running state
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            handles: Vec::new(),
        }
    }

    /// Spawn a loop; it receives the shared running flag
    pub fn spawn<F>(&mut self, name: String, body: F) -> io::Result<()>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = self.running.clone();
        let handle = thread::Builder::new().name(name).spawn(move || body(running))?;
        self.handles.push(handle);
        Ok(())
    }

    /// Clear the flag without waiting
    pub fn signal(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Clear the flag and join every loop
    pub fn stop(&mut self) {
        self.signal();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Loop thread panicked");
            }
        }
    }
}

impl Drop for LoopGroup {
    fn drop(&mut self) {
        self.signal();
    }
}
