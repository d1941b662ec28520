//! Shared controller state
//!
//! The token counter and the stop flag are owned here and handed by `Arc` to
//! every engine and proxy that needs them.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Cyclic allocator for correlation tokens.
///
/// Tokens wrap at 256, so uniqueness only holds within a 256-message window.
#[derive(Debug, Default)]
pub struct TokenAllocator {
    next: AtomicU8,
}

impl TokenAllocator {
    /// Allocator starting at token 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator starting at `first`
    pub fn starting_at(first: u8) -> Self {
        Self {
            next: AtomicU8::new(first),
        }
    }

    /// Hand out the next token
    pub fn next_token(&self) -> u8 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Controller-wide cancellation flag.
///
/// Once set, new blocking waits return their sentinel immediately. I/O calls
/// already in flight are bounded by their own timeouts.
#[derive(Debug, Default)]
pub struct RunController {
    stop: AtomicBool,
}

impl RunController {
    /// Create a controller in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every engine to stop waiting
    pub fn request_stop(&self) {
        tracing::info!("Stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once a stop has been requested
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Clear a previous stop request
    pub fn clear(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }
}

/// State shared by all engines of one controller
#[derive(Debug, Default)]
pub struct ControllerContext {
    tokens: TokenAllocator,
    run: RunController,
}

impl ControllerContext {
    /// Fresh context behind an `Arc`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Token allocator
    pub fn tokens(&self) -> &TokenAllocator {
        &self.tokens
    }

    /// Stop flag
    pub fn run(&self) -> &RunController {
        &self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_wrap_at_256() {
        let tokens = TokenAllocator::starting_at(254);
        assert_eq!(tokens.next_token(), 254);
        assert_eq!(tokens.next_token(), 255);
        assert_eq!(tokens.next_token(), 0);
        assert_eq!(tokens.next_token(), 1);
    }

    #[test]
    fn test_tokens_unique_in_window() {
        let tokens = TokenAllocator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            assert!(seen.insert(tokens.next_token()));
        }
        assert!(!seen.insert(tokens.next_token()));
    }

    #[test]
    fn test_stop_flag() {
        let ctx = ControllerContext::shared();
        assert!(!ctx.run().is_stop_requested());
        ctx.run().request_stop();
        assert!(ctx.run().is_stop_requested());
        ctx.run().clear();
        assert!(!ctx.run().is_stop_requested());
    }
}
