//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - An in-memory replicator descriptor that records calls
//! - Polling helpers for asynchronous worker assertions

pub mod mock_replicator;

pub use mock_replicator::*;

use std::future::Future;
use std::time::Duration;

/// Poll `check` every 10ms until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
