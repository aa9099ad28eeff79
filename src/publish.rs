// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Asynchronous event publication.
//!
//! `emit()` hands the event to a dedicated writer task over a channel and
//! returns as soon as it is queued: the caller's mutation path never waits
//! on journal IO. Delivery downstream is at-least-once; the journal append
//! itself is atomic.
//!
//! Callers that need to observe their event in the journal (tests, mostly)
//! can await [`EventPublisher::flush`], which round-trips a marker through
//! the writer task.

use crate::error::{GeoError, Result};
use crate::event::{new_correlation_id, EventKind};
use crate::journal::EventJournal;
use crate::resilience::RetryConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PUBLISH_QUEUE_DEPTH: usize = 1024;

enum Command {
    Emit {
        replicable_type: String,
        event_name: EventKind,
        payload: serde_json::Value,
        correlation_id: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle for publishing events without blocking on journal IO.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Command>,
}

impl EventPublisher {
    /// Spawn the writer task and return the publishing handle.
    ///
    /// The task drains the queue into the journal and exits when every
    /// publisher handle has been dropped. Retryable append failures are
    /// retried on the `retry` schedule before the event is given up on.
    pub fn spawn(journal: EventJournal, retry: RetryConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
        let handle = tokio::spawn(writer_loop(journal, retry, rx));
        (Self { tx }, handle)
    }

    /// Queue an event for publication. Returns the correlation id the
    /// event will carry; a fresh one is generated when the caller has
    /// none.
    pub async fn emit(
        &self,
        replicable_type: &str,
        event_name: EventKind,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Result<String> {
        let correlation_id = correlation_id.unwrap_or_else(new_correlation_id);
        self.tx
            .send(Command::Emit {
                replicable_type: replicable_type.to_string(),
                event_name,
                payload,
                correlation_id: correlation_id.clone(),
            })
            .await
            .map_err(|_| GeoError::Shutdown)?;
        Ok(correlation_id)
    }

    /// Wait until everything queued before this call has been written.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| GeoError::Shutdown)?;
        ack_rx.await.map_err(|_| GeoError::Shutdown)
    }
}

async fn writer_loop(journal: EventJournal, retry: RetryConfig, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Emit {
                replicable_type,
                event_name,
                payload,
                correlation_id,
            } => {
                append_with_retry(
                    &journal,
                    &retry,
                    &replicable_type,
                    event_name,
                    payload,
                    &correlation_id,
                )
                .await;
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    info!("Event writer task stopped");
}

async fn append_with_retry(
    journal: &EventJournal,
    retry: &RetryConfig,
    replicable_type: &str,
    event_name: EventKind,
    payload: serde_json::Value,
    correlation_id: &str,
) {
    let mut attempt = 1;
    loop {
        match journal
            .append(replicable_type, event_name, payload.clone(), correlation_id)
            .await
        {
            Ok(_) => return,
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                warn!(
                    %replicable_type,
                    event_name = %event_name,
                    %correlation_id,
                    attempt,
                    error = %e,
                    "Event append failed, retrying"
                );
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                // Retry budget exhausted or the error is permanent; the
                // event is lost here. Backfill reconciles the resource on
                // the next cycle.
                error!(
                    %replicable_type,
                    event_name = %event_name,
                    %correlation_id,
                    attempt,
                    error = %e,
                    "Failed to append event, dropping"
                );
                return;
            }
        }
    }
}
