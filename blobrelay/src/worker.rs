//! Notification poll loop.
//!
//! A single background task drains the blob-created notification queue:
//! fetch a batch, process each message independently, sleep, repeat. Message
//! content is expected to be base64-encoded Event Grid JSON whose `subject`
//! names the created blob
//! (`/blobServices/default/containers/{container}/blobs/{name}`), but
//! nothing about a message is trusted: bad base64 falls back to the raw
//! string, bad JSON degrades the blob name to `unknown`, and both still
//! count as processed. Only a failure to delete leaves a message on the
//! queue for redelivery after its visibility timeout.

use crate::azure::{MessageQueue, QueueMessage};
use crate::config::WorkerConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of processing a single queue message.
///
/// One value per message; a failing message never affects the rest of its
/// batch.
#[derive(Debug)]
pub enum MessageOutcome {
    /// Decoded, logged and deleted. `blob_name` is `unknown` when the
    /// payload could not be parsed, which still counts as processed.
    Processed { blob_name: String },
    /// The delete call failed; the message stays leased and will reappear
    /// after the queue's visibility timeout.
    Failed { error: anyhow::Error },
}

/// Polls a notification queue and logs blob-created events.
///
/// `spawn` is idempotent per poller instance: an atomic guard ensures at
/// most one loop runs no matter how many times startup paths trigger it.
pub struct QueuePoller {
    queue: Arc<dyn MessageQueue>,
    config: WorkerConfig,
    started: AtomicBool,
}

impl QueuePoller {
    pub fn new(queue: Arc<dyn MessageQueue>, config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            config,
            started: AtomicBool::new(false),
        })
    }

    /// Start the poll loop on the tokio runtime, at most once.
    ///
    /// Returns `None` if the loop is already running. The returned handle
    /// completes after `shutdown` is cancelled and the current batch
    /// finishes.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        if self.started.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            warn!("Queue poller already running, ignoring duplicate start");
            return None;
        }
        let poller = self.clone();
        Some(tokio::spawn(async move { poller.run(shutdown).await }))
    }

    /// The poll loop. Runs until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            max_batch_size = self.config.max_batch_size,
            poll_interval_secs = self.config.poll_interval_secs,
            "Starting to monitor notification queue"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let backoff = match self.queue.receive_messages(self.config.max_batch_size).await {
                Ok(messages) => {
                    for message in &messages {
                        match self.process_message(message).await {
                            MessageOutcome::Processed { blob_name } => {
                                info!(message_id = %message.id, blob_name, "Message processed and deleted");
                            }
                            MessageOutcome::Failed { error } => {
                                error!(message_id = %message.id, "Error processing message: {error:#}");
                            }
                        }
                    }
                    Duration::from_secs(self.config.poll_interval_secs)
                }
                Err(e) => {
                    error!("Error receiving messages: {e:#}");
                    Duration::from_secs(self.config.error_backoff_secs)
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        info!("Queue poller stopped");
    }

    /// Process one message: decode, derive the blob name, emit the console
    /// block, delete. Decode and parse failures are tolerated; only a
    /// failed delete marks the message as failed.
    async fn process_message(&self, message: &QueueMessage) -> MessageOutcome {
        info!(message_id = %message.id, "Processing message");

        let (decoded, was_base64) = decode_content(&message.content);
        if !was_base64 {
            warn!(message_id = %message.id, "Failed to decode base64 content, using raw content");
        }

        let blob_name = extract_blob_name(&decoded);
        info!(message_id = %message.id, blob_name, "Detected blob");

        // Human-readable block on stdout, alongside the structured logs.
        println!("\n=============================================");
        println!("NEW MESSAGE RECEIVED FROM STORAGE QUEUE:");
        println!("ID: {}", message.id);
        println!("Blob name: {}", blob_name);
        println!("Content: {}", message.content);
        println!("=============================================\n");

        if let Err(error) = self.queue.delete_message(&message.id, &message.pop_receipt).await {
            return MessageOutcome::Failed { error };
        }

        MessageOutcome::Processed { blob_name }
    }
}

/// Decode message content as base64 text, falling back to the raw string.
///
/// The flag reports whether decoding succeeded; a decode failure is
/// non-fatal and only worth a warning upstream.
pub fn decode_content(raw: &str) -> (String, bool) {
    match BASE64_STANDARD.decode(raw.trim()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => (text, true),
            Err(_) => (raw.to_string(), false),
        },
        Err(_) => (raw.to_string(), false),
    }
}

/// Derive a blob name from decoded message text.
///
/// Parses the text as JSON and takes the `subject` substring after the last
/// `/blobs/` marker. Any other shape (non-JSON text, missing or non-string
/// `subject`, no marker) yields the literal `unknown`.
pub fn extract_blob_name(text: &str) -> String {
    let subject = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|event| event.get("subject").and_then(|s| s.as_str()).map(str::to_string));

    match subject {
        Some(subject) => match subject.rfind("/blobs/") {
            Some(idx) => subject[idx + "/blobs/".len()..].to_string(),
            None => "unknown".to_string(),
        },
        None => "unknown".to_string(),
    }
}
