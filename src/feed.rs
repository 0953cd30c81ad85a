//! Change-feed client: one task per subscribed topic.
//!
//! Events are never handed to callbacks; each subscription forwards onto
//! the engine's queue and the store task drains it, keeping transport
//! concerns out of the reducer. A disconnect triggers resubscription with
//! exponential backoff, and every reconnect or gap forces a full resync
//! of the topic — gaps are surfaced, never silently dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::entity::{ChangeEvent, Topic};

/// What a subscription pushes onto the engine's queue.
#[derive(Debug, Clone)]
pub enum FeedNotice {
    /// A change event delivered for the topic.
    Event(ChangeEvent),
    /// The subscription reconnected or lagged; the topic must be
    /// re-fetched in full before its view can be trusted again.
    Resync(Topic),
    /// Resubscription is exhausted; only a manual refresh can recover.
    Stale(Topic),
}

/// Handle to a live topic subscription.
pub struct FeedSubscription {
    topic: Topic,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FeedSubscription {
    /// Subscribe `topic` and forward its notices onto `queue`.
    pub fn spawn(
        backend: Arc<dyn Backend>,
        topic: Topic,
        queue: mpsc::Sender<FeedNotice>,
        config: &SyncConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = FeedWorker {
            backend,
            topic: topic.clone(),
            queue,
            backoff_base: config.feed_backoff_base,
            backoff_cap: config.feed_backoff_cap,
            max_retries: config.feed_max_retries,
        };
        let task = tokio::spawn(worker.run(stop_rx));
        Self { topic, stop: Some(stop_tx), task }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Stop the subscription. Idempotent: calling it again, or after the
    /// worker already died, is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The worker may already be gone; that is fine.
            let _ = stop.send(());
            debug!(topic = %self.topic, "unsubscribed change feed topic");
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
        self.task.abort();
    }
}

struct FeedWorker {
    backend: Arc<dyn Backend>,
    topic: Topic,
    queue: mpsc::Sender<FeedNotice>,
    backoff_base: Duration,
    backoff_cap: Duration,
    max_retries: u32,
}

impl FeedWorker {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        let mut receiver = self.backend.subscribe(&self.topic);
        let mut attempts: u32 = 0;

        loop {
            tokio::select! {
                _ = &mut stop => {
                    debug!(topic = %self.topic, "feed worker stopped");
                    return;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        attempts = 0;
                        if self.queue.send(FeedNotice::Event(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %self.topic, skipped, "change feed lagged, forcing resync");
                        if self.queue.send(FeedNotice::Resync(self.topic.clone())).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Closed) => {
                        attempts += 1;
                        if attempts > self.max_retries {
                            warn!(topic = %self.topic, "resubscription exhausted, topic is stale");
                            let _ = self.queue.send(FeedNotice::Stale(self.topic.clone())).await;
                            return;
                        }
                        let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempts);
                        debug!(topic = %self.topic, attempt = attempts, ?delay, "change feed disconnected, resubscribing");
                        tokio::select! {
                            _ = &mut stop => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        receiver = self.backend.subscribe(&self.topic);
                        if self.queue.send(FeedNotice::Resync(self.topic.clone())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
    cap.min(base.saturating_mul(factor))
}
