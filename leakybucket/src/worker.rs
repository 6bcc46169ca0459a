//! Background task that owns a bucket and pours events into it one at a time.

use crate::{
    event::Event,
    leaky::{BucketStats, Leaky, PourError},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Handle to a bucket running in its own task.
///
/// Events are delivered through a bounded queue, so the bucket has a single consumer
/// and pours are applied in the order they were sent. When the bucket is blocked on
/// delivering an overflow, the input queue fills up and [`BucketWorker::pour`] waits.
pub struct BucketWorker {
    input_tx: mpsc::Sender<Event>,
    stop_token: CancellationToken,
    worker_handle: JoinHandle<Result<BucketStats, PourError>>,
}

impl BucketWorker {
    /// Move `bucket` into a new task, with room for `input_queue_size` pending events.
    ///
    /// # Panics
    /// Panics if `input_queue_size` is 0.
    pub fn spawn(bucket: Leaky, input_queue_size: usize) -> Self {
        let (input_tx, input_rx) = mpsc::channel(input_queue_size);
        let stop_token = CancellationToken::new();

        let worker = Worker {
            bucket,
            input_rx,
            stop_token: stop_token.clone(),
        };
        let worker_handle = tokio::spawn(worker.run());

        Self {
            input_tx,
            stop_token,
            worker_handle,
        }
    }

    /// Queue an event for the bucket.
    ///
    /// Fails with [`PourError::WorkerGone`] if the worker has stopped, in which case
    /// [`BucketWorker::finish`] gives the reason.
    pub async fn pour(&self, event: Event) -> Result<(), PourError> {
        self.input_tx
            .send(event)
            .await
            .map_err(|_| PourError::WorkerGone)
    }

    /// Ask the worker to stop after the pour in progress. Queued events are dropped.
    ///
    /// A pour waiting on a full overflow channel is not interrupted, so the worker stops
    /// once the consumer takes that overflow.
    pub fn request_stop(&self) {
        self.stop_token.cancel();
    }

    /// The token behind [`BucketWorker::request_stop`], for stopping the worker from
    /// another task.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    /// Close the input, wait for queued events to be poured, and return the final stats.
    pub async fn finish(self) -> Result<BucketStats, PourError> {
        drop(self.input_tx);
        match self.worker_handle.await {
            Ok(result) => result,
            Err(err) => {
                error!("Bucket worker task failed: {err}");
                Err(PourError::WorkerGone)
            }
        }
    }
}

struct Worker {
    bucket: Leaky,
    input_rx: mpsc::Receiver<Event>,
    stop_token: CancellationToken,
}

impl Worker {
    async fn run(mut self) -> Result<BucketStats, PourError> {
        loop {
            tokio::select! {
                biased;
                _ = self.stop_token.cancelled() => {
                    info!(scenario = self.bucket.name(), "Stop requested, bucket worker exiting");
                    break;
                }
                event = self.input_rx.recv() => {
                    let Some(event) = event else {
                        break; // Channel closed
                    };
                    // Discards are logged by the bucket
                    if let Err(err) = self.bucket.pour(event).await {
                        error!("Bucket worker stopping: {err}");
                        return Err(err);
                    }
                }
            }
        }

        let stats = self.bucket.stats();
        debug!(
            scenario = self.bucket.name(),
            "Bucket worker done: {} events, state {}",
            stats.total_count,
            stats.state
        );
        Ok(stats)
    }
}
