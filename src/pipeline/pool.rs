use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::StockConsumer;

const RESTART_DELAY: Duration = Duration::from_millis(100);

/// A fixed set of consumer workers sharing one shutdown signal.
///
/// Each worker handles one delivery at a time. Workers run in parallel, so
/// the sequential reservation strategy is only safe with a single worker.
/// A worker that panics is replaced until shutdown is signalled.
pub struct ConsumerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    /// One worker per consumer. Use this when every worker needs its own
    /// broker connection.
    pub fn spawn(consumers: impl IntoIterator<Item = StockConsumer>) -> Self {
        let (shutdown, receiver) = watch::channel(false);

        let handles: Vec<JoinHandle<()>> = consumers
            .into_iter()
            .enumerate()
            .map(|(worker_id, consumer)| supervise(worker_id, consumer, receiver.clone()))
            .collect();

        tracing::info!(workers = handles.len(), "Consumer pool started");

        Self { shutdown, handles }
    }

    /// `workers` copies of one consumer sharing its broker handle.
    pub fn replicate(consumer: StockConsumer, workers: usize) -> Self {
        Self::spawn(std::iter::repeat(consumer).take(workers.max(1)))
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every worker and waits for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        tracing::info!(workers = self.handles.len(), "Stopping consumer pool");
        let _ = self.shutdown.send(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Consumer supervisor failed");
            }
        }
    }
}

fn supervise(worker_id: usize, consumer: StockConsumer, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let worker = tokio::spawn(consumer.clone().run(worker_id, shutdown.clone()));
            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_panic() && !*shutdown.borrow() => {
                    tracing::error!(worker_id = worker_id, error = %e, "Consumer worker panicked, restarting");
                    consumer.worker_restarted(worker_id, &e.to_string()).await;
                    tokio::time::sleep(RESTART_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(worker_id = worker_id, error = %e, "Consumer worker stopped abnormally");
                    break;
                }
            }
        }
    })
}
