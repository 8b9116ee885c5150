use async_trait::async_trait;
use idlewatch_common::Outcome;
use idlewatch_providers::inventory::FleetInstance;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-instance work run by the pool. Must not fail: errors are outcomes.
#[async_trait]
pub trait InstanceHandler: Send + Sync + 'static {
    async fn handle(&self, instance: &FleetInstance) -> Outcome;
}

#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub instance: FleetInstance,
    pub outcome: Outcome,
}

/// Handed back by [`WorkerPool::run`]; results are drained by the summary.
pub struct PoolRun {
    pub results: mpsc::UnboundedReceiver<InstanceResult>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    poll_interval: Duration,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(8, Duration::from_millis(500))
    }
}

impl WorkerPool {
    pub fn new(concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Feed every instance through `handler` with at most `concurrency` in
    /// flight. Returns when the queue is drained, or within one poll interval
    /// of `cancel` firing; in the latter case workers are aborted and
    /// unprocessed instances produce no result.
    pub async fn run<H: InstanceHandler>(
        &self,
        handler: Arc<H>,
        instances: Vec<FleetInstance>,
        cancel: CancellationToken,
    ) -> PoolRun {
        let queue = Arc::new(Mutex::new(VecDeque::from(instances)));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for worker_id in 0..self.concurrency {
            let queue = queue.clone();
            let handler = handler.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                worker_loop(worker_id, queue, handler, tx, cancel).await;
            });
        }
        drop(tx);

        let mut cancelled = false;
        while !workers.is_empty() {
            if cancel.is_cancelled() {
                warn!("worker pool interrupted; abandoning remaining instances");
                workers.abort_all();
                // Reap the aborted workers so their in-flight handlers are
                // aborted too before we hand the results back.
                while workers.join_next().await.is_some() {}
                cancelled = true;
                break;
            }
            match tokio::time::timeout(self.poll_interval, workers.join_next()).await {
                Ok(Some(Err(e))) if !e.is_cancelled() => warn!("worker task failed: {}", e),
                Ok(_) | Err(_) => {}
            }
        }

        PoolRun {
            results: rx,
            cancelled,
        }
    }
}

struct AbortOnDrop(JoinHandle<Outcome>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn next_instance(queue: &Mutex<VecDeque<FleetInstance>>) -> Option<FleetInstance> {
    match queue.lock() {
        Ok(mut q) => q.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

async fn worker_loop<H: InstanceHandler>(
    worker_id: usize,
    queue: Arc<Mutex<VecDeque<FleetInstance>>>,
    handler: Arc<H>,
    tx: mpsc::UnboundedSender<InstanceResult>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let Some(instance) = next_instance(&queue) else {
            break;
        };

        // Run in its own task so a panic is confined to this instance. The
        // guard aborts it if this worker is aborted mid-instance.
        let task_handler = handler.clone();
        let task_instance = instance.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move {
            task_handler.handle(&task_instance).await
        }));
        let outcome = match (&mut task.0).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} - unable to stop: handler panicked: {}", instance.name, e);
                Outcome::Failed(format!("handler panicked: {}", e))
            }
        };

        if tx.send(InstanceResult { instance, outcome }).is_err() {
            break;
        }
    }
    debug!("worker {} done", worker_id);
}
