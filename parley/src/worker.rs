//! Fixed-size worker pool draining a bounded job queue.
//!
//! Each worker runs jobs inside an unwind boundary: a panicking job is logged with the
//! backtrace captured at the panic site and the worker moves on to the next job.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::WorkerConfig;
use crate::error::PoolError;
use crate::observability::MetricsSink;

/// A unit of work: a zero-argument callable producing a future.
pub type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Chains onto the existing panic hook to remember where the last panic on this thread
/// happened. Installed once per process.
static PANIC_HOOK: Lazy<()> = Lazy::new(|| {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
        previous(info);
    }));
});

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    token: CancellationToken,
    workers: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    /// Starts `config.worker_num` workers and, when configured, the queue reporter.
    ///
    /// Workers stop once `token` is cancelled: a running job completes, queued jobs are
    /// abandoned.
    pub fn start(
        token: CancellationToken,
        config: &WorkerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Lazy::force(&PANIC_HOOK);

        let worker_num = config.worker_num.max(1);
        let (tx, rx) = mpsc::channel::<Job>(config.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for id in 0..worker_num {
            workers.spawn(work(id, rx.clone(), token.clone(), metrics.clone()));
        }

        if let Some(interval) = config.supervise_interval() {
            workers.spawn(report_queue_length(
                tx.clone(),
                interval,
                token.clone(),
                metrics.clone(),
            ));
        }

        info!(
            workers = worker_num,
            queue_size = config.queue_size.max(1),
            "worker pool started"
        );

        Self {
            tx,
            token,
            workers: Mutex::new(workers),
        }
    }

    /// Queues a job, waiting for room when the queue is full.
    ///
    /// This is the pool's backpressure: callers block until a worker frees a slot.
    /// Returns [`PoolError::Closed`] once the pool is shutting down.
    pub async fn enqueue<F, Fut>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let job: Job = Box::new(move || f().boxed());
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(PoolError::Closed),
            sent = self.tx.send(job) => sent.map_err(|_| PoolError::Closed),
        }
    }

    /// Number of jobs waiting in the queue.
    pub fn queue_len(&self) -> usize {
        queue_len(&self.tx)
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for every worker to finish. Only returns after the pool's token is cancelled.
    pub async fn wait(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!("worker task failed: {}", e);
            }
        }
    }
}

fn queue_len(tx: &mpsc::Sender<Job>) -> usize {
    tx.max_capacity() - tx.capacity()
}

async fn work(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    token: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        let Some(job) = job else {
            break;
        };

        run_isolated(id, job, metrics.as_ref()).await;
    }

    debug!(worker = id, "worker stopped");
}

async fn run_isolated(id: usize, job: Job, metrics: &dyn MetricsSink) {
    let result = AssertUnwindSafe(async move { job().await })
        .catch_unwind()
        .await;

    if let Err(payload) = result {
        let backtrace = PANIC_BACKTRACE
            .with(|slot| slot.borrow_mut().take())
            .map(|bt| bt.to_string())
            .unwrap_or_else(|| "<backtrace unavailable>".to_string());

        error!(
            worker = id,
            "recovered from panicking job: {}\n{}",
            panic_message(payload.as_ref()),
            backtrace
        );
        metrics.incr_counter("worker_panics_total", 1, &[]);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn report_queue_length(
    tx: mpsc::Sender<Job>,
    interval: Duration,
    token: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let len = queue_len(&tx);
                debug!(queue_length = len, "worker queue");
                metrics.set_gauge("worker_queue_length", len as u64, &[]);
            }
        }
    }
}
