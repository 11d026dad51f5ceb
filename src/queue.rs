//! FIFO work queue with bounded concurrency.
//!
//! One driver task pulls items off the backlog in admission order whenever
//! a dispatch slot is free, borrows a worker from the pool, and spawns a
//! dispatch task that waits for readiness, connects, runs the item and
//! returns the worker. `wait` is a barrier over submitted items: it
//! resolves once every previously-added item has published its result or
//! error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Notify};

use crate::error::FleetError;
use crate::pool::Pool;
use crate::work::Work;
use crate::worker::{ReadyOptions, Worker};

/// Backlog depth before `add` starts exerting backpressure.
const BACKLOG_CAPACITY: usize = 1024;

struct QueueInner {
    pool: Arc<dyn Pool>,
    /// Workers currently lent out to dispatch tasks.
    active: Mutex<Vec<Arc<dyn Worker>>>,
    /// Maximum number of concurrent dispatches.
    max_size: AtomicUsize,
    /// Items admitted but not yet completed; `wait` watches this.
    outstanding: watch::Sender<usize>,
    /// Pinged whenever a dispatch slot frees up.
    slot_free: Notify,
}

impl QueueInner {
    fn complete_one(&self) {
        self.outstanding.send_modify(|n| *n -= 1);
    }
}

/// The FIFO, bounded-concurrency scheduler.
pub struct WorkQueue {
    inner: Arc<QueueInner>,
    backlog: mpsc::Sender<Box<dyn Work>>,
}

impl WorkQueue {
    /// Build the queue and spawn its driver task. The driver exits when
    /// the queue value is dropped and the backlog drains.
    pub fn new(pool: Arc<dyn Pool>, max_size: usize) -> Self {
        let (backlog_tx, backlog_rx) = mpsc::channel(BACKLOG_CAPACITY);
        let (outstanding, _) = watch::channel(0usize);

        let inner = Arc::new(QueueInner {
            pool,
            active: Mutex::new(Vec::new()),
            max_size: AtomicUsize::new(max_size),
            outstanding,
            slot_free: Notify::new(),
        });

        tokio::spawn(run_dispatch(inner.clone(), backlog_rx));

        Self {
            inner,
            backlog: backlog_tx,
        }
    }

    /// Admit an item. Non-blocking except under backlog pressure.
    pub async fn add(&self, work: Box<dyn Work>) {
        tracing::debug!(work = %work.describe(), "adding work to queue");
        self.inner.outstanding.send_modify(|n| *n += 1);

        if let Err(send) = self.backlog.send(work).await {
            // Driver gone; fail the item rather than strand its caller.
            send.0.fail(FleetError::Internal("work queue stopped".to_owned()));
            self.inner.complete_one();
        }
    }

    /// Block until every previously-added item has completed, successfully
    /// or not.
    pub async fn wait(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        while *rx.borrow_and_update() != 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Current concurrency bound.
    pub fn max_size(&self) -> usize {
        self.inner.max_size.load(Ordering::Acquire)
    }

    /// Change the concurrency bound. Lowering it never interrupts in-flight
    /// work; it only holds back new dispatches until enough finish.
    pub fn set_max_size(&self, max_size: usize) {
        self.inner.max_size.store(max_size, Ordering::Release);
        self.inner.slot_free.notify_one();
    }
}

/// Single driver: admit strictly in FIFO order, one item per free slot.
async fn run_dispatch(inner: Arc<QueueInner>, mut backlog: mpsc::Receiver<Box<dyn Work>>) {
    loop {
        loop {
            let active = inner.active.lock().await.len();
            if active < inner.max_size.load(Ordering::Acquire) {
                break;
            }
            inner.slot_free.notified().await;
        }

        let Some(work) = backlog.recv().await else {
            // Queue dropped and backlog drained.
            return;
        };
        tracing::debug!(work = %work.describe(), "work received");

        let worker = match inner.pool.get_worker(work.token()).await {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(error = %e, "error getting worker from pool");
                work.fail(e);
                inner.complete_one();
                continue;
            }
        };
        tracing::debug!(work = %work.describe(), worker_id = worker.id(), "worker acquired");

        inner.active.lock().await.push(worker.clone());

        tokio::spawn(dispatch(inner.clone(), work, worker));
    }
}

/// One lent-out worker driving one item to completion.
async fn dispatch(inner: Arc<QueueInner>, work: Box<dyn Work>, worker: Arc<dyn Worker>) {
    let token = work.token().clone();

    tracing::debug!(worker_id = worker.id(), "waiting for worker readiness");
    let ready = worker
        .clone()
        .ready_stream(token.clone(), ReadyOptions::default());

    match ready.await {
        Ok(Ok(())) => match worker.connect(&token).await {
            Ok(()) => {
                tracing::info!(work = %work.describe(), worker_id = worker.id(), "starting work");
                work.run_with(worker.clone()).await;
                tracing::info!(worker_id = worker.id(), "work finished");
            }
            Err(e) => work.fail(e),
        },
        Ok(Err(e)) => work.fail(e),
        Err(_) => work.fail(FleetError::Internal(
            "readiness poll dropped without a verdict".to_owned(),
        )),
    }

    let mut active = inner.active.lock().await;
    if let Some(pos) = active.iter().position(|w| w.equals(worker.as_ref())) {
        active.swap_remove(pos);
    }
    drop(active);

    inner.pool.return_worker(worker).await;
    inner.slot_free.notify_one();
    inner.complete_one();
}
