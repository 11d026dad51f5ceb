//! Cache of provisioned workers.
//!
//! The pool lends out idle workers and provisions new ones on demand. It
//! deliberately has no upper bound on how many workers it owns; the bound
//! on *concurrent* workers lives in the queue. The pool is a cache of
//! provisioned capacity, not a semaphore.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};
use crate::worker::{ReadyOptions, Worker, WorkerFactory};

/// Lends workers out and accepts them back.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Hand out an idle worker, or provision a fresh one if none is
    /// cached. The worker may not be ready yet; the caller awaits
    /// readiness before use.
    async fn get_worker(&self, ctx: &CancellationToken) -> Result<Arc<dyn Worker>>;

    /// Put a lent-out worker back into the idle rotation. Returning a
    /// worker the pool does not own is a no-op.
    async fn return_worker(&self, worker: Arc<dyn Worker>);

    /// Close every worker the pool owns, terminating their instances.
    /// Returns the last error seen, if any.
    async fn close(&self) -> Result<()>;
}

struct PoolState {
    /// Every worker the pool created and has not yet closed.
    all: Vec<Arc<dyn Worker>>,
    /// Members of `all` not currently lent out, oldest first.
    idle: VecDeque<Arc<dyn Worker>>,
}

/// Default [`Pool`]: a factory plus a mutex-guarded cache.
pub struct WorkerPool {
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(PoolState {
                all: Vec::new(),
                idle: VecDeque::new(),
            }),
        }
    }

    /// Snapshot of pool occupancy.
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            owned: state.all.len(),
            idle: state.idle.len(),
        }
    }
}

/// Occupancy counters, mostly for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers the pool owns, lent out or not.
    pub owned: usize,
    /// Workers sitting in the idle rotation.
    pub idle: usize,
}

#[async_trait]
impl Pool for WorkerPool {
    async fn get_worker(&self, ctx: &CancellationToken) -> Result<Arc<dyn Worker>> {
        let mut state = self.state.lock().await;

        loop {
            let Some(worker) = state.idle.pop_front() else {
                tracing::debug!("no idle worker, provisioning a new one");
                let worker = self.factory.create(ctx).await?;
                state.all.push(worker.clone());
                tracing::debug!(worker_id = worker.id(), "worker added to pool");
                return Ok(worker);
            };

            match worker.is_ready(ctx, ReadyOptions::default()).await {
                Err(FleetError::Closed) => {
                    // A cached worker died behind our back (spot reclaim,
                    // manual close). Forget it and try the next one.
                    tracing::debug!(worker_id = worker.id(), "evicting closed worker");
                    state.all.retain(|w| !w.equals(worker.as_ref()));
                }
                _ => {
                    // Ready, not ready yet, or a transient probe error: hand
                    // it out either way; the caller awaits readiness.
                    tracing::debug!(worker_id = worker.id(), "reusing pooled worker");
                    return Ok(worker);
                }
            }
        }
    }

    async fn return_worker(&self, worker: Arc<dyn Worker>) {
        let mut state = self.state.lock().await;

        if !state.all.iter().any(|w| w.equals(worker.as_ref())) {
            tracing::debug!(worker_id = worker.id(), "ignoring return of unknown worker");
            return;
        }
        if state.idle.iter().any(|w| w.equals(worker.as_ref())) {
            return;
        }

        tracing::debug!(worker_id = worker.id(), "worker returned to pool");
        state.idle.push_back(worker);
    }

    async fn close(&self) -> Result<()> {
        // Hold the lock across termination so late returns cannot race the
        // shutdown.
        let state = self.state.lock().await;
        tracing::info!(workers = state.all.len(), "closing worker pool");

        let mut last_err = None;
        for worker in &state.all {
            if let Err(e) = worker.close().await {
                tracing::error!(worker_id = worker.id(), error = %e, "error closing worker");
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::oneshot;
    use tonic::transport::Channel;

    use crate::proto::job_service_client::JobServiceClient;
    use crate::proto::worker_service_client::WorkerServiceClient;

    /// Worker fake with just enough behavior for pool semantics.
    struct FakeWorker {
        id: String,
        closed: AtomicBool,
        close_calls: AtomicUsize,
        close_result_err: bool,
    }

    impl FakeWorker {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
                close_result_err: false,
            })
        }

        fn failing_close(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
                close_result_err: true,
            })
        }
    }

    #[async_trait]
    impl Worker for FakeWorker {
        fn id(&self) -> &str {
            &self.id
        }
        fn family(&self) -> &'static str {
            "fake"
        }
        async fn connect(&self, _ctx: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn worker(&self) -> Result<WorkerServiceClient<Channel>> {
            Err(FleetError::NotConnected)
        }
        async fn job(&self) -> Result<JobServiceClient<Channel>> {
            Err(FleetError::NotConnected)
        }
        async fn is_ready(&self, _ctx: &CancellationToken, _opts: ReadyOptions) -> Result<bool> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(FleetError::Closed);
            }
            Ok(true)
        }
        fn ready_stream(
            self: Arc<Self>,
            _ctx: CancellationToken,
            _opts: ReadyOptions,
        ) -> oneshot::Receiver<Result<()>> {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(()));
            rx
        }
        async fn close(&self) -> Result<()> {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Err(FleetError::Closed);
            }
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if self.close_result_err {
                return Err(FleetError::Compute("terminate refused".to_owned()));
            }
            Ok(())
        }
    }

    /// Factory handing out a scripted sequence of workers.
    struct FakeFactory {
        workers: std::sync::Mutex<VecDeque<Arc<FakeWorker>>>,
        created: AtomicUsize,
    }

    impl FakeFactory {
        fn with(workers: Vec<Arc<FakeWorker>>) -> Arc<Self> {
            Arc::new(Self {
                workers: std::sync::Mutex::new(workers.into()),
                created: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkerFactory for FakeFactory {
        async fn create(&self, _ctx: &CancellationToken) -> Result<Arc<dyn Worker>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let next = self.workers.lock().unwrap().pop_front();
            match next {
                Some(w) => Ok(w),
                None => Err(FleetError::ProvisionFailed("factory exhausted".to_owned())),
            }
        }
    }

    #[tokio::test]
    async fn get_worker_provisions_when_idle_is_empty() {
        let worker = FakeWorker::new("i-1");
        let factory = FakeFactory::with(vec![worker.clone()]);
        let pool = WorkerPool::new(factory.clone());

        let got = pool.get_worker(&CancellationToken::new()).await.unwrap();
        assert!(got.equals(worker.as_ref() as &dyn Worker));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await, PoolStats { owned: 1, idle: 0 });
    }

    #[tokio::test]
    async fn get_worker_propagates_provision_failure() {
        let factory = FakeFactory::with(vec![]);
        let pool = WorkerPool::new(factory);

        let err = pool.get_worker(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FleetError::ProvisionFailed(_)));
        assert_eq!(pool.stats().await, PoolStats { owned: 0, idle: 0 });
    }

    #[tokio::test]
    async fn returned_worker_is_reused() {
        let worker = FakeWorker::new("i-1");
        let factory = FakeFactory::with(vec![worker.clone()]);
        let pool = WorkerPool::new(factory.clone());
        let ctx = CancellationToken::new();

        let first = pool.get_worker(&ctx).await.unwrap();
        pool.return_worker(first).await;
        assert_eq!(pool.stats().await, PoolStats { owned: 1, idle: 1 });

        let second = pool.get_worker(&ctx).await.unwrap();
        assert!(second.equals(worker.as_ref() as &dyn Worker));
        // Only one provisioning call for two handouts.
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await, PoolStats { owned: 1, idle: 0 });
    }

    #[tokio::test]
    async fn closed_idle_worker_is_evicted_and_replaced() {
        let dead = FakeWorker::new("i-dead");
        let fresh = FakeWorker::new("i-fresh");
        let factory = FakeFactory::with(vec![dead.clone(), fresh.clone()]);
        let pool = WorkerPool::new(factory);
        let ctx = CancellationToken::new();

        let first = pool.get_worker(&ctx).await.unwrap();
        pool.return_worker(first).await;

        // The cached worker dies while idle.
        dead.close().await.unwrap();

        let second = pool.get_worker(&ctx).await.unwrap();
        assert_eq!(second.id(), "i-fresh");
        assert_eq!(pool.stats().await, PoolStats { owned: 1, idle: 0 });
    }

    #[tokio::test]
    async fn returning_unknown_worker_is_a_no_op() {
        let stranger = FakeWorker::new("i-stranger");
        let factory = FakeFactory::with(vec![]);
        let pool = WorkerPool::new(factory);

        pool.return_worker(stranger).await;
        assert_eq!(pool.stats().await, PoolStats { owned: 0, idle: 0 });
    }

    #[tokio::test]
    async fn double_return_keeps_idle_unique() {
        let worker = FakeWorker::new("i-1");
        let factory = FakeFactory::with(vec![worker.clone()]);
        let pool = WorkerPool::new(factory);
        let ctx = CancellationToken::new();

        let got = pool.get_worker(&ctx).await.unwrap();
        pool.return_worker(got.clone()).await;
        pool.return_worker(got).await;

        assert_eq!(pool.stats().await, PoolStats { owned: 1, idle: 1 });
    }

    #[tokio::test]
    async fn close_closes_every_worker_once() {
        let a = FakeWorker::new("i-a");
        let b = FakeWorker::new("i-b");
        let factory = FakeFactory::with(vec![a.clone(), b.clone()]);
        let pool = WorkerPool::new(factory);
        let ctx = CancellationToken::new();

        let first = pool.get_worker(&ctx).await.unwrap();
        let _second = pool.get_worker(&ctx).await.unwrap();
        pool.return_worker(first).await;

        pool.close().await.unwrap();
        assert_eq!(a.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_reports_last_error_but_visits_all() {
        let bad = FakeWorker::failing_close("i-bad");
        let good = FakeWorker::new("i-good");
        let factory = FakeFactory::with(vec![bad.clone(), good.clone()]);
        let pool = WorkerPool::new(factory);
        let ctx = CancellationToken::new();

        pool.get_worker(&ctx).await.unwrap();
        pool.get_worker(&ctx).await.unwrap();

        let err = pool.close().await.unwrap_err();
        assert!(matches!(err, FleetError::Compute(_)));
        assert_eq!(good.close_calls.load(Ordering::SeqCst), 1);
    }
}

