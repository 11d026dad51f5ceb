//! Control-plane library that multiplexes jobs over a bounded fleet of
//! ephemeral cloud workers.
//!
//! Hand a [`WorkQueue`](queue::WorkQueue) a [`WorkItem`](work::WorkItem)
//! and it borrows a [`Worker`](worker::Worker) from the
//! [`Pool`](pool::Pool) (provisioning one through the
//! [`WorkerFactory`](worker::WorkerFactory) if none is idle), waits for
//! the instance to become reachable, runs your function while it holds the
//! worker, then returns the worker for reuse and publishes the result.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//!
//! use fleetmux::pool::{Pool, WorkerPool};
//! use fleetmux::proto::WorkerStatusRequest;
//! use fleetmux::provisioner::{ComputeClient, InstanceSpec};
//! use fleetmux::queue::WorkQueue;
//! use fleetmux::work::WorkItem;
//! use fleetmux::worker::CloudWorkerFactory;
//!
//! async fn run(compute: Arc<dyn ComputeClient>) -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = CloudWorkerFactory::new(compute, InstanceSpec::default(), 443);
//!     let pool = Arc::new(WorkerPool::new(Arc::new(factory)));
//!     let queue = WorkQueue::new(pool.clone(), 2);
//!
//!     let (item, mut outcome) = WorkItem::new(
//!         CancellationToken::new(),
//!         (),
//!         |_ctx, _req, worker| async move {
//!             let res = worker.worker().await?.status(WorkerStatusRequest {}).await?;
//!             Ok(res.into_inner().msg)
//!         },
//!     );
//!
//!     queue.add(Box::new(item)).await;
//!     queue.wait().await;
//!
//!     if let Some(msg) = outcome.result.recv().await {
//!         println!("{msg}");
//!     }
//!
//!     pool.close().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod pool;
pub mod provisioner;
pub mod queue;
pub mod work;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("worker");
}
