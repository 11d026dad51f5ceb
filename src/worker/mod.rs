//! Worker lifecycle: one provisioned instance plus its RPC channel.
//!
//! A [`Worker`] is created unready by a [`WorkerFactory`], cycles through
//! readiness checks and connections while the pool lends it out, and is
//! closed exactly once, which terminates the backing instance.
//!
//! # Readiness
//!
//! A worker is *ready* when its instance reports `running` and a fresh
//! channel open succeeds within the configured timeout. [`Worker::is_ready`]
//! is the one-shot probe; [`Worker::ready_stream`] polls it on a ticker and
//! delivers the terminal outcome over a single-shot channel.

pub mod channel;
pub mod cloud;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::error::Result;
use crate::proto::job_service_client::JobServiceClient;
use crate::proto::worker_service_client::WorkerServiceClient;

pub use channel::WorkerChannel;
pub use cloud::{CloudWorker, CloudWorkerFactory};

/// Tuning for a readiness probe or poll.
#[derive(Debug, Clone, Copy)]
pub struct ReadyOptions {
    /// How often [`Worker::ready_stream`] re-probes the instance.
    pub ticker_interval: Duration,
    /// Deadline on the connection attempt inside [`Worker::is_ready`].
    pub conn_timeout: Duration,
}

impl Default for ReadyOptions {
    fn default() -> Self {
        Self {
            ticker_interval: Duration::from_secs(15),
            conn_timeout: Duration::from_secs(10),
        }
    }
}

impl ReadyOptions {
    pub fn with_ticker_interval(mut self, interval: Duration) -> Self {
        self.ticker_interval = interval;
        self
    }

    pub fn with_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = timeout;
        self
    }
}

/// One remote worker.
///
/// Implementations serialize `connect`/`is_ready`/`close` internally;
/// callers may share a worker across tasks behind an `Arc`.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Instance id; the identity key for [`equals`](Worker::equals).
    fn id(&self) -> &str;

    /// Provisioner family tag. Workers from different families are never
    /// equal even if their ids collide.
    fn family(&self) -> &'static str;

    /// Resolve the instance's current address and open a fresh channel to
    /// it, replacing (and closing) any previous one. Fails with `Closed`
    /// after [`close`](Worker::close).
    async fn connect(&self, ctx: &CancellationToken) -> Result<()>;

    /// Client stub for the worker-status service. Fails with
    /// `NotConnected` before the first successful connect.
    async fn worker(&self) -> Result<WorkerServiceClient<Channel>>;

    /// Client stub for the job-control service. Fails with `NotConnected`
    /// before the first successful connect.
    async fn job(&self) -> Result<JobServiceClient<Channel>>;

    /// Probe readiness once: instance `running` and a connect within
    /// `opts.conn_timeout`. A timeout or cancellation during the connect is
    /// reported as not-yet-ready, not as an error. On success the freshly
    /// opened channel stays open.
    async fn is_ready(&self, ctx: &CancellationToken, opts: ReadyOptions) -> Result<bool>;

    /// Poll [`is_ready`](Worker::is_ready) every `opts.ticker_interval`
    /// until it settles. The receiver yields exactly one value: `Ok(())`
    /// once ready, `Canceled` if `ctx` fires first, or the first
    /// non-transient error. A transient `InstanceNotFound` keeps the poll
    /// alive.
    fn ready_stream(
        self: Arc<Self>,
        ctx: CancellationToken,
        opts: ReadyOptions,
    ) -> oneshot::Receiver<Result<()>>;

    /// Close the channel and terminate the backing instance. The first call
    /// wins; later calls fail with `Closed` and the instance is terminated
    /// exactly once.
    async fn close(&self) -> Result<()>;

    /// Id-based equality within one provisioner family.
    fn equals(&self, other: &dyn Worker) -> bool {
        self.family() == other.family() && self.id() == other.id()
    }
}

impl std::fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("family", &self.family())
            .finish()
    }
}

/// Produces fresh, not-yet-ready workers.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(&self, ctx: &CancellationToken) -> Result<Arc<dyn Worker>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_options_defaults() {
        let opts = ReadyOptions::default();
        assert_eq!(opts.ticker_interval, Duration::from_secs(15));
        assert_eq!(opts.conn_timeout, Duration::from_secs(10));
    }

    #[test]
    fn ready_options_overrides() {
        let opts = ReadyOptions::default()
            .with_ticker_interval(Duration::from_millis(20))
            .with_conn_timeout(Duration::from_millis(50));
        assert_eq!(opts.ticker_interval, Duration::from_millis(20));
        assert_eq!(opts.conn_timeout, Duration::from_millis(50));
    }
}
