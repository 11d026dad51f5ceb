//! Cloud-backed [`Worker`] and its factory.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::error::{FleetError, Result};
use crate::proto::job_service_client::JobServiceClient;
use crate::proto::worker_service_client::WorkerServiceClient;
use crate::provisioner::{ComputeClient, InstanceSpec, InstanceState, Provisioner};
use crate::worker::{ReadyOptions, Worker, WorkerChannel, WorkerFactory};

/// Mutable half of a worker. One lock serializes connect, readiness and
/// close against each other.
#[derive(Default)]
struct ChannelState {
    address: Option<IpAddr>,
    channel: Option<WorkerChannel>,
    closed: bool,
}

/// A worker running on a provisioned cloud instance.
pub struct CloudWorker {
    id: String,
    port: u16,
    provisioner: Arc<Provisioner>,
    state: Mutex<ChannelState>,
}

impl CloudWorker {
    fn new(id: String, port: u16, provisioner: Arc<Provisioner>) -> Self {
        Self {
            id,
            port,
            provisioner,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Last resolved public address, if the worker has ever connected.
    pub async fn address(&self) -> Option<IpAddr> {
        self.state.lock().await.address
    }

    /// Resolve the address and open a fresh channel. Caller holds the state
    /// lock and has already checked `closed`.
    async fn connect_locked(
        &self,
        ctx: &CancellationToken,
        state: &mut ChannelState,
    ) -> Result<()> {
        if let Some(old) = state.channel.take() {
            tracing::debug!(worker_id = %self.id, "replacing existing channel");
            old.close();
        }

        let (address, _) = self.provisioner.describe(ctx, &self.id).await?;
        state.address = Some(address);

        let channel = WorkerChannel::open(ctx, address, self.port).await?;
        state.channel = Some(channel);

        tracing::debug!(worker_id = %self.id, address = %address, port = self.port, "worker connected");
        Ok(())
    }
}

#[async_trait]
impl Worker for CloudWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> &'static str {
        "cloud"
    }

    async fn connect(&self, ctx: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FleetError::Closed);
        }
        self.connect_locked(ctx, &mut state).await
    }

    async fn worker(&self) -> Result<WorkerServiceClient<Channel>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(FleetError::Closed);
        }
        state
            .channel
            .as_ref()
            .map(WorkerChannel::worker)
            .ok_or(FleetError::NotConnected)
    }

    async fn job(&self) -> Result<JobServiceClient<Channel>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(FleetError::Closed);
        }
        state
            .channel
            .as_ref()
            .map(WorkerChannel::job)
            .ok_or(FleetError::NotConnected)
    }

    async fn is_ready(&self, ctx: &CancellationToken, opts: ReadyOptions) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FleetError::Closed);
        }

        let status = self.provisioner.status(ctx, &self.id).await?;
        if status != InstanceState::Running {
            return Ok(false);
        }

        // The instance is up; it is ready once it accepts a connection.
        match tokio::time::timeout(opts.conn_timeout, self.connect_locked(ctx, &mut state)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(FleetError::Canceled)) => Ok(false),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let err = FleetError::DialTimeout(opts.conn_timeout);
                tracing::debug!(worker_id = %self.id, error = %err, "worker not ready yet");
                Ok(false)
            }
        }
    }

    fn ready_stream(
        self: Arc<Self>,
        ctx: CancellationToken,
        opts: ReadyOptions,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(opts.ticker_interval);
            // The first tick resolves immediately; consume it so each probe
            // happens a full interval apart, starting one interval from now.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        let _ = tx.send(Err(FleetError::Canceled));
                        return;
                    }
                    _ = ticker.tick() => {
                        match self.is_ready(&ctx, opts).await {
                            Ok(true) => {
                                let _ = tx.send(Ok(()));
                                return;
                            }
                            Ok(false) => {}
                            Err(FleetError::InstanceNotFound(_)) => {
                                // The API can lag behind a fresh provision.
                                tracing::debug!(worker_id = %self.id, "instance not indexed yet, still polling");
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                return;
                            }
                        }
                    }
                }
            }
        });

        rx
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FleetError::Closed);
        }
        state.closed = true;

        if let Some(channel) = state.channel.take() {
            channel.close();
        }

        tracing::debug!(worker_id = %self.id, "terminating worker instance");
        self.provisioner
            .terminate(&CancellationToken::new(), &self.id)
            .await
    }
}

/// Creates [`CloudWorker`]s bound to one provisioner and a fixed RPC port.
pub struct CloudWorkerFactory {
    provisioner: Arc<Provisioner>,
    port: u16,
}

impl CloudWorkerFactory {
    pub fn new(client: Arc<dyn ComputeClient>, spec: InstanceSpec, port: u16) -> Self {
        Self {
            provisioner: Arc::new(Provisioner::new(client, spec)),
            port,
        }
    }
}

#[async_trait]
impl WorkerFactory for CloudWorkerFactory {
    /// Provision a fresh instance and wrap it. Does not wait for readiness;
    /// that is the caller's concern.
    async fn create(&self, ctx: &CancellationToken) -> Result<Arc<dyn Worker>> {
        let instance = self.provisioner.create(ctx).await?;
        Ok(Arc::new(CloudWorker::new(
            instance.id,
            self.port,
            self.provisioner.clone(),
        )))
    }
}
