//! RPC channel to one provisioned worker.

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::error::{FleetError, Result};
use crate::proto::job_service_client::JobServiceClient;
use crate::proto::worker_service_client::WorkerServiceClient;

/// An open transport to one worker plus the two client stubs riding on it.
///
/// A worker owns at most one channel at a time; reopening replaces the old
/// channel, which is closed first. Dropping the value tears the transport
/// down.
pub struct WorkerChannel {
    worker: WorkerServiceClient<Channel>,
    job: JobServiceClient<Channel>,
}

impl WorkerChannel {
    /// Dial `http://addr:port`, blocking until the transport is reachable
    /// or `ctx` fires. Cancellation surfaces as the distinguishable
    /// `Canceled` so callers can treat it as "not yet ready" rather than
    /// fatal.
    pub async fn open(ctx: &CancellationToken, addr: IpAddr, port: u16) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}:{port}"))?;

        let channel = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(FleetError::Canceled),
            res = endpoint.connect() => res?,
        };

        Ok(Self {
            worker: WorkerServiceClient::new(channel.clone()),
            job: JobServiceClient::new(channel),
        })
    }

    /// Stub for the worker-status service. Cheap to clone; clones share the
    /// underlying transport.
    pub fn worker(&self) -> WorkerServiceClient<Channel> {
        self.worker.clone()
    }

    /// Stub for the job-control service.
    pub fn job(&self) -> JobServiceClient<Channel> {
        self.job.clone()
    }

    /// Tear the transport down. Closing an already-dropped channel is a
    /// non-event, so this is idempotent in effect.
    pub fn close(self) {}
}
