use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// The worker has been closed; everything except a repeated close fails
    /// with this.
    #[error("worker closed")]
    Closed,

    /// The worker has no open channel yet; call `connect` first.
    #[error("worker not connected")]
    NotConnected,

    /// The compute API errored or returned no instances on provisioning.
    #[error("instance provisioning failed: {0}")]
    ProvisionFailed(String),

    /// The compute API no longer knows the instance. Transient during
    /// boot-up; readiness polling retries on it.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Channel open did not complete within the configured timeout.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// The caller's cancellation token fired.
    #[error("operation canceled")]
    Canceled,

    /// Failure reported by the external compute API.
    #[error("compute API error: {0}")]
    Compute(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
