//! Down-call surface onto the external compute API.
//!
//! [`ComputeClient`] is the minimal slice of a cloud provider's API the
//! orchestrator needs: run, describe, status, terminate. Deployments supply
//! an implementation; everything above it is provider-agnostic.
//! [`Provisioner`] wraps a client together with fixed provisioning
//! parameters and normalizes the provider's list-shaped responses into
//! single-instance results.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};

/// Startup script handed to freshly provisioned instances.
const USER_DATA: &str = include_str!("userdata.sh");

/// Lifecycle state the compute API reports for an instance.
///
/// `Terminated` is terminal; an instance never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Terminating,
    Terminated,
}

/// One remote compute instance as the provider reports it.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Opaque provider-assigned identity.
    pub id: String,
    /// Public address, once the provider has assigned one.
    pub address: Option<IpAddr>,
    pub state: InstanceState,
}

/// Parameters for the run-instances call, fixed per factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    /// Startup script, already base64-encoded for the wire.
    pub user_data: Option<String>,
    /// Request spot-market capacity instead of on-demand.
    pub spot: bool,
}

impl InstanceSpec {
    /// Replace the startup script, encoding it for the wire.
    pub fn with_user_data(mut self, script: impl AsRef<[u8]>) -> Self {
        self.user_data = Some(BASE64.encode(script.as_ref()));
        self
    }
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self {
            image_id: "ami-0892d3c7ee96c0bf7".to_owned(),
            instance_type: "g4dn.xlarge".to_owned(),
            key_name: Some("us-west-ec2-keys".to_owned()),
            security_group_ids: vec!["sg-09b52430796d9b9c5".to_owned()],
            user_data: Some(BASE64.encode(USER_DATA)),
            spot: true,
        }
    }
}

/// Client for the external compute provisioning API.
///
/// The list-shaped return values mirror the provider wire format; callers
/// should not assume the lists are non-empty. Implementations map provider
/// failures to [`FleetError::Compute`].
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Launch instances per `spec`. A successful call may still return an
    /// empty list on some providers.
    async fn run_instances(&self, spec: &InstanceSpec) -> Result<Vec<Instance>>;

    /// Full description of an instance, including its public address.
    async fn describe_instances(&self, id: &str) -> Result<Vec<Instance>>;

    /// Cheap status probe. Providers return an empty list until the
    /// instance has booted far enough to have a status record.
    async fn describe_instance_status(&self, id: &str) -> Result<Vec<InstanceState>>;

    /// Request termination. Best-effort; the instance winds down
    /// asynchronously.
    async fn terminate_instances(&self, id: &str) -> Result<()>;
}

/// Provisioning front-end: a [`ComputeClient`] plus the fixed
/// [`InstanceSpec`] every new instance is launched with.
pub struct Provisioner {
    client: Arc<dyn ComputeClient>,
    spec: InstanceSpec,
}

impl Provisioner {
    pub fn new(client: Arc<dyn ComputeClient>, spec: InstanceSpec) -> Self {
        Self { client, spec }
    }

    /// Launch one instance and return it.
    pub async fn create(&self, ctx: &CancellationToken) -> Result<Instance> {
        let instances = cancellable(ctx, self.client.run_instances(&self.spec)).await?;

        let instance = instances
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::ProvisionFailed("no instances returned".to_owned()))?;

        tracing::debug!(instance_id = %instance.id, "instance provisioned");
        Ok(instance)
    }

    /// Resolve the instance's current public address and state.
    ///
    /// More expensive than [`status`](Self::status); only needed when we
    /// intend to connect.
    pub async fn describe(&self, ctx: &CancellationToken, id: &str) -> Result<(IpAddr, InstanceState)> {
        let instances = cancellable(ctx, self.client.describe_instances(id)).await?;

        let instance = instances
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::InstanceNotFound(id.to_owned()))?;

        let address = instance
            .address
            .ok_or_else(|| FleetError::InstanceNotFound(id.to_owned()))?;

        Ok((address, instance.state))
    }

    /// Last-known lifecycle state. An instance with no status record yet is
    /// `Pending`; that is a normal pre-boot condition, not an error.
    pub async fn status(&self, ctx: &CancellationToken, id: &str) -> Result<InstanceState> {
        let statuses = cancellable(ctx, self.client.describe_instance_status(id)).await?;
        Ok(statuses.into_iter().next().unwrap_or(InstanceState::Pending))
    }

    /// Best-effort termination.
    pub async fn terminate(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        cancellable(ctx, self.client.terminate_instances(id)).await
    }
}

/// Race a future against the caller's cancellation token.
pub(crate) async fn cancellable<T>(
    ctx: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(FleetError::Canceled),
        res = fut => res,
    }
}
