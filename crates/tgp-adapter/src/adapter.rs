use async_trait::async_trait;
use tgp_types::{GpuOffer, NormalizedPricing, OfferFilters};
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::types::{InstanceStatus, LaunchRequest, LaunchedInstance, ProviderInfo, RateLimits};

/// The uniform contract every vendor integration satisfies.
///
/// Vendor vocabulary (plan names, region codes, status strings) is
/// translated to the standard types at the adapter boundary; nothing
/// outside an adapter implementation ever sees it.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn info(&self) -> ProviderInfo;

    fn rate_limits(&self) -> RateLimits;

    /// Lists current offers matching `filters`. Empty result, not an error,
    /// when nothing matches.
    async fn list_available_gpus(
        &self,
        filters: &OfferFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<GpuOffer>, AdapterError>;

    async fn get_normalized_pricing(
        &self,
        gpu_type: &str,
        region: &str,
        cancel: &CancellationToken,
    ) -> Result<NormalizedPricing, AdapterError>;

    /// Selects a concrete vendor plan at or below `request.max_price` and
    /// launches it. Returns `NoCapacity` if nothing qualifies.
    async fn launch_instance(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<LaunchedInstance, AdapterError>;

    async fn get_instance_status(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceStatus, AdapterError>;

    /// Idempotent: terminating an instance the provider no longer knows
    /// about succeeds rather than erroring, mirroring delete-on-404
    /// semantics used elsewhere in this codebase.
    async fn terminate_instance(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError>;
}
