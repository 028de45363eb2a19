use std::sync::Arc;

use kube::Client;
use tgp_config::OperatorConfig;
use tgp_pricing::PricingCache;

use crate::adapters::AdapterRegistry;

/// Shared state handed to every reconcile call, mirroring the teacher's own
/// `Context { client, namespace, config }` shape, extended with the
/// provider registry and pricing cache this domain needs.
pub struct Context {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    pub adapters: AdapterRegistry,
    pub pricing: Arc<PricingCache>,
}

pub(crate) const GPU_REQUEST_FINALIZER: &str = "gpurequests.tgp.io/finalizer";
