//! Provider adapter contract and vendor clients for GPU fleet provisioning.
//!
//! Each vendor integration implements [`adapter::ProviderAdapter`] against
//! its own REST API, translating vendor GPU/region/status vocabulary to the
//! standard types in `tgp-types` at the boundary. A small shared base (rate
//! limiter, pricing normalizer) composes into each adapter rather than
//! living in an inheritance hierarchy.

pub mod adapter;
pub mod error;
pub mod lambdalabs;
pub mod rate_limit;
pub mod runpod;
pub mod types;
pub mod vastai;

pub use adapter::ProviderAdapter;
#[cfg(feature = "test-util")]
pub use adapter::MockProviderAdapter;
pub use error::AdapterError;
pub use rate_limit::RateLimiter;
pub use types::{InstanceState, InstanceStatus, LaunchRequest, LaunchedInstance, ProviderInfo, RateLimits};

pub use lambdalabs::LambdaLabs;
pub use runpod::RunPod;
pub use vastai::VastAi;
