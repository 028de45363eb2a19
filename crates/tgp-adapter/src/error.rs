use thiserror::Error;

/// Errors raised by a [`crate::adapter::ProviderAdapter`] implementation.
///
/// Classification happens once, here, at the adapter boundary: the
/// reconciler matches on these variants and never re-inspects an HTTP
/// status code or vendor error string.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Network failure, timeout, or malformed transport-level response.
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// 5xx or other server-side failure that is worth retrying.
    #[error("provider transient error: {status} - {message}")]
    Transient { status: u16, message: String },

    /// 4xx (other than 429) or invalid credentials; retrying will not help.
    #[error("provider permanent error: {status} - {message}")]
    Permanent { status: u16, message: String },

    /// 429 or an explicit rate-limit signal from the vendor.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// No offer satisfied the launch request's constraints.
    #[error("no capacity for {gpu_type} in {region}")]
    NoCapacity { gpu_type: String, region: String },

    /// Instance id unknown to the provider (already gone, or never existed).
    #[error("instance not found: {0}")]
    NotFound(String),

    /// A server got stuck in a non-terminal, non-progressing state long
    /// enough that continuing to poll it is pointless.
    #[error("instance {id} stuck in '{status}' for {duration_secs}s")]
    Stuck {
        id: String,
        status: String,
        duration_secs: u64,
    },

    #[error("invalid adapter configuration: {0}")]
    Config(String),

    #[error("failed to decode provider response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl AdapterError {
    /// Whether the reconciler should retry with backoff rather than fail
    /// the object outright.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Transient { .. } | Self::RateLimited { .. } | Self::Cancelled
        )
    }
}
