use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("object has no name")]
    MissingObjectKey,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider adapter error: {0}")]
    Adapter(#[from] tgp_adapter::AdapterError),

    #[error("pricing cache error: {0}")]
    Cache(#[from] tgp_pricing::CacheError),

    #[error("no eligible offer: {0}")]
    NoEligibleOffer(#[from] tgp_selector::NoEligibleOffer),

    #[error("no enabled provider adapter named {0:?}")]
    UnknownProvider(String),

    #[error("invalid duration string {value:?}: {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
