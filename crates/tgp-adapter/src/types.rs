use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Static facts about an adapter, surfaced for diagnostics and config
/// validation; never used to branch reconciler behavior.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub supports_spot: bool,
}

/// Vendor-documented request budget; sized per adapter at construction.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub requests_per_second: u32,
    pub burst: u32,
}

/// Launch parameters, already translated to standard GPU/region vocabulary
/// by the caller; the adapter is responsible for the final vendor-specific
/// translation and plan selection.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub gpu_type: String,
    pub region: String,
    pub image_ref: String,
    /// Opaque bootstrap payload; forwarded to the provider verbatim, never
    /// parsed or validated by the adapter.
    pub user_data: JsonValue,
    pub labels: HashMap<String, String>,
    pub spot: bool,
    pub max_price: Option<Decimal>,
}

/// Standard instance lifecycle state; the ONLY place a vendor-specific
/// status string is translated into a shared vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum InstanceState {
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
    Unknown,
}

/// A provider's answer to "what is this instance doing right now".
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub message: Option<String>,
}

impl InstanceStatus {
    /// A 404 on a status lookup means the provider has already dropped the
    /// instance, not that the request failed; callers should observe this
    /// as terminated rather than propagate an error.
    #[must_use]
    pub fn vanished() -> Self {
        Self {
            state: InstanceState::Terminated,
            public_ip: None,
            private_ip: None,
            updated_at: Utc::now(),
            message: Some("instance not found at provider; treating as terminated".to_string()),
        }
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone)]
pub struct LaunchedInstance {
    pub instance_id: String,
    /// Decimal string, the price actually billed for this instance.
    pub hourly_price: String,
}
