//! The `GPURequest` custom resource — the sole user-facing API (§6).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::condition::Condition;
use crate::phase::Phase;

/// Desired state: a declarative request for one GPU-equipped worker node.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "tgp.io",
    version = "v1",
    kind = "GPURequest",
    status = "GPURequestStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".status.selectedProvider"}"#,
    printcolumn = r#"{"name":"Price","type":"string","jsonPath":".status.hourlyPrice"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GPURequestSpec {
    /// Vendor hint; empty/`None` means "any enabled provider".
    #[serde(default)]
    pub provider: Option<String>,

    /// Standard GPU identifier, e.g. `RTX4090`, `H100`, `A100`.
    pub gpu_type: String,

    /// Standard region identifier; empty/`None` means "any region".
    #[serde(default)]
    pub region: Option<String>,

    /// Decimal string, e.g. `"0.80"`. `None` means unbounded.
    #[serde(default)]
    pub max_hourly_price: Option<String>,

    /// ISO-8601 duration string (e.g. `"1h"`, `"PT1H"`); forced termination
    /// fires at `provisioned_at + max_lifetime`. Falls back to
    /// `defaults.max_lifetime` from process configuration when empty.
    #[serde(default)]
    pub max_lifetime: Option<String>,

    /// ISO-8601 duration string; an idle node is terminated after this long
    /// without a heartbeat. Falls back to `defaults.idle_timeout`.
    #[serde(default)]
    pub idle_timeout: Option<String>,

    /// Prefer interruptible (spot) capacity.
    #[serde(default)]
    pub spot: bool,

    /// Opaque to the core: image identifier, networking tags/keys, secret
    /// references. Forwarded verbatim to the adapter as `user_data`; never
    /// parsed here.
    #[serde(default)]
    pub bootstrap_config: Option<JsonValue>,
}

/// Observed state, written only by the reconciler.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPURequestStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Decimal string captured at launch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_price: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_scheduled_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Consecutive `Pending` reconciles that found no eligible offer.
    /// Drives `BackoffPolicy` sizing; cleared once an offer is launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Mirrors `spec`'s generation at the time this status was computed, so
    /// a watcher can tell a stale status from a fresh one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GPURequestStatus {
    /// True iff the phase-dependent invariant from the data model holds:
    /// phases at or past `Provisioning` must carry a non-empty instance id
    /// and provider.
    #[must_use]
    pub fn satisfies_instance_invariant(&self) -> bool {
        if !self.phase.requires_instance() {
            return true;
        }
        self.instance_id.as_deref().is_some_and(|s| !s.is_empty())
            && self
                .selected_provider
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }

    pub fn push_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_pending_and_satisfies_invariant() {
        let status = GPURequestStatus::default();
        assert_eq!(status.phase, Phase::Pending);
        assert!(status.satisfies_instance_invariant());
    }

    #[test]
    fn provisioning_without_instance_id_violates_invariant() {
        let status = GPURequestStatus {
            phase: Phase::Provisioning,
            ..Default::default()
        };
        assert!(!status.satisfies_instance_invariant());
    }

    #[test]
    fn provisioning_with_instance_and_provider_satisfies_invariant() {
        let status = GPURequestStatus {
            phase: Phase::Provisioning,
            instance_id: Some("i-123".to_string()),
            selected_provider: Some("runpod".to_string()),
            ..Default::default()
        };
        assert!(status.satisfies_instance_invariant());
    }

    #[test]
    fn spec_round_trips_through_yaml() {
        let spec = GPURequestSpec {
            gpu_type: "H100".to_string(),
            max_hourly_price: Some("0.80".to_string()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: GPURequestSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.gpu_type, "H100");
        assert_eq!(back.max_hourly_price.as_deref(), Some("0.80"));
    }
}
