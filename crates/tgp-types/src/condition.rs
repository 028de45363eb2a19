use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Standard tri-state condition status, following the same vocabulary
/// Kubernetes core types use for `status.conditions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single entry in `status.conditions`.
///
/// Conditions are the audit trail: `phase` is "where we are", conditions are
/// "what we observed and why", appended (never reordered or deduped away)
/// so an operator can read the history of a stuck object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition: String,
}

impl Condition {
    #[must_use]
    pub fn new(condition_type: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.into(),
            status: ConditionStatus::True,
            reason: reason.into(),
            message: message.into(),
            last_transition: Utc::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.last_transition = at.to_rfc3339();
        self
    }
}

/// Well-known condition types the reconciler writes.
pub mod reasons {
    pub const OFFER_NOT_FOUND: &str = "OfferNotFound";
    pub const PROVIDER_TRANSIENT: &str = "ProviderTransient";
    pub const PROVIDER_PERMANENT: &str = "ProviderPermanent";
    pub const ORPHAN_INSTANCE: &str = "OrphanInstance";
    pub const LIFETIME_EXPIRED: &str = "LifetimeExpired";
    pub const IDLE_TIMEOUT: &str = "IdleTimeout";
    pub const DELETION_REQUESTED: &str = "DeletionRequested";
}
