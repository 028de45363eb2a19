use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Provisioning phase of a [`crate::GPURequest`].
///
/// `Selecting` from the design narrative is folded into the `Pending` ->
/// `Provisioning` transition: offer selection and launch happen inside a
/// single reconcile step, so it is never an observable, persisted phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    /// Newly created, or a previous reconcile found no eligible offer.
    #[default]
    Pending,
    /// Offer selected, instance launched, waiting for it to come up.
    Provisioning,
    /// Instance is running but has not reported an address yet.
    Booting,
    /// Instance has an address; waiting for the node to join the cluster.
    Joining,
    /// Node has joined and is serving workloads.
    Ready,
    /// Cleanup in progress (deletion, lifetime expiry, or idleness).
    Terminating,
    /// Cleanup confirmed; the object is about to be removed.
    Terminated,
    /// Unrecoverable error; requires operator intervention.
    Failed,
}

impl Phase {
    /// Phases in which `status.instance_id` and `status.selected_provider`
    /// are required to be non-empty (the core invariant from the data model).
    #[must_use]
    pub fn requires_instance(self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Booting | Self::Joining | Self::Ready | Self::Terminating
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Booting => write!(f, "Booting"),
            Self::Joining => write!(f, "Joining"),
            Self::Ready => write!(f, "Ready"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Terminated => write!(f, "Terminated"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_instance_matches_invariant_phases() {
        assert!(!Phase::Pending.requires_instance());
        assert!(Phase::Provisioning.requires_instance());
        assert!(Phase::Booting.requires_instance());
        assert!(Phase::Joining.requires_instance());
        assert!(Phase::Ready.requires_instance());
        assert!(Phase::Terminating.requires_instance());
        assert!(!Phase::Terminated.requires_instance());
        assert!(!Phase::Failed.requires_instance());
    }

    #[test]
    fn terminal_phases() {
        assert!(Phase::Terminated.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Ready.is_terminal());
    }
}
