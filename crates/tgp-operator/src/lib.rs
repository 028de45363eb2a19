//! GPU fleet reconciler: watches `GPURequest` objects and drives provider
//! adapters, the pricing cache, the offer selector and the phase-transition
//! state machine to bring observed state to desired state.

pub mod adapters;
pub mod context;
pub mod error;
pub mod reconcile;

pub use adapters::{build_registry, AdapterRegistry};
pub use context::Context;
pub use error::{ReconcileError, Result};
pub use reconcile::{error_policy, reconcile};
