//! Reconciliation services for the CC mode agent

pub mod eviction;
pub mod label_sync;
pub mod reconcile;

// Re-export service implementations
pub use eviction::{CapturedComponents, ComponentCoordinator};
pub use label_sync::LabelSubscription;
pub use reconcile::{CycleOutcome, ModeReconciler};
