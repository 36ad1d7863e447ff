use crate::propagate::{OpOutcome, Operation};

/// Handles progress updates for the propagation step.
pub trait ProgressCallback: Send + Sync {
    /// Called just before an operation re-checks state and runs.
    fn operation_started(&self, operation: &Operation);

    fn operation_finished(&self, operation: &Operation, outcome: &OpOutcome);
}

/// A zero-sized struct with an empty implementation of ProgressCallback
pub struct EmptyProgressCallback;

impl ProgressCallback for EmptyProgressCallback {
    fn operation_started(&self, _: &Operation) {}

    fn operation_finished(&self, _: &Operation, _: &OpOutcome) {}
}
