//! Error taxonomy for the master-side recovery subsystem (§7): plan-authority errors are mostly
//! invariant violations (programmer error, asserted in the source), recovery-operation errors are
//! the semantic/I-O codes that cross the RangeServer RPC boundary.

use thiserror::Error;

/// Errors raised by [`crate::balance_plan::BalancePlanAuthority`].
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no recovery plan registered for location {0:?}")]
    NoPlanForLocation(String),

    #[error("recovery plan for {location:?} has no plan for range class {class:?}")]
    NoPlanForClass { location: String, class: crate::range_spec::RangeClass },

    #[error("register_balance_plan called with stale generation {given} (current is {current})")]
    StaleGeneration { given: u64, current: u64 },

    #[error("commit log directory listing failed: {0}")]
    Filesystem(String),
}

/// Errors raised while driving a [`crate::recovery_operation::RecoveryOperation`] through one
/// step. Most correspond 1:1 to the RPC error codes in §7; a step that fails outright is reported
/// per-location rather than aborting the whole operation.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("quorum not reached: {connected} of {total} servers connected, need {required}")]
    QuorumNotReached { connected: usize, total: usize, required: usize },

    #[error("operation is blocked waiting for dependency {0:?}")]
    Blocked(String),
}
