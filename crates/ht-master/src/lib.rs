//! Master-side recovery subsystem for range-server failover: the balance plan authority that
//! computes and persists per-location recovery plans (C9), and the recovery operation state
//! machine that drives a plan to completion against its participants (C10).

pub mod balance_plan;
pub mod config;
pub mod error;
pub mod range_spec;
pub mod recovery_operation;
pub mod recovery_plan;
pub mod rpc;

pub use balance_plan::{BalancePlanAuthority, ClassRanges};
pub use config::MasterConfig;
pub use error::{PlanError, RecoveryError};
pub use range_spec::{QualifiedRangeSpec, RangeClass, RangeState};
pub use recovery_operation::{RecoveryOperation, RecoveryParticipant, RecoveryState};
pub use recovery_plan::{RangeRecoveryPlan, ReceiverPlan, ReplayPlan};
