//! Recovery operation (C10): the five-phase state machine that drives one `(failed_location,
//! range_class)` recovery from plan to full acknowledgement. Grounded on
//! `original_source/.../OperationRecoverRanges.cc`, expressed here as a plain Rust enum state
//! machine (as `CompactionState` is elsewhere, §4.5), advancing one phase per
//! [`RecoveryOperation::step`] call rather than the source's fallthrough `switch`, since the
//! caller (an external operation scheduler, out of scope per §1) is what decides when to re-poll
//! an operation.

use std::collections::HashSet;

use ht_vfs::traits::ReadableFilesystem;
use tracing::{info, warn};

use crate::balance_plan::BalancePlanAuthority;
use crate::error::RecoveryError;
use crate::range_spec::{QualifiedRangeSpec, RangeClass};
use crate::rpc::{ErrorCode, RecoveryStepFuture, RpcError};

/// Position in the five-phase recovery state machine (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Initial,
    PhantomLoad,
    ReplayFragments,
    Prepare,
    Commit,
    Acknowledge,
    /// Every range of this `(location, class)` was acknowledged by its receiver.
    Done,
}

/// The RangeServer RPC calls a recovery operation broadcasts to its participants. A real
/// deployment backs this with the (out-of-scope) wire RPC client; tests back it with an
/// in-memory fake.
pub trait RecoveryParticipant {
    fn phantom_load(&self, location: &str, ranges: &[QualifiedRangeSpec]) -> Result<(), RpcError>;

    fn replay_fragments(&self, location: &str, fragments: &[u32]) -> Result<(), RpcError>;

    fn phantom_prepare_ranges(&self, location: &str, ranges: &[QualifiedRangeSpec]) -> Result<(), RpcError>;

    fn phantom_commit_ranges(&self, location: &str, ranges: &[QualifiedRangeSpec]) -> Result<(), RpcError>;

    /// Per-range acknowledgement, since a batch call can partially succeed.
    fn acknowledge_load(
        &self,
        location: &str,
        ranges:   &[QualifiedRangeSpec],
    ) -> std::collections::HashMap<QualifiedRangeSpec, Result<(), RpcError>>;
}

/// One `(failed_location, range_class)` recovery in progress.
pub struct RecoveryOperation {
    location:        String,
    class:           RangeClass,
    state:           RecoveryState,
    plan_generation: u64,
    /// Ranges whose `acknowledge_load` reported `PHANTOM_RANGE_MAP_NOT_FOUND`: the receiver lost
    /// its phantom-range bookkeeping (e.g. it also crashed mid-recovery) and the whole operation
    /// must restart from `Initial` without being treated as a hard failure (§4.10 step 4).
    redo_set:        HashSet<QualifiedRangeSpec>,
}

impl RecoveryOperation {
    #[must_use]
    pub fn new(location: String, class: RangeClass) -> Self {
        Self { location, class, state: RecoveryState::Initial, plan_generation: 0, redo_set: HashSet::new() }
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn class(&self) -> RangeClass {
        self.class
    }

    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// The string tag other operations depend on to serialize class ordering (§4.10 "Order
    /// across classes"): `ROOT`, `METADATA`, `SYSTEM`, or `<location>-user`.
    #[must_use]
    pub fn dependency_tag(&self) -> String {
        match self.class {
            RangeClass::Root => "ROOT".to_string(),
            RangeClass::Metadata => "METADATA".to_string(),
            RangeClass::System => "SYSTEM".to_string(),
            RangeClass::User => format!("{}-user", self.location),
        }
    }

    /// The tag this operation must wait on before it may run, if any. Root has none; metadata
    /// waits on root; system waits on metadata; user waits on system.
    #[must_use]
    pub fn parent_dependency(&self) -> Option<&'static str> {
        match self.class {
            RangeClass::Root => None,
            RangeClass::Metadata => Some("ROOT"),
            RangeClass::System => Some("METADATA"),
            RangeClass::User => Some("SYSTEM"),
        }
    }

    fn quorum_met(connected: usize, total: usize, quorum_percentage: f64) -> Result<(), RecoveryError> {
        let required = (((total as f64) * quorum_percentage / 100.0).ceil() as usize).max(1);
        if connected < required {
            return Err(RecoveryError::QuorumNotReached { connected, total, required });
        }
        Ok(())
    }

    /// Advances the operation by (at most) one phase. Returns the resulting state; the caller
    /// re-invokes `step` to continue driving the operation, the same way an operation scheduler
    /// would re-poll. A quorum failure or an unsuccessful RPC broadcast leaves the state
    /// unchanged so the next call retries the same phase.
    pub fn step<FS, P>(
        &mut self,
        bpa:               &BalancePlanAuthority<FS>,
        participant:       &P,
        connected:         usize,
        total:             usize,
        quorum_percentage: f64,
    ) -> Result<RecoveryState, RecoveryError>
    where
        FS: ReadableFilesystem,
        P: RecoveryParticipant,
    {
        if self.state == RecoveryState::Done {
            return Ok(self.state);
        }

        Self::quorum_met(connected, total, quorum_percentage)?;

        let (plan, generation) = bpa.copy_recovery_plan(&self.location, self.class)?;
        if self.state != RecoveryState::Initial && generation != self.plan_generation {
            info!(location = %self.location, class = ?self.class, "recovery plan generation advanced; restarting");
            self.state = RecoveryState::Initial;
        }
        self.plan_generation = generation;

        match self.state {
            RecoveryState::Initial => {
                if plan.receiver_plan.is_empty() {
                    self.state = RecoveryState::Done;
                } else {
                    self.state = RecoveryState::PhantomLoad;
                }
            }

            RecoveryState::PhantomLoad => {
                let mut future = RecoveryStepFuture::new();
                for location in plan.receiver_plan.locations() {
                    let ranges = ranges_for(&plan, &location);
                    future.record(location.clone(), participant.phantom_load(&location, &ranges));
                }
                if future.all_ok() {
                    self.state = RecoveryState::ReplayFragments;
                } else {
                    log_failures(&future);
                }
            }

            RecoveryState::ReplayFragments => {
                let mut future = RecoveryStepFuture::new();
                for location in replay_locations(&plan) {
                    let fragments = plan.replay_plan.fragments_for(&location);
                    future.record(location.clone(), participant.replay_fragments(&location, &fragments));
                }
                if future.all_ok() {
                    self.state = RecoveryState::Prepare;
                } else {
                    log_failures(&future);
                }
            }

            RecoveryState::Prepare => {
                let mut future = RecoveryStepFuture::new();
                for location in plan.receiver_plan.locations() {
                    let ranges = ranges_for(&plan, &location);
                    future.record(location.clone(), participant.phantom_prepare_ranges(&location, &ranges));
                }
                if future.all_ok() {
                    self.state = RecoveryState::Commit;
                } else {
                    log_failures(&future);
                }
            }

            RecoveryState::Commit => {
                let mut future = RecoveryStepFuture::new();
                for location in plan.receiver_plan.locations() {
                    let ranges = ranges_for(&plan, &location);
                    future.record(location.clone(), participant.phantom_commit_ranges(&location, &ranges));
                }
                if future.all_ok() {
                    self.state = RecoveryState::Acknowledge;
                } else {
                    log_failures(&future);
                }
            }

            RecoveryState::Acknowledge => {
                self.redo_set.clear();
                for location in plan.receiver_plan.locations() {
                    let ranges = ranges_for(&plan, &location);
                    let mut acked = Vec::new();
                    for (spec, result) in participant.acknowledge_load(&location, &ranges) {
                        match result {
                            Ok(()) => acked.push(spec),
                            Err(err) if err.code == ErrorCode::PhantomRangeMapNotFound => {
                                self.redo_set.insert(spec);
                            }
                            Err(err) => {
                                warn!(location = %location, error = %err.message, "acknowledge_load failed, will retry");
                            }
                        }
                    }
                    if !acked.is_empty() {
                        bpa.remove_from_receiver_plan(&self.location, self.class, &acked)?;
                    }
                }

                if !self.redo_set.is_empty() {
                    self.redo_set.clear();
                    self.state = RecoveryState::Initial;
                } else if bpa.recovery_complete(&self.location, self.class) {
                    self.state = RecoveryState::Done;
                    info!(location = %self.location, class = ?self.class, "recovery complete");
                }
                // Otherwise some ranges are still unacknowledged; stay in `Acknowledge` for the
                // next `step` call to retry them.
            }

            RecoveryState::Done => unreachable!("handled above"),
        }

        Ok(self.state)
    }
}

fn ranges_for(plan: &crate::recovery_plan::RangeRecoveryPlan, location: &str) -> Vec<QualifiedRangeSpec> {
    plan.receiver_plan.specs_and_states_for(location).into_iter().map(|(spec, _)| spec).collect()
}

fn replay_locations(plan: &crate::recovery_plan::RangeRecoveryPlan) -> std::collections::BTreeSet<String> {
    plan.replay_plan.all_fragments().into_iter()
        .filter_map(|fragment| plan.replay_plan.location_of(fragment).map(str::to_string))
        .collect()
}

fn log_failures(future: &RecoveryStepFuture) {
    for (location, error) in future.failures() {
        warn!(location, error = %error.message, "recovery step broadcast failed, will retry");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use ht_vfs::ThreadLocalMemoryFS;

    use super::{RecoveryOperation, RecoveryParticipant, RecoveryState};
    use crate::balance_plan::{BalancePlanAuthority, ClassRanges};
    use crate::range_spec::{QualifiedRangeSpec, RangeClass, RangeState};
    use crate::rpc::RpcError;

    fn spec(table_id: u64, start: &[u8]) -> QualifiedRangeSpec {
        QualifiedRangeSpec { table_id, start_row: start.to_vec(), end_row: None }
    }

    /// A fully cooperative fake participant: every call succeeds and every range acknowledges.
    struct FakeParticipant {
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeParticipant {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()) }
        }
    }

    impl RecoveryParticipant for FakeParticipant {
        fn phantom_load(&self, _location: &str, _ranges: &[QualifiedRangeSpec]) -> Result<(), RpcError> {
            self.calls.lock().unwrap().push("phantom_load");
            Ok(())
        }

        fn replay_fragments(&self, _location: &str, _fragments: &[u32]) -> Result<(), RpcError> {
            self.calls.lock().unwrap().push("replay_fragments");
            Ok(())
        }

        fn phantom_prepare_ranges(&self, _location: &str, _ranges: &[QualifiedRangeSpec]) -> Result<(), RpcError> {
            self.calls.lock().unwrap().push("prepare");
            Ok(())
        }

        fn phantom_commit_ranges(&self, _location: &str, _ranges: &[QualifiedRangeSpec]) -> Result<(), RpcError> {
            self.calls.lock().unwrap().push("commit");
            Ok(())
        }

        fn acknowledge_load(
            &self,
            _location: &str,
            ranges:    &[QualifiedRangeSpec],
        ) -> HashMap<QualifiedRangeSpec, Result<(), RpcError>> {
            self.calls.lock().unwrap().push("acknowledge");
            ranges.iter().cloned().map(|spec| (spec, Ok(()))).collect()
        }
    }

    fn authority_with_user_plan(specs: Vec<QualifiedRangeSpec>) -> BalancePlanAuthority<ThreadLocalMemoryFS> {
        let bpa = BalancePlanAuthority::new(ThreadLocalMemoryFS::default(), PathBuf::from("/hypertable"));
        let mut ranges: ClassRanges = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        ranges[RangeClass::User.index()] =
            specs.into_iter().map(|spec| (spec, RangeState::STEADY)).collect();
        bpa.create_recovery_plan("failed-server", vec!["r1".into(), "r2".into()], ranges).unwrap();
        bpa
    }

    #[test]
    fn runs_every_phase_to_completion() {
        let bpa = authority_with_user_plan(vec![spec(1, b"a"), spec(1, b"m")]);
        let participant = FakeParticipant::new();
        let mut op = RecoveryOperation::new("failed-server".to_string(), RangeClass::User);

        let mut last = op.state();
        for _ in 0..8 {
            last = op.step(&bpa, &participant, 3, 3, 50.0).unwrap();
            if last == RecoveryState::Done {
                break;
            }
        }

        assert_eq!(last, RecoveryState::Done);
        assert!(bpa.recovery_complete("failed-server", RangeClass::User));
        let calls = participant.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["phantom_load", "replay_fragments", "prepare", "commit", "acknowledge"]);
    }

    #[test]
    fn empty_plan_completes_immediately() {
        let bpa = BalancePlanAuthority::new(ThreadLocalMemoryFS::default(), PathBuf::from("/hypertable"));
        let ranges: ClassRanges = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        bpa.create_recovery_plan("never-had-ranges", vec!["r1".into()], ranges).unwrap();

        let participant = FakeParticipant::new();
        let mut op = RecoveryOperation::new("never-had-ranges".to_string(), RangeClass::User);
        assert_eq!(op.step(&bpa, &participant, 1, 1, 50.0).unwrap(), RecoveryState::Done);
    }

    #[test]
    fn quorum_below_threshold_blocks_without_advancing() {
        let bpa = authority_with_user_plan(vec![spec(1, b"a")]);
        let participant = FakeParticipant::new();
        let mut op = RecoveryOperation::new("failed-server".to_string(), RangeClass::User);

        let err = op.step(&bpa, &participant, 1, 3, 75.0).unwrap_err();
        assert!(matches!(err, crate::error::RecoveryError::QuorumNotReached { .. }));
        assert_eq!(op.state(), RecoveryState::Initial);
    }

    #[test]
    fn dependency_tags_order_root_before_metadata_before_system_before_user() {
        let root = RecoveryOperation::new("x".into(), RangeClass::Root);
        let metadata = RecoveryOperation::new("x".into(), RangeClass::Metadata);
        let system = RecoveryOperation::new("x".into(), RangeClass::System);
        let user = RecoveryOperation::new("x".into(), RangeClass::User);

        assert_eq!(root.dependency_tag(), "ROOT");
        assert_eq!(metadata.parent_dependency(), Some("ROOT"));
        assert_eq!(system.parent_dependency(), Some("METADATA"));
        assert_eq!(user.parent_dependency(), Some("SYSTEM"));
        assert_eq!(user.dependency_tag(), "x-user");
    }
}
