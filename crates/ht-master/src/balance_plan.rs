//! Balance plan authority (C9): a replicated, meta-log-persisted entity that, for each failed
//! range-server location, stores four [`RangeRecoveryPlan`]s (one per range class) plus the set
//! of in-flight `MoveRange` destinations. The generation-bump rules and round-robin distribution
//! follow `original_source/.../BalancePlanAuthority.cc`; the plan itself is a single
//! mutex-protected piece of persistent state mutated through explicit methods rather than a
//! builder/edit-log cycle, since its internal structure is cheap to mutate in place.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use ht_vfs::traits::ReadableFilesystem;
use parking_lot::Mutex;
use tracing::info;

use crate::error::PlanError;
use crate::range_spec::{QualifiedRangeSpec, RangeClass, RangeState};
use crate::recovery_plan::RangeRecoveryPlan;

/// A round-robin cursor over the active server set, shared across every distribution decision
/// made within one [`BalancePlanAuthority::create_recovery_plan`] call — mirroring the source's
/// single `m_active_iter` member, which is *not* reset between the loop over pre-existing plans
/// and the construction of the new one.
struct RoundRobin<'a> {
    active: &'a [String],
    cursor: usize,
}

impl<'a> RoundRobin<'a> {
    fn new(active: &'a [String]) -> Self {
        Self { active, cursor: 0 }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Panics if `active` is empty; a recovery plan cannot be created with no surviving servers,
    /// and that case is rejected before a `RoundRobin` is ever constructed.
    fn next(&mut self) -> String {
        let location = self.active[self.cursor % self.active.len()].clone();
        self.cursor += 1;
        location
    }
}

type RecoveryPlans = [Option<RangeRecoveryPlan>; 4];

struct Inner {
    generation: u64,
    active:     Vec<String>,
    plans:      HashMap<String, RecoveryPlans>,
    /// In-flight `MoveRange` destinations, keyed by the range being moved.
    moves:      HashMap<QualifiedRangeSpec, String>,
}

/// Per-class (specs, states) input to [`BalancePlanAuthority::create_recovery_plan`].
pub type ClassRanges = [Vec<(QualifiedRangeSpec, RangeState)>; 4];

/// Master-side authority for range-server failover plans. Generic over the DFS client so it can
/// read the failed server's commit-log fragment ids directly (§4.9 step 3).
pub struct BalancePlanAuthority<FS> {
    fs:            FS,
    toplevel_dir:  PathBuf,
    inner:         Mutex<Inner>,
}

impl<FS: ReadableFilesystem> BalancePlanAuthority<FS> {
    #[must_use]
    pub fn new(fs: FS, toplevel_dir: PathBuf) -> Self {
        Self {
            fs,
            toplevel_dir,
            inner: Mutex::new(Inner {
                generation: 0,
                active:     Vec::new(),
                plans:      HashMap::new(),
                moves:      HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().plans.is_empty()
    }

    #[must_use]
    pub fn has_plan_moves(&self) -> bool {
        !self.inner.lock().moves.is_empty()
    }

    fn log_dir(&self, location: &str, class: RangeClass) -> PathBuf {
        self.toplevel_dir.join("servers").join(location).join("log").join(class.log_dir_name())
    }

    fn initial_fragment_ids(&self, location: &str, class: RangeClass) -> Result<Vec<u32>, PlanError> {
        let dir = self.log_dir(location, class);
        if !self.fs.exists(&dir).unwrap_or(false) {
            return Ok(Vec::new());
        }
        ht_commitlog::list_fragments(&self.fs, &dir)
            .map_err(|err| PlanError::Filesystem(err.to_string()))
    }

    /// Creates a new recovery plan for `location`'s four range classes, round-robin-distributing
    /// both fragments (replay) and ranges (receive) across `active_servers`. A no-op if a plan
    /// for `location` already exists (the source's "don't double-recover" guard).
    ///
    /// `active_servers` should be every currently-connected server excluding `location` itself.
    pub fn create_recovery_plan(
        &self,
        location:       &str,
        active_servers: Vec<String>,
        class_ranges:   ClassRanges,
    ) -> Result<(), PlanError> {
        let mut inner = self.inner.lock();
        if inner.plans.contains_key(location) {
            return Ok(());
        }

        info!(location, "creating recovery plan");
        inner.active = active_servers;
        if inner.active.is_empty() {
            return Ok(());
        }
        let active = inner.active.clone();
        let mut cursor = RoundRobin::new(&active);

        // Walk existing plans, reassigning anything still pointing at the newly-failed location.
        for plans in inner.plans.values_mut() {
            for (idx, class) in RangeClass::ALL.into_iter().enumerate() {
                if let Some(plan) = plans[idx].as_mut() {
                    Self::update_range_plan(plan, location, &class_ranges[class.index()], &mut cursor);
                    if plan.receiver_plan.is_empty() {
                        plans[idx] = None;
                    }
                }
            }
        }
        inner.plans.retain(|_, plans| plans.iter().any(Option::is_some));

        // Build the new plan for the failed location.
        let mut new_plans: RecoveryPlans = [None, None, None, None];
        for class in RangeClass::ALL {
            let (specs, states): (Vec<_>, Vec<_>) =
                class_ranges[class.index()].iter().cloned().unzip();
            if specs.is_empty() {
                continue;
            }
            let fragments = self.initial_fragment_ids(location, class)?;
            let mut plan = RangeRecoveryPlan::new(class);
            for (spec, state) in specs.into_iter().zip(states) {
                plan.receiver_plan.insert(cursor.next(), spec, state);
            }
            cursor.reset();
            for fragment in fragments {
                plan.replay_plan.insert(fragment, cursor.next());
            }
            info!(
                location, class = ?class,
                fragments = plan.replay_plan.all_fragments().len(),
                ranges = plan.receiver_plan.len(),
                "recovery plan populated",
            );
            new_plans[class.index()] = Some(plan);
        }

        // Any in-flight move whose destination was the failed server gets rehomed: prefer the
        // location the fresh recovery plan assigned that same range to; otherwise round-robin.
        for (spec, dest) in inner.moves.clone() {
            if dest != location {
                continue;
            }
            let rehomed = new_plans.iter().flatten()
                .find_map(|plan| plan.receiver_plan.location_of(&spec).map(str::to_string));
            let rehomed = rehomed.unwrap_or_else(|| cursor.next());
            inner.moves.insert(spec, rehomed);
        }

        inner.generation += 1;
        inner.plans.insert(location.to_string(), new_plans);
        Ok(())
    }

    /// `original_source`'s `update_range_plan`: reassign fragments the failed `location` was
    /// replaying, and either purge or reassign ranges it was receiving, to the active set.
    fn update_range_plan(
        plan:       &mut RangeRecoveryPlan,
        location:   &str,
        new_specs:  &[(QualifiedRangeSpec, RangeState)],
        cursor:     &mut RoundRobin<'_>,
    ) {
        for fragment in plan.replay_plan.remove_location(location) {
            plan.replay_plan.insert(fragment, cursor.next());
        }

        let purge: HashSet<&QualifiedRangeSpec> = new_specs.iter().map(|(spec, _)| spec).collect();
        cursor.reset();
        for (spec, state) in plan.receiver_plan.specs_and_states_for(location) {
            if purge.contains(&spec) {
                plan.receiver_plan.remove(&spec);
            } else {
                plan.receiver_plan.insert(cursor.next(), spec, state);
            }
        }
    }

    /// Copies the plan for `(location, class)` plus the generation it was read at. An absent
    /// plan (no ranges of that class were assigned) is reported as an empty plan, matching the
    /// source's `copy_recovery_plan` behavior for a null `plans[type]` entry.
    pub fn copy_recovery_plan(
        &self,
        location: &str,
        class:    RangeClass,
    ) -> Result<(RangeRecoveryPlan, u64), PlanError> {
        let inner = self.inner.lock();
        let plans = inner.plans.get(location)
            .ok_or_else(|| PlanError::NoPlanForLocation(location.to_string()))?;
        let plan = plans[class.index()].clone().unwrap_or_else(|| RangeRecoveryPlan::new(class));
        Ok((plan, inner.generation))
    }

    pub fn remove_recovery_plan(&self, location: &str) {
        self.inner.lock().plans.remove(location);
    }

    /// Removes `ranges` from `location`'s `class` receiver plan, as the master does once each
    /// range has been durably committed to its new owner. Bumps the generation (§4.9's third
    /// trigger: "entries are removed from a `receiver_plan` after a successful
    /// acknowledgement"), so a `RecoveryOperation` still mid-flight against the pre-removal
    /// plan observes a generation mismatch and resets to `Initial` rather than acting on stale
    /// receiver-plan membership.
    pub fn remove_from_receiver_plan(
        &self,
        location: &str,
        class:    RangeClass,
        ranges:   &[QualifiedRangeSpec],
    ) -> Result<(), PlanError> {
        let mut inner = self.inner.lock();
        let plans = inner.plans.get_mut(location)
            .ok_or_else(|| PlanError::NoPlanForLocation(location.to_string()))?;
        let plan = plans[class.index()].as_mut()
            .ok_or_else(|| PlanError::NoPlanForClass { location: location.to_string(), class })?;
        for spec in ranges {
            plan.receiver_plan.remove(spec);
        }
        inner.generation += 1;
        Ok(())
    }

    pub fn remove_from_replay_plan(
        &self,
        recovery_location: &str,
        class:             RangeClass,
        replay_location:   &str,
    ) -> Result<(), PlanError> {
        let mut inner = self.inner.lock();
        let plans = inner.plans.get_mut(recovery_location)
            .ok_or_else(|| PlanError::NoPlanForLocation(recovery_location.to_string()))?;
        let plan = plans[class.index()].as_mut()
            .ok_or_else(|| PlanError::NoPlanForClass { location: recovery_location.to_string(), class })?;
        let _ = plan.replay_plan.remove_location(replay_location);
        Ok(())
    }

    #[must_use]
    pub fn get_receiver_plan_locations(&self, location: &str, class: RangeClass) -> BTreeSet<String> {
        let inner = self.inner.lock();
        inner.plans.get(location)
            .and_then(|plans| plans[class.index()].as_ref())
            .map(|plan| plan.receiver_plan.locations())
            .unwrap_or_default()
    }

    /// True once every range of `class` for `location` has been acknowledged by its receiver
    /// (or no plan for that class was ever created).
    #[must_use]
    pub fn recovery_complete(&self, location: &str, class: RangeClass) -> bool {
        let inner = self.inner.lock();
        match inner.plans.get(location) {
            None => true,
            Some(plans) => plans[class.index()].as_ref().is_none_or(|plan| plan.receiver_plan.is_empty()),
        }
    }

    /// Returns the destination for a range being balance-moved, registering a fresh round-robin
    /// choice on first call. Two successive calls with no intervening
    /// [`Self::balance_move_complete`] return the same location (§8 testable property 7).
    pub fn get_balance_destination(
        &self,
        spec:           &QualifiedRangeSpec,
        next_available: impl FnOnce() -> Option<String>,
    ) -> Option<String> {
        let mut inner = self.inner.lock();
        if let Some(location) = inner.moves.get(spec) {
            return Some(location.clone());
        }
        let location = next_available()?;
        inner.moves.insert(spec.clone(), location.clone());
        Some(location)
    }

    pub fn balance_move_complete(&self, spec: &QualifiedRangeSpec) {
        self.inner.lock().moves.remove(spec);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ht_vfs::ThreadLocalMemoryFS;

    use super::{BalancePlanAuthority, ClassRanges};
    use crate::range_spec::{QualifiedRangeSpec, RangeClass, RangeState};

    fn spec(table_id: u64, start: &[u8]) -> QualifiedRangeSpec {
        QualifiedRangeSpec { table_id, start_row: start.to_vec(), end_row: None }
    }

    fn authority() -> BalancePlanAuthority<ThreadLocalMemoryFS> {
        BalancePlanAuthority::new(ThreadLocalMemoryFS::default(), PathBuf::from("/hypertable"))
    }

    fn empty_class_ranges() -> ClassRanges {
        [Vec::new(), Vec::new(), Vec::new(), Vec::new()]
    }

    #[test]
    fn create_recovery_plan_distributes_round_robin() {
        let bpa = authority();
        let mut ranges = empty_class_ranges();
        ranges[RangeClass::User.index()] = vec![
            (spec(1, b"a"), RangeState::STEADY),
            (spec(1, b"m"), RangeState::STEADY),
            (spec(1, b"z"), RangeState::STEADY),
        ];

        bpa.create_recovery_plan("server-a", vec!["server-b".into(), "server-c".into()], ranges)
            .unwrap();

        assert_eq!(bpa.generation(), 1);
        assert!(!bpa.is_empty());

        let (plan, generation) = bpa.copy_recovery_plan("server-a", RangeClass::User).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(plan.receiver_plan.len(), 3);
        let locations = plan.receiver_plan.locations();
        assert_eq!(locations, ["server-b".to_string(), "server-c".to_string()].into_iter().collect());
    }

    #[test]
    fn create_recovery_plan_is_idempotent_for_same_location() {
        let bpa = authority();
        let mut ranges = empty_class_ranges();
        ranges[RangeClass::User.index()] = vec![(spec(1, b"a"), RangeState::STEADY)];
        bpa.create_recovery_plan("server-a", vec!["server-b".into()], ranges.clone()).unwrap();
        assert_eq!(bpa.generation(), 1);

        bpa.create_recovery_plan("server-a", vec!["server-c".into()], ranges).unwrap();
        assert_eq!(bpa.generation(), 1, "a second failure report for the same location is a no-op");
    }

    #[test]
    fn recovery_complete_tracks_receiver_plan_drain() {
        let bpa = authority();
        let mut ranges = empty_class_ranges();
        let target = spec(1, b"a");
        ranges[RangeClass::User.index()] = vec![(target.clone(), RangeState::STEADY)];
        bpa.create_recovery_plan("server-a", vec!["server-b".into()], ranges).unwrap();

        assert!(!bpa.recovery_complete("server-a", RangeClass::User));
        let generation_before = bpa.generation();
        bpa.remove_from_receiver_plan("server-a", RangeClass::User, &[target]).unwrap();
        assert!(bpa.recovery_complete("server-a", RangeClass::User));
        assert_eq!(
            bpa.generation(), generation_before + 1,
            "an acknowledgement that drains a receiver plan must bump the generation so a \
             mid-flight recovery operation observes the change",
        );
    }

    #[test]
    fn recovery_complete_is_true_for_an_unknown_location() {
        let bpa = authority();
        assert!(bpa.recovery_complete("never-failed", RangeClass::Root));
    }

    #[test]
    fn get_balance_destination_is_stable_until_move_completes() {
        let bpa = authority();
        let target = spec(7, b"row");
        let mut calls = 0;
        let mut pick = || { calls += 1; Some(format!("server-{calls}")) };

        let first = bpa.get_balance_destination(&target, &mut pick).unwrap();
        let second = bpa.get_balance_destination(&target, &mut pick).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls, 1, "next_available must only be consulted once per outstanding move");

        bpa.balance_move_complete(&target);
        let third = bpa.get_balance_destination(&target, &mut pick).unwrap();
        assert_eq!(calls, 2);
        assert_ne!(third, first);
    }

    #[test]
    fn second_failure_reassigns_fragments_and_purges_colliding_ranges() {
        let bpa = authority();

        let mut ranges_a = empty_class_ranges();
        let shared = spec(1, b"shared");
        ranges_a[RangeClass::User.index()] =
            vec![(shared.clone(), RangeState::STEADY), (spec(1, b"only-a"), RangeState::STEADY)];
        bpa.create_recovery_plan("server-a", vec!["server-b".into(), "server-c".into()], ranges_a)
            .unwrap();

        // server-b, one of server-a's receivers, now fails too. Its recovery plan reassigns the
        // range it was receiving that collides with server-b's own pre-failure assignment
        // (`shared`, per the Open-Questions resolution: recovery wins).
        let mut ranges_b = empty_class_ranges();
        ranges_b[RangeClass::User.index()] = vec![(shared.clone(), RangeState::STEADY)];
        bpa.create_recovery_plan("server-b", vec!["server-c".into(), "server-d".into()], ranges_b)
            .unwrap();

        assert_eq!(bpa.generation(), 2);
        let (plan_a, _) = bpa.copy_recovery_plan("server-a", RangeClass::User).unwrap();
        assert!(
            plan_a.receiver_plan.location_of(&shared) != Some("server-b"),
            "server-a's plan must no longer hand `shared` to the now-dead server-b",
        );
    }
}
