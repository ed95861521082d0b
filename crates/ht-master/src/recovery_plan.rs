//! Per-(failed-location, range-class) recovery plan: which surviving server replays which commit
//! log fragment, and which surviving server receives which range (§4.9).

use std::collections::BTreeMap;

use crate::range_spec::{QualifiedRangeSpec, RangeClass, RangeState};

/// `fragments -> replay-player locations`, built by round-robin distribution over the active
/// server set at plan-creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayPlan {
    fragments: BTreeMap<u32, String>,
}

impl ReplayPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn insert(&mut self, fragment: u32, location: String) {
        self.fragments.insert(fragment, location);
    }

    #[must_use]
    pub fn location_of(&self, fragment: u32) -> Option<&str> {
        self.fragments.get(&fragment).map(String::as_str)
    }

    /// Every fragment currently assigned to `location`, ascending.
    #[must_use]
    pub fn fragments_for(&self, location: &str) -> Vec<u32> {
        self.fragments.iter()
            .filter(|(_, loc)| loc.as_str() == location)
            .map(|(fragment, _)| *fragment)
            .collect()
    }

    /// Removes every fragment assigned to `location` and returns them, ascending, so the caller
    /// can redistribute them (`BalancePlanAuthority::update_range_plan`).
    pub fn remove_location(&mut self, location: &str) -> Vec<u32> {
        let removed: Vec<u32> = self.fragments_for(location);
        for fragment in &removed {
            self.fragments.remove(fragment);
        }
        removed
    }

    #[must_use]
    pub fn all_fragments(&self) -> Vec<u32> {
        self.fragments.keys().copied().collect()
    }
}

/// `ranges -> receiver locations`, along with the range's pre-failure state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverPlan {
    ranges: BTreeMap<QualifiedRangeSpec, (String, RangeState)>,
}

impl ReceiverPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn insert(&mut self, location: String, spec: QualifiedRangeSpec, state: RangeState) {
        self.ranges.insert(spec, (location, state));
    }

    pub fn remove(&mut self, spec: &QualifiedRangeSpec) -> Option<(String, RangeState)> {
        self.ranges.remove(spec)
    }

    #[must_use]
    pub fn location_of(&self, spec: &QualifiedRangeSpec) -> Option<&str> {
        self.ranges.get(spec).map(|(location, _)| location.as_str())
    }

    #[must_use]
    pub fn locations(&self) -> std::collections::BTreeSet<String> {
        self.ranges.values().map(|(location, _)| location.clone()).collect()
    }

    /// Every range currently assigned to `location`, with its state snapshot, in key order.
    #[must_use]
    pub fn specs_and_states_for(&self, location: &str) -> Vec<(QualifiedRangeSpec, RangeState)> {
        self.ranges.iter()
            .filter(|(_, (loc, _))| loc.as_str() == location)
            .map(|(spec, (_, state))| (spec.clone(), *state))
            .collect()
    }

    #[must_use]
    pub fn specs(&self) -> Vec<QualifiedRangeSpec> {
        self.ranges.keys().cloned().collect()
    }
}

/// The recovery plan for one `(failed_location, range_class)` pair: which surviving server
/// replays which fragment, and which surviving server receives which range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeRecoveryPlan {
    pub class:         Option<RangeClass>,
    pub replay_plan:   ReplayPlan,
    pub receiver_plan: ReceiverPlan,
}

impl RangeRecoveryPlan {
    #[must_use]
    pub fn new(class: RangeClass) -> Self {
        Self { class: Some(class), replay_plan: ReplayPlan::default(), receiver_plan: ReceiverPlan::default() }
    }
}
