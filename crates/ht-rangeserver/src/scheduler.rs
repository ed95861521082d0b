//! Maintenance scheduler (C7): collects per-access-group statistics and decides, in priority
//! order, which access groups need which compaction task run next.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};
use ht_vfs::traits::WritableFilesystem;
use tracing::debug;

use crate::access_group::{AccessGroup, CompactionState};

type Job = Box<dyn FnOnce() + Send>;

/// Runs maintenance jobs (compactions chosen by [`plan`]) off the thread that collected the
/// schedule: the scheduling thread decides, background workers do the potentially slow,
/// disk-bound work.
pub struct MaintenanceWorkerPool {
    sender:  Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for MaintenanceWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceWorkerPool").field("workers", &self.workers.len()).finish()
    }
}

impl MaintenanceWorkerPool {
    /// Spawns `worker_count` (at least 1) background threads pulling jobs off a shared queue.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..worker_count.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
            })
            .collect();
        Self { sender, workers }
    }

    /// Enqueues one job; returns immediately. Never blocks a scheduling pass on compaction I/O.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(job));
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// A snapshot of one access group's state, cheap enough to collect every scheduler pass.
#[derive(Debug, Clone)]
pub struct MaintenanceData {
    pub access_group:    String,
    pub mem_used:        u64,
    pub mem_allocated:   u64,
    pub disk_used:       u64,
    pub garbage_bytes:   u64,
    pub compression_ppm: u32,
    pub store_count:     usize,
    pub outstanding_scanners: usize,
    pub in_memory:       bool,
    pub compaction_state: CompactionState,
}

/// What the scheduler decided an access group should do this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    PurgeShadowCache,
    PurgeBlockIndex,
    Merge,
    Minor,
    Major,
    Gc,
    InMemoryRewrite,
    None,
}

/// Policy thresholds the scheduler applies. Mirrors the `Hypertable.RangeServer.Maintenance.*`
/// and `Hypertable.RangeServer.AccessGroup.*` config surface (see [`crate::config`]).
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    pub memory_limit:            u64,
    pub merge_run_length:        usize,
    pub merge_target_min:        u64,
    pub merge_target_max:        u64,
    pub minor_compaction_trigger: u64,
    pub garbage_threshold_ppm:   u32,
    pub shadow_cache_idle_stores: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            memory_limit: 256 * 1024 * 1024,
            merge_run_length: 3,
            merge_target_min: 16 * 1024 * 1024,
            merge_target_max: 256 * 1024 * 1024,
            minor_compaction_trigger: 32 * 1024 * 1024,
            garbage_threshold_ppm: 200_000,
            shadow_cache_idle_stores: 8,
        }
    }
}

/// Collects a [`MaintenanceData`] snapshot for every access group under a range.
pub fn collect<FS: WritableFilesystem>(groups: &[Arc<AccessGroup<FS>>]) -> Vec<MaintenanceData> {
    groups
        .iter()
        .map(|ag| {
            let tracker = ag.memory_tracker();
            MaintenanceData {
                access_group:         ag.name.clone(),
                mem_used:             tracker.cache_bytes_used(),
                mem_allocated:        tracker.cache_bytes_allocated(),
                disk_used:            ag.disk_usage(),
                garbage_bytes:        ag.garbage_bytes(),
                compression_ppm:      ag.compression_ratio_ppm(),
                store_count:          ag.store_count(),
                outstanding_scanners: ag.outstanding_scanners(),
                in_memory:            ag.in_memory(),
                compaction_state:     ag.compaction_state(),
            }
        })
        .collect()
}

/// Chooses one [`MaintenanceTask`] per access group, in the priority order a range server runs
/// them (§4.7): purge shadow caches, purge block indexes of idle cell stores, merge, minor,
/// major, GC, in-memory rewrite. (Split is excluded here — it fires on an external split signal
/// from the range, not on these memory/disk/garbage statistics, so it has no gate in `plan`.) An
/// access group already mid-compaction is left alone — never more than one outstanding task per
/// group.
#[must_use]
pub fn plan<FS: WritableFilesystem>(
    groups: &[Arc<AccessGroup<FS>>],
    data:   &[MaintenanceData],
    policy: &SchedulerPolicy,
) -> Vec<(String, MaintenanceTask)> {
    let total_mem: u64 = data.iter().map(|d| d.mem_allocated).sum();
    let over_memory_limit = total_mem > policy.memory_limit;

    groups
        .iter()
        .zip(data)
        .map(|(ag, d)| {
            if d.compaction_state != CompactionState::Idle {
                return (d.access_group.clone(), MaintenanceTask::None);
            }

            if over_memory_limit && d.outstanding_scanners == 0 {
                debug!(access_group = %d.access_group, "scheduling shadow-cache purge: memory over limit");
                return (d.access_group.clone(), MaintenanceTask::PurgeShadowCache);
            }

            if d.outstanding_scanners == 0 && d.store_count > policy.shadow_cache_idle_stores {
                debug!(access_group = %d.access_group, "scheduling block index purge: too many idle stores");
                return (d.access_group.clone(), MaintenanceTask::PurgeBlockIndex);
            }

            if !d.in_memory {
                if ag.find_merge_run(policy.merge_run_length, policy.merge_target_min, policy.merge_target_max).is_some() {
                    return (d.access_group.clone(), MaintenanceTask::Merge);
                }

                if d.mem_used > policy.minor_compaction_trigger {
                    if garbage_ppm(d) > policy.garbage_threshold_ppm {
                        debug!(
                            access_group = %d.access_group,
                            "upgrading minor to major: garbage ratio exceeds threshold",
                        );
                        return (d.access_group.clone(), MaintenanceTask::Major);
                    }
                    return (d.access_group.clone(), MaintenanceTask::Minor);
                }

                if garbage_ppm(d) > policy.garbage_threshold_ppm {
                    return (d.access_group.clone(), MaintenanceTask::Gc);
                }
            }

            // In-memory access groups have no cell stores to merge/compact/GC, so the only
            // maintenance they can need is the last-priority in-memory rewrite.
            if d.in_memory && d.mem_used > policy.minor_compaction_trigger {
                return (d.access_group.clone(), MaintenanceTask::InMemoryRewrite);
            }

            (d.access_group.clone(), MaintenanceTask::None)
        })
        .collect()
}

fn garbage_ppm(d: &MaintenanceData) -> u32 {
    if d.disk_used == 0 {
        return 0;
    }
    ((d.garbage_bytes.saturating_mul(1_000_000)) / d.disk_used).min(u64::from(u32::MAX)) as u32
}

/// Executes `task` against `ag`, returning whether a compaction was actually run (as opposed to
/// a no-op purge or an idle group). `policy` must be the same policy [`plan`] chose `task` under,
/// so that a `Merge` task re-finds the exact run `plan` saw rather than one picked against
/// different thresholds.
pub fn run_task<FS: WritableFilesystem>(
    ag:     &AccessGroup<FS>,
    task:   MaintenanceTask,
    policy: &SchedulerPolicy,
) -> Result<bool, crate::error::AccessGroupError> {
    match task {
        MaintenanceTask::None => Ok(false),
        MaintenanceTask::PurgeShadowCache => {
            ag.purge_shadow_caches();
            Ok(false)
        }
        MaintenanceTask::PurgeBlockIndex => {
            ag.purge_idle_block_indexes();
            Ok(false)
        }
        MaintenanceTask::Merge => {
            let run = ag.find_merge_run(policy.merge_run_length, policy.merge_target_min, policy.merge_target_max);
            if let Some(indices) = run {
                ag.merge_compact(&indices)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        MaintenanceTask::Minor => {
            ag.stage_compaction()?;
            ag.minor_compact()?;
            Ok(true)
        }
        MaintenanceTask::Major => {
            ag.stage_compaction()?;
            ag.major_compact()?;
            Ok(true)
        }
        MaintenanceTask::Gc => {
            ag.stage_compaction()?;
            ag.gc_compact()?;
            Ok(true)
        }
        MaintenanceTask::InMemoryRewrite => {
            ag.in_memory_rewrite()?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MaintenanceData, garbage_ppm};
    use crate::access_group::CompactionState;

    fn sample(disk_used: u64, garbage_bytes: u64) -> MaintenanceData {
        MaintenanceData {
            access_group: "default".to_string(),
            mem_used: 0,
            mem_allocated: 0,
            disk_used,
            garbage_bytes,
            compression_ppm: 1_000_000,
            store_count: 1,
            outstanding_scanners: 0,
            in_memory: false,
            compaction_state: CompactionState::Idle,
        }
    }

    #[test]
    fn garbage_ppm_of_empty_disk_usage_is_zero() {
        assert_eq!(garbage_ppm(&sample(0, 0)), 0);
    }

    #[test]
    fn garbage_ppm_computes_parts_per_million() {
        assert_eq!(garbage_ppm(&sample(1000, 500)), 500_000);
    }

    #[test]
    fn worker_pool_runs_submitted_jobs() {
        use super::MaintenanceWorkerPool;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let pool = MaintenanceWorkerPool::new(2);
        assert_eq!(pool.worker_count(), 2);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 8 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
