use std::sync::atomic::{AtomicU64, Ordering};

/// Per-table event counters. All updates are relaxed; the counters are
/// observational and order nothing.
#[derive(Debug, Default)]
pub struct RibStats {
    pub(crate) nhops_allocated: AtomicU64,
    pub(crate) nhops_freed: AtomicU64,
    pub(crate) groups_allocated: AtomicU64,
    pub(crate) groups_freed: AtomicU64,
    pub(crate) mpath_busy_retries: AtomicU64,
    pub(crate) mpath_conflict_retries: AtomicU64,
    pub(crate) mpath_exhausted: AtomicU64,
    pub(crate) mpath_failures: AtomicU64,
    pub(crate) replace_conflict_retries: AtomicU64,
    pub(crate) replace_exhausted: AtomicU64,
    pub(crate) sweeps: AtomicU64,
    pub(crate) routes_expired: AtomicU64,
    pub(crate) members_expired: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RibCounters {
    pub nhops_allocated: u64,
    pub nhops_freed: u64,
    pub groups_allocated: u64,
    pub groups_freed: u64,
    /// Expected retries caused by a retired composition input.
    pub mpath_busy_retries: u64,
    /// Expected retries caused by a lost compare-and-swap.
    pub mpath_conflict_retries: u64,
    /// Multipath changes that ran out of attempts.
    pub mpath_exhausted: u64,
    /// Multipath changes that failed for a non-transient reason.
    pub mpath_failures: u64,
    /// Retries of an unconditional replace that lost a compare-and-swap.
    pub replace_conflict_retries: u64,
    pub replace_exhausted: u64,
    pub sweeps: u64,
    pub routes_expired: u64,
    /// Expired members dropped from multipath routes.
    pub members_expired: u64,
}

impl RibCounters {
    pub fn nhops_live(&self) -> u64 {
        self.nhops_allocated - self.nhops_freed
    }

    pub fn groups_live(&self) -> u64 {
        self.groups_allocated - self.groups_freed
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RibStats {
    pub fn snapshot(&self) -> RibCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RibCounters {
            nhops_allocated: get(&self.nhops_allocated),
            nhops_freed: get(&self.nhops_freed),
            groups_allocated: get(&self.groups_allocated),
            groups_freed: get(&self.groups_freed),
            mpath_busy_retries: get(&self.mpath_busy_retries),
            mpath_conflict_retries: get(&self.mpath_conflict_retries),
            mpath_exhausted: get(&self.mpath_exhausted),
            mpath_failures: get(&self.mpath_failures),
            replace_conflict_retries: get(&self.replace_conflict_retries),
            replace_exhausted: get(&self.replace_exhausted),
            sweeps: get(&self.sweeps),
            routes_expired: get(&self.routes_expired),
            members_expired: get(&self.members_expired),
        }
    }
}
