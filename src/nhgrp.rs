//! Multipath nexthop groups.
//!
//! A group is the canonical, weighted member set of a multipath route:
//! members are sorted by nexthop sequence number and never repeat, so two
//! routes with the same members share one group object. Groups hold one
//! reference on every member for as long as they are linked.

use crate::error::{Error, Result};
use crate::nexthop::{Nexthop, NexthopStore};
use crate::stats::{bump, RibStats};
use ahash::RandomState;
use foundations::telemetry::log;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// Upper bound on virtual replicas summed over a group's members. Heavier
// weight sets are scaled down to it, keeping their ratios.
const FLOW_REPLICA_BUDGET: u64 = 256;

// Seed mixing constants for the flow hasher.
const SEED_K1: u64 = 0x243f_6a88_85a3_08d3;
const SEED_K2: u64 = 0x1319_8a2e_0370_7344;
const SEED_K3: u64 = 0xa409_3822_299f_31d0;

#[derive(Debug, Clone)]
pub struct GroupMember {
    pub nhop: Arc<Nexthop>,
    pub weight: u32,
}

/// Fixed-size bucket array mapping flow hashes to members.
///
/// Every bucket is owned by the member with the highest seeded score for
/// that bucket (rendezvous hashing, one virtual replica per unit of weight).
/// Scores only depend on the seed, the bucket and the member's sequence
/// number, so adding or removing a member moves buckets only to or from
/// that member.
#[derive(Debug)]
pub struct FlowTable {
    buckets: Box<[u32]>,
    mask: usize,
}

impl FlowTable {
    fn build(members: &[GroupMember], size: usize, hasher: &RandomState) -> Result<FlowTable> {
        debug_assert!(size.is_power_of_two());
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(size)?;
        let replicas = replica_counts(members);
        for bucket in 0..size {
            let mut best = (0u64, 0u32);
            for (i, m) in members.iter().enumerate() {
                for replica in 0..replicas[i] {
                    let score = hasher.hash_one((bucket as u64, m.nhop.idx(), replica));
                    if score >= best.0 {
                        best = (score, i as u32);
                    }
                }
            }
            buckets.push(best.1);
        }
        Ok(FlowTable {
            buckets: buckets.into_boxed_slice(),
            mask: size - 1,
        })
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Number of buckets owned by member `member`.
    pub fn share_of(&self, member: usize) -> usize {
        self.buckets.iter().filter(|&&b| b as usize == member).count()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Member index owning the bucket of `flow_hash`.
    pub fn member_for(&self, flow_hash: u64) -> usize {
        self.buckets[flow_hash as usize & self.mask] as usize
    }
}

// Replicas per member: the weights themselves while they fit the budget,
// otherwise scaled down proportionally, never below one.
fn replica_counts(members: &[GroupMember]) -> Vec<u32> {
    let total: u64 = members.iter().map(|m| u64::from(m.weight.max(1))).sum();
    members
        .iter()
        .map(|m| {
            let w = u64::from(m.weight.max(1));
            if total <= FLOW_REPLICA_BUDGET {
                w as u32
            } else {
                (w * FLOW_REPLICA_BUDGET / total).max(1) as u32
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct NexthopGroup {
    idx: u64,
    fibnum: u32,
    members: Box<[GroupMember]>,
    flow: FlowTable,
    refcnt: AtomicU32,
}

impl NexthopGroup {
    pub fn idx(&self) -> u64 {
        self.idx
    }

    pub fn fibnum(&self) -> u32 {
        self.fibnum
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, nhop: &Nexthop) -> bool {
        self.members.iter().any(|m| std::ptr::eq(&*m.nhop, nhop))
    }

    pub fn flow_table(&self) -> &FlowTable {
        &self.flow
    }

    /// Picks the member that carries the flow with hash `flow_hash`.
    pub fn select(&self, flow_hash: u64) -> &Arc<Nexthop> {
        &self.members[self.flow.member_for(flow_hash)].nhop
    }

    pub fn refcount(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.refcount() != 0
    }

    pub(crate) fn hold(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn try_hold(&self) -> bool {
        self.refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c != 0).then(|| c + 1)
            })
            .is_ok()
    }

    fn put(&self) -> bool {
        match self
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => {
                log::error!("nexthop group refcount underflow"; "idx" => self.idx);
                false
            }
        }
    }

    fn key(&self) -> GroupKey {
        self.members
            .iter()
            .map(|m| (m.nhop.idx(), m.weight))
            .collect()
    }
}

impl fmt::Display for NexthopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nhg#{} {{", self.idx)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "nh#{}*{}", m.nhop.idx(), m.weight)?;
        }
        f.write_str("}")
    }
}

/// What a route forwards to: one nexthop or a multipath group.
/// Equality is object identity.
#[derive(Debug, Clone)]
pub enum Forward {
    Nhop(Arc<Nexthop>),
    Group(Arc<NexthopGroup>),
}

impl Forward {
    pub fn ptr_eq(&self, other: &Forward) -> bool {
        match (self, other) {
            (Forward::Nhop(a), Forward::Nhop(b)) => Arc::ptr_eq(a, b),
            (Forward::Group(a), Forward::Group(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_multipath(&self) -> bool {
        matches!(self, Forward::Group(g) if g.len() > 1)
    }

    pub fn as_nhop(&self) -> Option<&Arc<Nexthop>> {
        match self {
            Forward::Nhop(nh) => Some(nh),
            Forward::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Arc<NexthopGroup>> {
        match self {
            Forward::Nhop(_) => None,
            Forward::Group(g) => Some(g),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Forward::Nhop(_) => 1,
            Forward::Group(g) => g.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, nhop: &Nexthop) -> bool {
        match self {
            Forward::Nhop(nh) => std::ptr::eq(&**nh, nhop),
            Forward::Group(g) => g.contains(nhop),
        }
    }

    pub fn nexthops(&self) -> Vec<Arc<Nexthop>> {
        match self {
            Forward::Nhop(nh) => vec![Arc::clone(nh)],
            Forward::Group(g) => g.members.iter().map(|m| Arc::clone(&m.nhop)).collect(),
        }
    }

    pub fn select(&self, flow_hash: u64) -> &Arc<Nexthop> {
        match self {
            Forward::Nhop(nh) => nh,
            Forward::Group(g) => g.select(flow_hash),
        }
    }

    pub fn is_live(&self) -> bool {
        match self {
            Forward::Nhop(nh) => nh.is_live(),
            Forward::Group(g) => g.is_live(),
        }
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Forward::Nhop(nh) => nh.fmt(f),
            Forward::Group(g) => g.fmt(f),
        }
    }
}

type GroupKey = Vec<(u64, u32)>;

struct GroupMap {
    map: HashMap<GroupKey, Arc<NexthopGroup>, RandomState>,
    next_idx: u64,
}

pub struct GroupStore {
    fibnum: u32,
    max_groups: usize,
    max_members: usize,
    flow_buckets: usize,
    flow_hasher: RandomState,
    inner: Mutex<GroupMap>,
    stats: Arc<RibStats>,
}

impl GroupStore {
    pub fn new(
        fibnum: u32,
        settings: &crate::config::RibSettings,
        stats: Arc<RibStats>,
    ) -> GroupStore {
        let seed = settings.flow_hash_seed;
        GroupStore {
            fibnum,
            max_groups: settings.max_groups as usize,
            max_members: settings.max_group_members.max(2) as usize,
            flow_buckets: settings.flow_buckets(),
            flow_hasher: RandomState::with_seeds(
                seed,
                seed ^ SEED_K1,
                seed ^ SEED_K2,
                seed ^ SEED_K3,
            ),
            inner: Mutex::new(GroupMap {
                map: HashMap::with_hasher(RandomState::new()),
                next_idx: 1,
            }),
            stats,
        }
    }

    /// Canonical union of `existing` and `nhop`, returned with one reference
    /// taken for the caller. The caller keeps its own reference on `nhop`.
    ///
    /// A member that is already present keeps its weight. A union with a
    /// single member yields that nexthop rather than a one-member group.
    /// Fails with `Busy` when `existing` or one of its members was retired
    /// while the union was being built.
    pub fn compose(
        &self,
        existing: &Forward,
        nhop: &Arc<Nexthop>,
        weight: u32,
        nhops: &NexthopStore,
    ) -> Result<Forward> {
        if !existing.is_live() {
            return Error::err_busy();
        }
        let mut members = members_of(existing);
        if !members.iter().any(|m| Arc::ptr_eq(&m.nhop, nhop)) {
            members.try_reserve(1)?;
            members.push(GroupMember {
                nhop: Arc::clone(nhop),
                weight: weight.max(1),
            });
        }
        if members.len() == 1 {
            nhop.hold();
            return Ok(Forward::Nhop(Arc::clone(nhop)));
        }
        members.sort_by_key(|m| m.nhop.idx());
        let group = self.get_group(members, existing, nhops)?;
        Ok(Forward::Group(group))
    }

    /// Canonical set of `existing` without `nhop`, returned with one
    /// reference taken for the caller. `None` when nothing remains.
    pub fn filter(
        &self,
        existing: &Forward,
        nhop: &Nexthop,
        nhops: &NexthopStore,
    ) -> Result<Option<Forward>> {
        if !existing.contains(nhop) {
            return Error::err_not_found();
        }
        if !existing.is_live() {
            return Error::err_busy();
        }
        let members: Vec<GroupMember> = members_of(existing)
            .into_iter()
            .filter(|m| !std::ptr::eq(&*m.nhop, nhop))
            .collect();
        match members.len() {
            0 => Ok(None),
            1 => {
                let last = &members[0].nhop;
                if !last.try_hold() {
                    return Error::err_busy();
                }
                Ok(Some(Forward::Nhop(Arc::clone(last))))
            }
            _ => {
                let group = self.get_group(members, existing, nhops)?;
                Ok(Some(Forward::Group(group)))
            }
        }
    }

    // `members` must be canonical.
    fn get_group(
        &self,
        members: Vec<GroupMember>,
        existing: &Forward,
        nhops: &NexthopStore,
    ) -> Result<Arc<NexthopGroup>> {
        if members.len() > self.max_members {
            return Error::err_oom("too many group members");
        }
        let key: GroupKey = members.iter().map(|m| (m.nhop.idx(), m.weight)).collect();

        if let Some(group) = self.lookup_held(&key) {
            return Ok(group);
        }

        // Take the group's member references up front. A member whose count
        // already hit zero belongs to a forward that is being torn down.
        for (taken, m) in members.iter().enumerate() {
            if !m.nhop.try_hold() {
                self.release_members(&members[..taken], nhops);
                return Error::err_busy();
            }
        }
        if !existing.is_live() {
            self.release_members(&members, nhops);
            return Error::err_busy();
        }

        let flow = match FlowTable::build(&members, self.flow_buckets, &self.flow_hasher) {
            Ok(flow) => flow,
            Err(e) => {
                self.release_members(&members, nhops);
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        if let Some(group) = inner.map.get(&key).filter(|g| g.try_hold()).cloned() {
            drop(inner);
            self.release_members(&members, nhops);
            return Ok(group);
        }
        let replacing = inner.map.contains_key(&key);
        let room = replacing || inner.map.len() < self.max_groups;
        if !room || inner.map.try_reserve(1).is_err() {
            drop(inner);
            self.release_members(&members, nhops);
            return Error::err_oom("nexthop group table full");
        }
        let group = Arc::new(NexthopGroup {
            idx: inner.next_idx,
            fibnum: self.fibnum,
            members: members.into_boxed_slice(),
            flow,
            refcnt: AtomicU32::new(1),
        });
        inner.next_idx += 1;
        inner.map.insert(key, Arc::clone(&group));
        drop(inner);

        bump(&self.stats.groups_allocated);
        log::debug!("nexthop group created"; "fib" => self.fibnum, "group" => %group);
        Ok(group)
    }

    fn lookup_held(&self, key: &GroupKey) -> Option<Arc<NexthopGroup>> {
        let inner = self.inner.lock();
        inner.map.get(key).filter(|g| g.try_hold()).cloned()
    }

    fn release_members(&self, members: &[GroupMember], nhops: &NexthopStore) {
        for m in members {
            nhops.release(&m.nhop);
        }
    }

    pub fn hold(&self, group: &NexthopGroup) {
        group.hold();
    }

    /// Drops one reference; the last one unlinks the group and releases
    /// its members.
    pub fn release(&self, group: &Arc<NexthopGroup>, nhops: &NexthopStore) {
        if !group.put() {
            return;
        }
        let key = group.key();
        let mut inner = self.inner.lock();
        if inner.map.get(&key).is_some_and(|cur| Arc::ptr_eq(cur, group)) {
            inner.map.remove(&key);
        }
        drop(inner);

        self.release_members(&group.members, nhops);
        bump(&self.stats.groups_freed);
        log::debug!("nexthop group unlinked"; "fib" => self.fibnum, "group" => %group);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn members_of(fwd: &Forward) -> Vec<GroupMember> {
    match fwd {
        Forward::Nhop(nh) => vec![GroupMember {
            nhop: Arc::clone(nh),
            weight: 1,
        }],
        Forward::Group(g) => g.members.to_vec(),
    }
}
