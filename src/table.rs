//! The RIB head: one routing table of one address family.
//!
//! Routes live in a prefix trie behind a reader/writer lock. Readers take
//! the shared lock for the duration of a lookup only. Every change of a
//! route's forward is a compare-and-swap under the exclusive lock; the
//! reference the route held on its previous forward is dropped after the
//! lock is released.

use crate::config::{InstanceConfig, RibSettings};
use crate::error::{Error, Result};
use crate::expire::ExpireTimer;
use crate::nexthop::{AddressFamily, Nexthop, NexthopAttrs, NexthopStore};
use crate::nhgrp::{Forward, GroupStore};
use crate::stats::{RibCounters, RibStats};
use crate::trie::{RibPrefix, RouteTrie};
use foundations::telemetry::log;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// A routing instance. Its IPv4 and IPv6 heads share the instance-wide
/// switches.
#[derive(Debug)]
pub struct RibInstance {
    config: InstanceConfig,
    flow_hash_local: AtomicBool,
}

impl RibInstance {
    pub fn new(config: InstanceConfig, flow_hash_local: bool) -> Arc<RibInstance> {
        Arc::new(RibInstance {
            config,
            flow_hash_local: AtomicBool::new(flow_hash_local),
        })
    }

    pub fn fibnum(&self) -> u32 {
        self.config.fibnum
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether locally originated traffic gets a flow hash so it spreads
    /// over multipath groups.
    pub fn flow_hash_local(&self) -> bool {
        self.flow_hash_local.load(Ordering::Relaxed)
    }

    // Called on the first multipath install in any of the instance's tables.
    pub(crate) fn enable_flow_hash_local(&self) {
        self.flow_hash_local.store(true, Ordering::Relaxed);
        log::info!("local flow hashing enabled"; "fib" => self.config.fibnum);
    }
}

/// A route: prefix plus what it forwards to. Handed out to readers as a
/// snapshot; the forward stays valid for as long as the snapshot is held.
#[derive(Debug, Clone)]
pub struct Route<P: RibPrefix> {
    pub prefix: P,
    pub fwd: Forward,
}

impl<P: RibPrefix> Route<P> {
    pub fn select(&self, flow_hash: u64) -> &Arc<Nexthop> {
        self.fwd.select(flow_hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCmd {
    Add,
    Change,
    Delete,
}

/// Outcome of a committed change, for fan-out to route-change listeners.
#[derive(Debug, Clone)]
pub struct RcInfo {
    pub cmd: RouteCmd,
    pub old: Option<Forward>,
    pub new: Option<Forward>,
    /// This commit installed the first multi-member group of the table.
    pub first_multipath: bool,
}

pub(crate) struct RibState<P: RibPrefix> {
    pub(crate) trie: RouteTrie<P>,
    /// Earliest armed expiration deadline, 0 when the timer is idle.
    pub(crate) next_expire: u64,
    pub(crate) mpath_installed: bool,
}

pub struct RibHead<P: RibPrefix> {
    pub(crate) instance: Arc<RibInstance>,
    pub(crate) settings: RibSettings,
    pub(crate) epoch: Instant,
    pub(crate) state: RwLock<RibState<P>>,
    pub(crate) nhops: NexthopStore,
    pub(crate) groups: GroupStore,
    pub(crate) stats: Arc<RibStats>,
    pub(crate) timer: ExpireTimer,
}

impl<P: RibPrefix> RibHead<P> {
    /// Creates the table and starts its expiration timer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(instance: Arc<RibInstance>, settings: RibSettings) -> Arc<RibHead<P>> {
        let fibnum = instance.fibnum();
        let stats = Arc::new(RibStats::default());
        Arc::new_cyclic(|rib| RibHead {
            nhops: NexthopStore::new(
                fibnum,
                P::FAMILY,
                settings.max_nexthops,
                Arc::clone(&stats),
            ),
            groups: GroupStore::new(fibnum, &settings, Arc::clone(&stats)),
            timer: ExpireTimer::spawn(rib.clone()),
            instance,
            settings,
            epoch: Instant::now(),
            state: RwLock::new(RibState {
                trie: RouteTrie::new(),
                next_expire: 0,
                mpath_installed: false,
            }),
            stats,
        })
    }

    pub fn family(&self) -> AddressFamily {
        P::FAMILY
    }

    pub fn fibnum(&self) -> u32 {
        self.instance.fibnum()
    }

    pub fn instance(&self) -> &Arc<RibInstance> {
        &self.instance
    }

    pub fn settings(&self) -> &RibSettings {
        &self.settings
    }

    /// Table uptime in whole seconds; the clock nexthop expirations use.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    pub fn counters(&self) -> RibCounters {
        self.stats.snapshot()
    }

    pub fn nexthop_count(&self) -> usize {
        self.nhops.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Canonical nexthop for `attrs`, held for the caller.
    pub fn get_nexthop(&self, attrs: &NexthopAttrs) -> Result<Arc<Nexthop>> {
        self.nhops.get_nexthop(attrs)
    }

    pub fn release_nexthop(&self, nhop: &Arc<Nexthop>) {
        self.nhops.release(nhop);
    }

    pub fn hold_forward(&self, fwd: &Forward) {
        match fwd {
            Forward::Nhop(nh) => self.nhops.hold(nh),
            Forward::Group(g) => self.groups.hold(g),
        }
    }

    /// Drops one reference on `fwd`. Never call with the table lock held.
    pub fn release_forward(&self, fwd: &Forward) {
        match fwd {
            Forward::Nhop(nh) => self.nhops.release(nh),
            Forward::Group(g) => self.groups.release(g, &self.nhops),
        }
    }

    pub fn lookup_prefix(&self, prefix: &P) -> Result<Route<P>> {
        match self.state.read().trie.lookup(prefix) {
            Some(route) => Ok(route.clone()),
            None => Error::err_not_found(),
        }
    }

    /// Longest-prefix match, as done by the forwarding path.
    pub fn match_prefix(&self, prefix: &P) -> Option<Route<P>> {
        self.state.read().trie.matches(prefix).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.state.read().trie.len()
    }

    /// Visits every route under the shared lock. `f` must not call back
    /// into the table's write paths.
    pub fn walk(&self, f: impl FnMut(&Route<P>)) {
        self.state.read().trie.walk(f);
    }

    /// Binds an unbound prefix. On success the route takes over the
    /// caller's reference on `fwd`; on failure the caller keeps it.
    pub fn add_route(&self, prefix: P, fwd: &Forward) -> Result<RcInfo> {
        let mut state = self.state.write();
        if state.trie.lookup(&prefix).is_some() {
            return Err(Error::Exists);
        }
        state.trie.insert(Route {
            prefix,
            fwd: fwd.clone(),
        });
        let first_multipath = self.commit_bookkeeping(&mut state, fwd);
        drop(state);

        log::debug!("route added"; "fib" => self.fibnum(), "prefix" => %prefix, "fwd" => %fwd);
        Ok(RcInfo {
            cmd: RouteCmd::Add,
            old: None,
            new: Some(fwd.clone()),
            first_multipath,
        })
    }

    /// Compare-and-swap of the forward of the route at `prefix`.
    ///
    /// Fails with `Conflict`, leaving the table untouched, when the route is
    /// gone or no longer points at `expected`. On success the route takes
    /// over the caller's reference on `new` and the reference it held on
    /// `expected` is dropped.
    pub fn change_route_conditional(
        &self,
        prefix: &P,
        expected: &Forward,
        new: &Forward,
    ) -> Result<RcInfo> {
        let mut state = self.state.write();
        let old = match state.trie.lookup_mut(prefix) {
            Some(route) if route.fwd.ptr_eq(expected) => {
                std::mem::replace(&mut route.fwd, new.clone())
            }
            _ => return Error::err_conflict(),
        };
        let first_multipath = self.commit_bookkeeping(&mut state, new);
        drop(state);

        self.release_forward(&old);
        log::debug!("route changed"; "fib" => self.fibnum(), "prefix" => %prefix, "fwd" => %new);
        Ok(RcInfo {
            cmd: RouteCmd::Change,
            old: Some(old),
            new: Some(new.clone()),
            first_multipath,
        })
    }

    pub fn del_route(&self, prefix: &P) -> Result<RcInfo> {
        let removed = self.state.write().trie.remove(prefix);
        match removed {
            Some(route) => Ok(self.finish_delete(route)),
            None => Error::err_not_found(),
        }
    }

    /// Removes the route only while it still points at `expected`.
    pub fn del_route_conditional(&self, prefix: &P, expected: &Forward) -> Result<RcInfo> {
        let removed = self
            .state
            .write()
            .trie
            .remove_if(prefix, |route| route.fwd.ptr_eq(expected));
        match removed {
            Some(route) => Ok(self.finish_delete(route)),
            None => Error::err_conflict(),
        }
    }

    fn finish_delete(&self, route: Route<P>) -> RcInfo {
        self.release_forward(&route.fwd);
        log::debug!("route deleted"; "fib" => self.fibnum(), "prefix" => %route.prefix);
        RcInfo {
            cmd: RouteCmd::Delete,
            old: Some(route.fwd),
            new: None,
            first_multipath: false,
        }
    }

    // Runs under the exclusive lock right after `fwd` got bound.
    fn commit_bookkeeping(&self, state: &mut RibState<P>, fwd: &Forward) -> bool {
        match fwd {
            Forward::Nhop(nh) => self.note_temporal_insert(state, nh),
            Forward::Group(g) => {
                for m in g.members() {
                    self.note_temporal_insert(state, &m.nhop);
                }
            }
        }
        if fwd.is_multipath() && !state.mpath_installed {
            state.mpath_installed = true;
            return true;
        }
        false
    }
}

impl<P: RibPrefix> Drop for RibHead<P> {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}
