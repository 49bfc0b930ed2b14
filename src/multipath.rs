//! Multipath changes: adding a nexthop to, or removing one from, the set a
//! route forwards to.
//!
//! A new group is composed outside the table lock and then committed with a
//! compare-and-swap against the forward the composition started from. When
//! an input got retired meanwhile (`Busy`) or the route moved on
//! (`Conflict`), the route is re-read and the whole step is retried, up to
//! a bounded number of attempts.

use crate::error::{Error, Result, Transient};
use crate::nexthop::{Nexthop, NexthopAttrs};
use crate::nhgrp::Forward;
use crate::stats::bump;
use crate::table::{RcInfo, RibHead};
use crate::trie::RibPrefix;
use foundations::telemetry::log;
use std::sync::Arc;

/// Retry policy of a single multipath change.
#[derive(Clone, Copy)]
pub struct MultipathPolicy<'a> {
    pub max_attempts: u32,
    /// Called before each retry with the failure that caused it and the
    /// number of the attempt that failed.
    pub on_retry: Option<&'a (dyn Fn(Transient, u32) + Sync)>,
}

impl<'a> MultipathPolicy<'a> {
    pub fn new(max_attempts: u32) -> MultipathPolicy<'a> {
        MultipathPolicy {
            max_attempts,
            on_retry: None,
        }
    }

    pub fn with_retry_hook(mut self, hook: &'a (dyn Fn(Transient, u32) + Sync)) -> Self {
        self.on_retry = Some(hook);
        self
    }
}

/// How a control-plane request combines with an existing route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Bind an unbound prefix; fails with `Exists` otherwise.
    Add,
    /// Bind the prefix to exactly this nexthop, whatever it had.
    Replace,
    /// Add the nexthop as one more multipath member.
    Append,
}

#[derive(Debug, Clone)]
pub struct RouteRequest<P: RibPrefix> {
    pub prefix: P,
    pub attrs: NexthopAttrs,
    pub weight: u32,
    pub intent: Intent,
}

impl<P: RibPrefix> RouteRequest<P> {
    pub fn new(prefix: P, attrs: NexthopAttrs, intent: Intent) -> RouteRequest<P> {
        RouteRequest {
            prefix,
            attrs,
            weight: 1,
            intent,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

impl<P: RibPrefix> RibHead<P> {
    /// Adds `nhop` as a member of the route at `prefix`, starting from the
    /// caller's last observation `expected` of the route's forward.
    ///
    /// The caller keeps its reference on `nhop`.
    pub fn add_route_multipath(
        &self,
        prefix: &P,
        nhop: &Arc<Nexthop>,
        weight: u32,
        expected: &Forward,
    ) -> Result<RcInfo> {
        let policy = MultipathPolicy::new(self.settings.max_attempts());
        self.add_route_multipath_with(prefix, nhop, weight, expected, &policy)
    }

    pub fn add_route_multipath_with(
        &self,
        prefix: &P,
        nhop: &Arc<Nexthop>,
        weight: u32,
        expected: &Forward,
        policy: &MultipathPolicy<'_>,
    ) -> Result<RcInfo> {
        self.run_multipath(prefix, expected, policy, |current| {
            self.groups
                .compose(current, nhop, weight, &self.nhops)
                .map(Some)
        })
    }

    /// Removes `nhop` from the members of the route at `prefix`. Removing
    /// the last member removes the route.
    pub fn del_route_multipath(
        &self,
        prefix: &P,
        nhop: &Nexthop,
        expected: &Forward,
    ) -> Result<RcInfo> {
        let policy = MultipathPolicy::new(self.settings.max_attempts());
        self.del_route_multipath_with(prefix, nhop, expected, &policy)
    }

    pub fn del_route_multipath_with(
        &self,
        prefix: &P,
        nhop: &Nexthop,
        expected: &Forward,
        policy: &MultipathPolicy<'_>,
    ) -> Result<RcInfo> {
        self.run_multipath(prefix, expected, policy, |current| {
            self.groups.filter(current, nhop, &self.nhops)
        })
    }

    // `build` returns the held forward the route should move to, or `None`
    // when the route should go away.
    fn run_multipath<F>(
        &self,
        prefix: &P,
        expected: &Forward,
        policy: &MultipathPolicy<'_>,
        build: F,
    ) -> Result<RcInfo>
    where
        F: Fn(&Forward) -> Result<Option<Forward>>,
    {
        let attempts = policy.max_attempts.max(1);
        let mut current = expected.clone();
        let mut last = Transient::Conflict;

        for attempt in 1..=attempts {
            let outcome = match build(&current) {
                Ok(Some(new)) => {
                    let res = self.change_route_conditional(prefix, &current, &new);
                    if res.is_err() {
                        self.release_forward(&new);
                    }
                    res
                }
                Ok(None) => self.del_route_conditional(prefix, &current),
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(rc) => {
                    if rc.first_multipath {
                        self.instance.enable_flow_hash_local();
                    }
                    return Ok(rc);
                }
                Err(err) => err,
            };
            let Some(t) = err.transient() else {
                bump(&self.stats.mpath_failures);
                return Err(err);
            };
            last = t;
            if attempt == attempts {
                // Deleted underneath us.
                if self.lookup_prefix(prefix).is_err() {
                    return Error::err_conflict();
                }
                break;
            }

            if let Some(hook) = policy.on_retry {
                hook(t, attempt);
            }
            current = match self.lookup_prefix(prefix) {
                Ok(route) => route.fwd,
                Err(_) => return Error::err_conflict(),
            };
            match t {
                Transient::Busy => bump(&self.stats.mpath_busy_retries),
                Transient::Conflict => bump(&self.stats.mpath_conflict_retries),
            }
        }

        bump(&self.stats.mpath_exhausted);
        log::warn!("multipath change gave up";
            "fib" => self.fibnum(), "prefix" => %prefix, "attempts" => attempts, "last" => %last);
        Err(Error::RetryExhausted { attempts, last })
    }

    /// Applies a control-plane route request.
    pub fn apply(&self, req: &RouteRequest<P>) -> Result<RcInfo> {
        let nhop = self.get_nexthop(&req.attrs)?;
        let fwd = Forward::Nhop(Arc::clone(&nhop));
        let res = match req.intent {
            Intent::Add => self.add_route(req.prefix, &fwd),
            Intent::Replace => self.replace_route(&req.prefix, &fwd),
            Intent::Append => self.append_route(&req.prefix, &nhop, req.weight),
        };
        // Whatever got bound holds its own reference now.
        let consumed = match (&res, req.intent) {
            (Ok(_), Intent::Add | Intent::Replace) => true,
            (Ok(rc), Intent::Append) => rc.old.is_none(),
            (Err(_), _) => false,
        };
        if !consumed {
            self.release_nexthop(&nhop);
        }
        res
    }

    /// Removes the whole route, or with `attrs` only that gateway from it.
    pub fn remove(&self, prefix: &P, attrs: Option<&NexthopAttrs>) -> Result<RcInfo> {
        let Some(attrs) = attrs else {
            return self.del_route(prefix);
        };
        let Some(nhop) = self.nhops.peek(attrs) else {
            return Error::err_not_found();
        };
        let current = self.lookup_prefix(prefix)?;
        self.del_route_multipath(prefix, &nhop, &current.fwd)
    }

    // Consumes the caller's reference on `fwd` on success.
    fn replace_route(&self, prefix: &P, fwd: &Forward) -> Result<RcInfo> {
        self.replace_route_observing(prefix, fwd, |p| {
            self.lookup_prefix(p).ok().map(|route| route.fwd)
        })
    }

    // `observe` reads the forward the compare-and-swap starts from, `None`
    // when the prefix is unbound.
    fn replace_route_observing<F>(&self, prefix: &P, fwd: &Forward, observe: F) -> Result<RcInfo>
    where
        F: Fn(&P) -> Option<Forward>,
    {
        let attempts = self.settings.max_attempts();
        for attempt in 1..=attempts {
            let res = match observe(prefix) {
                Some(current) => self.change_route_conditional(prefix, &current, fwd),
                None => match self.add_route(*prefix, fwd) {
                    Err(Error::Exists) => Error::err_conflict(),
                    res => res,
                },
            };
            match res {
                Err(Error::Conflict) if attempt < attempts => {
                    bump(&self.stats.replace_conflict_retries)
                }
                Err(Error::Conflict) => break,
                res => return res,
            }
        }
        bump(&self.stats.replace_exhausted);
        log::warn!("route replace gave up";
            "fib" => self.fibnum(), "prefix" => %prefix, "attempts" => attempts);
        Err(Error::RetryExhausted {
            attempts,
            last: Transient::Conflict,
        })
    }

    // A fresh route takes over the caller's reference; a multipath change
    // leaves it with the caller.
    fn append_route(&self, prefix: &P, nhop: &Arc<Nexthop>, weight: u32) -> Result<RcInfo> {
        let current = match self.lookup_prefix(prefix) {
            Ok(route) => route.fwd,
            Err(_) => match self.add_route(*prefix, &Forward::Nhop(Arc::clone(nhop))) {
                Err(Error::Exists) => self.lookup_prefix(prefix)?.fwd,
                res => return res,
            },
        };
        self.add_route_multipath(prefix, nhop, weight, &current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceConfig, RibSettings};
    use crate::table::{RibInstance, RouteCmd};
    use ipnet::Ipv6Net;
    use std::net::{IpAddr, Ipv6Addr};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rib(settings: RibSettings) -> Arc<RibHead<Ipv6Net>> {
        RibHead::new(RibInstance::new(InstanceConfig::new(1), false), settings)
    }

    fn pfx(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn gw(last: u16) -> NexthopAttrs {
        NexthopAttrs::new(3).with_gateway(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, last)))
    }

    #[tokio::test]
    async fn append_builds_group_and_flips_switch_once() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");

        let rc = rib.apply(&RouteRequest::new(p, gw(1), Intent::Append)).unwrap();
        assert_eq!(rc.cmd, RouteCmd::Add);
        assert!(!rib.instance().flow_hash_local());

        let rc = rib.apply(&RouteRequest::new(p, gw(2), Intent::Append)).unwrap();
        assert_eq!(rc.cmd, RouteCmd::Change);
        assert!(rc.first_multipath);
        assert!(rib.instance().flow_hash_local());

        let rc = rib.apply(&RouteRequest::new(p, gw(3), Intent::Append)).unwrap();
        assert!(!rc.first_multipath);

        let route = rib.lookup_prefix(&p).unwrap();
        assert_eq!(route.fwd.len(), 3);
        assert_eq!(rib.nexthop_count(), 3);
        assert_eq!(rib.group_count(), 1);
        // Each nexthop is referenced by the group only.
        for nh in route.fwd.nexthops() {
            assert_eq!(nh.refcount(), 1);
        }
    }

    #[tokio::test]
    async fn append_existing_member_is_noop() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Append)).unwrap();
        rib.apply(&RouteRequest::new(p, gw(2), Intent::Append)).unwrap();
        let before = rib.lookup_prefix(&p).unwrap().fwd;

        rib.apply(&RouteRequest::new(p, gw(1), Intent::Append)).unwrap();
        let after = rib.lookup_prefix(&p).unwrap().fwd;
        assert!(before.ptr_eq(&after));
        assert_eq!(after.as_group().unwrap().refcount(), 1);
    }

    #[tokio::test]
    async fn stale_expectation_is_retried() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Add)).unwrap();
        let stale = rib.lookup_prefix(&p).unwrap().fwd;
        rib.apply(&RouteRequest::new(p, gw(2), Intent::Replace)).unwrap();

        let c = rib.get_nexthop(&gw(3)).unwrap();
        rib.add_route_multipath(&p, &c, 1, &stale).unwrap();
        let route = rib.lookup_prefix(&p).unwrap();
        assert_eq!(route.fwd.len(), 2);
        assert!(!route.fwd.contains(stale.as_nhop().unwrap()));
        assert_eq!(rib.counters().mpath_conflict_retries + rib.counters().mpath_busy_retries, 1);
        rib.release_nexthop(&c);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_last_failure() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Add)).unwrap();
        let start = rib.lookup_prefix(&p).unwrap().fwd;
        let b = rib.get_nexthop(&gw(2)).unwrap();

        let hits = AtomicU32::new(0);
        let hook = |t: Transient, _attempt: u32| {
            assert_eq!(t, Transient::Busy);
            hits.fetch_add(1, Ordering::Relaxed);
        };
        let policy = MultipathPolicy::new(2).with_retry_hook(&hook);
        // Another writer replaces the route between every read and compose,
        // retiring the forward the composition starts from.
        let next_gw = AtomicU32::new(10);
        let err = rib
            .run_multipath(&p, &start, &policy, |cur| {
                let n = next_gw.fetch_add(1, Ordering::Relaxed) as u16;
                rib.apply(&RouteRequest::new(p, gw(n), Intent::Replace))
                    .unwrap();
                rib.groups.compose(cur, &b, 1, &rib.nhops).map(Some)
            })
            .unwrap_err();
        assert_eq!(
            err,
            Error::RetryExhausted {
                attempts: 2,
                last: Transient::Busy
            }
        );
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        let c = rib.counters();
        assert_eq!(c.mpath_exhausted, 1);
        assert_eq!(c.mpath_busy_retries, 1);
        assert_eq!(c.mpath_failures, 0);
        assert_eq!(rib.group_count(), 0);
        assert_eq!(b.refcount(), 1);
        rib.release_nexthop(&b);
    }

    #[tokio::test]
    async fn out_of_memory_is_not_retried() {
        let rib = rib(RibSettings {
            max_groups: 0,
            ..Default::default()
        });
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Add)).unwrap();
        let err = rib
            .apply(&RouteRequest::new(p, gw(2), Intent::Append))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        let c = rib.counters();
        assert_eq!(c.mpath_failures, 1);
        assert_eq!(c.mpath_busy_retries + c.mpath_conflict_retries, 0);
        // The request's nexthop was dropped again.
        assert_eq!(rib.nexthop_count(), 1);
        assert_eq!(rib.lookup_prefix(&p).unwrap().fwd.len(), 1);
    }

    #[tokio::test]
    async fn deleted_route_reports_conflict() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Add)).unwrap();
        let seen = rib.lookup_prefix(&p).unwrap().fwd;
        rib.del_route(&p).unwrap();

        let b = rib.get_nexthop(&gw(2)).unwrap();
        let err = rib.add_route_multipath(&p, &b, 1, &seen).unwrap_err();
        assert_eq!(err, Error::Conflict);
        assert_eq!(rib.route_count(), 0);
        // Nothing was retried.
        let c = rib.counters();
        assert_eq!(c.mpath_conflict_retries + c.mpath_busy_retries, 0);
        assert_eq!(c.mpath_exhausted, 0);
        rib.release_nexthop(&b);
        assert_eq!(rib.nexthop_count(), 0);
    }

    #[tokio::test]
    async fn deleted_route_reports_conflict_on_single_attempt() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Add)).unwrap();
        let seen = rib.lookup_prefix(&p).unwrap().fwd;
        rib.del_route(&p).unwrap();

        let b = rib.get_nexthop(&gw(2)).unwrap();
        let err = rib
            .add_route_multipath_with(&p, &b, 1, &seen, &MultipathPolicy::new(1))
            .unwrap_err();
        assert_eq!(err, Error::Conflict);
        let c = rib.counters();
        assert_eq!(c.mpath_conflict_retries, 0);
        assert_eq!(c.mpath_exhausted, 0);
        rib.release_nexthop(&b);
    }

    #[tokio::test]
    async fn replace_retries_are_counted_apart() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Add)).unwrap();
        let stale = rib.lookup_prefix(&p).unwrap().fwd;
        rib.apply(&RouteRequest::new(p, gw(2), Intent::Replace)).unwrap();

        // First read is stale, the retry reads the table.
        let reads = AtomicU32::new(0);
        let fwd = Forward::Nhop(rib.get_nexthop(&gw(3)).unwrap());
        let rc = rib
            .replace_route_observing(&p, &fwd, |p| {
                if reads.fetch_add(1, Ordering::Relaxed) == 0 {
                    Some(stale.clone())
                } else {
                    rib.lookup_prefix(p).ok().map(|r| r.fwd)
                }
            })
            .unwrap();
        assert_eq!(rc.cmd, RouteCmd::Change);
        assert!(rib.lookup_prefix(&p).unwrap().fwd.ptr_eq(&fwd));

        // Always stale: the budget runs out.
        let other = Forward::Nhop(rib.get_nexthop(&gw(4)).unwrap());
        let err = rib
            .replace_route_observing(&p, &other, |_| Some(stale.clone()))
            .unwrap_err();
        assert_eq!(
            err,
            Error::RetryExhausted {
                attempts: 3,
                last: Transient::Conflict
            }
        );
        rib.release_forward(&other);

        let c = rib.counters();
        assert_eq!(c.replace_conflict_retries, 1 + 2);
        assert_eq!(c.replace_exhausted, 1);
        assert_eq!(c.mpath_conflict_retries, 0);
        assert_eq!(c.mpath_exhausted, 0);
        assert_eq!(rib.nexthop_count(), 1);
    }

    #[tokio::test]
    async fn remove_gateway_then_route() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        for i in 1..=3 {
            rib.apply(&RouteRequest::new(p, gw(i), Intent::Append)).unwrap();
        }
        rib.remove(&p, Some(&gw(2))).unwrap();
        let route = rib.lookup_prefix(&p).unwrap();
        assert_eq!(route.fwd.len(), 2);

        rib.remove(&p, Some(&gw(1))).unwrap();
        let route = rib.lookup_prefix(&p).unwrap();
        assert!(route.fwd.as_nhop().is_some());

        assert_eq!(rib.remove(&p, Some(&gw(7))).unwrap_err(), Error::NotFound);

        let rc = rib.remove(&p, Some(&gw(3))).unwrap();
        assert_eq!(rc.cmd, RouteCmd::Delete);
        assert_eq!(rib.route_count(), 0);
        assert_eq!(rib.nexthop_count(), 0);
        assert_eq!(rib.group_count(), 0);
    }

    #[tokio::test]
    async fn replace_and_add_intents() {
        let rib = rib(RibSettings::default());
        let p = pfx("2001:db8::/32");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Replace)).unwrap();
        assert_eq!(
            rib.apply(&RouteRequest::new(p, gw(2), Intent::Add)).unwrap_err(),
            Error::Exists
        );
        let rc = rib.apply(&RouteRequest::new(p, gw(2), Intent::Replace)).unwrap();
        assert_eq!(rc.cmd, RouteCmd::Change);
        assert_eq!(rib.nexthop_count(), 1);
    }
}
