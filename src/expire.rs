//! Expiration of temporal routes.
//!
//! Each table runs one timer task armed for the earliest pending nexthop
//! expiration. Arming only ever moves the deadline earlier; the sweep that
//! runs when it fires removes what expired and arms the next deadline, or
//! leaves the timer idle when no temporal route is left.

use crate::nexthop::Nexthop;
use crate::nhgrp::Forward;
use crate::stats::bump;
use crate::table::{RibHead, RibState};
use crate::trie::RibPrefix;
use core::time::Duration;
use foundations::telemetry::log;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

// Deadline for expirations that do not fit the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub(crate) struct ExpireTimer {
    arm_tx: watch::Sender<Option<Instant>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExpireTimer {
    pub(crate) fn spawn<P: RibPrefix>(rib: Weak<RibHead<P>>) -> ExpireTimer {
        let (arm_tx, arm_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(timer_loop(rib, arm_rx, cancel.clone()));
        ExpireTimer {
            arm_tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Single-shot: replaces whatever deadline was armed. `None` idles.
    fn arm(&self, deadline: Option<Instant>) {
        self.arm_tx.send_replace(deadline);
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn keep_earliest(next: &mut u64, expire: u64) {
    if *next == 0 || expire < *next {
        *next = expire;
    }
}

async fn timer_loop<P: RibPrefix>(
    rib: Weak<RibHead<P>>,
    mut arm_rx: watch::Receiver<Option<Instant>>,
    cancel: CancellationToken,
) {
    loop {
        let deadline = *arm_rx.borrow_and_update();
        let expired = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = arm_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = expired => {
                let Some(rib) = rib.upgrade() else {
                    break;
                };
                rib.sweep();
            }
        }
    }
}

impl<P: RibPrefix> RibHead<P> {
    fn deadline_for(&self, expire: u64) -> Instant {
        self.epoch + Duration::from_secs(expire).min(FAR_FUTURE)
    }

    /// Earliest armed expiration in table seconds, 0 when the timer idles.
    pub fn next_expire(&self) -> u64 {
        self.state.read().next_expire
    }

    /// Arms the timer for `nhop`'s expiration unless an earlier one is
    /// already armed. Runs under the exclusive lock right after a route got
    /// bound to `nhop`.
    pub(crate) fn note_temporal_insert(&self, state: &mut RibState<P>, nhop: &Nexthop) {
        let expire = nhop.expire();
        if expire == 0 {
            return;
        }
        if state.next_expire == 0 || expire < state.next_expire {
            state.next_expire = expire;
            // A deadline in the past fires right away.
            self.timer.arm(Some(self.deadline_for(expire)));
            log::debug!("expiration timer armed"; "fib" => self.fibnum(), "expire" => expire);
        }
    }

    /// Removes every expired path and rearms the timer for the earliest
    /// remaining expiration. A route bound to an expired nexthop goes away;
    /// a multipath route loses its expired members, and goes away with the
    /// last one. Returns the number of paths removed.
    pub fn sweep(&self) -> usize {
        self.sweep_observing(|| ())
    }

    // `after_walk` runs between the walk and the exclusive section.
    pub(crate) fn sweep_observing(&self, after_walk: impl FnOnce()) -> usize {
        bump(&self.stats.sweeps);
        // The armed deadline is consumed; inserts racing with the walk below
        // arm afresh.
        self.state.write().next_expire = 0;

        let now = self.now();
        let mut expired: Vec<(P, Forward)> = Vec::new();
        let mut trimmed: Vec<(P, Forward, Vec<Arc<Nexthop>>)> = Vec::new();
        let mut next = 0u64;
        self.state.read().trie.walk(|route| match &route.fwd {
            Forward::Nhop(nh) => {
                if !nh.is_temporal() {
                    return;
                }
                if nh.expire() <= now {
                    expired.push((route.prefix, route.fwd.clone()));
                } else {
                    keep_earliest(&mut next, nh.expire());
                }
            }
            Forward::Group(g) => {
                let mut gone = Vec::new();
                for nh in g.members().iter().map(|m| &m.nhop) {
                    if !nh.is_temporal() {
                        continue;
                    }
                    if nh.expire() <= now {
                        gone.push(Arc::clone(nh));
                    } else {
                        keep_earliest(&mut next, nh.expire());
                    }
                }
                if !gone.is_empty() {
                    trimmed.push((route.prefix, route.fwd.clone(), gone));
                }
            }
        });
        after_walk();

        let mut removed = Vec::with_capacity(expired.len());
        {
            let mut state = self.state.write();
            for (prefix, fwd) in &expired {
                if let Some(route) = state.trie.remove_if(prefix, |r| r.fwd.ptr_eq(fwd)) {
                    removed.push(route);
                }
            }
            let armed = state.next_expire;
            if armed != 0 && (next == 0 || armed <= next) {
                // An insert during the walk already armed an earlier deadline.
            } else if next != 0 {
                state.next_expire = next;
                self.timer.arm(Some(self.deadline_for(next)));
            } else {
                self.timer.arm(None);
            }
        }

        for route in &removed {
            self.release_forward(&route.fwd);
            bump(&self.stats.routes_expired);
            log::debug!("route expired"; "fib" => self.fibnum(), "prefix" => %route.prefix);
        }

        let mut count = removed.len();
        for (prefix, fwd, gone) in &trimmed {
            let (dropped, deleted) = self.expire_members(prefix, fwd, gone);
            for _ in 0..dropped {
                bump(&self.stats.members_expired);
            }
            if deleted {
                bump(&self.stats.routes_expired);
            }
            count += dropped;
        }
        if count > 0 {
            log::info!("expired temporal paths"; "fib" => self.fibnum(), "count" => count, "next_expire" => next);
        }
        count
    }

    // Drops `gone` from the multipath route at `prefix`, starting from the
    // forward the walk saw. Returns the number of members dropped and
    // whether the route went away with its last one.
    fn expire_members(&self, prefix: &P, fwd: &Forward, gone: &[Arc<Nexthop>]) -> (usize, bool) {
        let mut current = fwd.clone();
        let mut dropped = 0;
        for nh in gone {
            if !current.contains(nh) {
                continue;
            }
            match self.del_route_multipath(prefix, nh, &current) {
                Ok(rc) => {
                    dropped += 1;
                    match rc.new {
                        Some(new) => current = new,
                        None => return (dropped, true),
                    }
                }
                Err(e) => {
                    log::debug!("expired member left to a later sweep";
                        "fib" => self.fibnum(), "prefix" => %prefix, "nhop" => %nh, "error" => %e);
                    break;
                }
            }
        }
        (dropped, false)
    }

    /// Tears the table down: stops the timer, waiting for a sweep in
    /// progress to finish, then removes every route and drops its
    /// reference.
    pub async fn destroy(&self) {
        self.timer.cancel();
        let task = self.timer.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("expiration timer task failed"; "fib" => self.fibnum(), "error" => %e);
            }
        }

        let routes = {
            let mut state = self.state.write();
            state.next_expire = 0;
            state.trie.drain()
        };
        for route in &routes {
            self.release_forward(&route.fwd);
        }
        log::debug!("table destroyed"; "fib" => self.fibnum(), "routes" => routes.len());
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{InstanceConfig, RibSettings};
    use crate::multipath::{Intent, RouteRequest};
    use crate::nexthop::{NexthopAttrs, NhopFlags};
    use crate::nhgrp::Forward;
    use crate::table::{RibHead, RibInstance};
    use core::time::Duration;
    use ipnet::Ipv4Net;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn rib() -> Arc<RibHead<Ipv4Net>> {
        RibHead::new(
            RibInstance::new(InstanceConfig::new(0), false),
            RibSettings::default(),
        )
    }

    fn pfx(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn temporal(rib: &RibHead<Ipv4Net>, last: u8, expire: u64) -> Forward {
        let attrs = NexthopAttrs::new(1)
            .with_gateway(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
            .with_expire(expire);
        Forward::Nhop(rib.get_nexthop(&attrs).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn note_insert_keeps_earliest() {
        let rib = rib();
        rib.add_route(pfx("10.0.1.0/24"), &temporal(&rib, 1, 30)).unwrap();
        assert_eq!(rib.next_expire(), 30);
        rib.add_route(pfx("10.0.2.0/24"), &temporal(&rib, 2, 60)).unwrap();
        assert_eq!(rib.next_expire(), 30);
        rib.add_route(pfx("10.0.3.0/24"), &temporal(&rib, 3, 10)).unwrap();
        assert_eq!(rib.next_expire(), 10);
        // Permanent routes leave the timer alone.
        let perm = Forward::Nhop(rib.get_nexthop(&NexthopAttrs::new(4)).unwrap());
        rib.add_route(pfx("10.0.4.0/24"), &perm).unwrap();
        assert_eq!(rib.next_expire(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_and_rearms() {
        let rib = rib();
        rib.add_route(pfx("10.0.1.0/24"), &temporal(&rib, 1, 5)).unwrap();
        rib.add_route(pfx("10.0.2.0/24"), &temporal(&rib, 2, 20)).unwrap();

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert!(rib.lookup_prefix(&pfx("10.0.1.0/24")).is_err());
        assert!(rib.lookup_prefix(&pfx("10.0.2.0/24")).is_ok());
        assert_eq!(rib.next_expire(), 20);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(rib.route_count(), 0);
        assert_eq!(rib.next_expire(), 0);
        assert_eq!(rib.nexthop_count(), 0);

        let c = rib.counters();
        assert_eq!(c.sweeps, 2);
        assert_eq!(c.routes_expired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_sweep_before_deadline_keeps_route() {
        let rib = rib();
        rib.add_route(pfx("10.0.1.0/24"), &temporal(&rib, 1, 5)).unwrap();
        assert_eq!(rib.sweep(), 0);
        assert_eq!(rib.route_count(), 1);
        assert_eq!(rib.next_expire(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_route_is_not_swept() {
        let rib = rib();
        let p = pfx("10.0.1.0/24");
        let t = temporal(&rib, 1, 5);
        rib.add_route(p, &t).unwrap();
        let perm = Forward::Nhop(rib.get_nexthop(&NexthopAttrs::new(9)).unwrap());
        rib.change_route_conditional(&p, &t, &perm).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let route = rib.lookup_prefix(&p).unwrap();
        assert!(route.fwd.ptr_eq(&perm));
        assert_eq!(rib.next_expire(), 0);
        assert_eq!(rib.counters().sweeps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_drains_and_releases() {
        let rib = rib();
        rib.add_route(pfx("10.0.1.0/24"), &temporal(&rib, 1, 5)).unwrap();
        let perm = Forward::Nhop(rib.get_nexthop(&NexthopAttrs::new(9)).unwrap());
        rib.add_route(pfx("10.0.2.0/24"), &perm).unwrap();

        rib.destroy().await;
        assert_eq!(rib.route_count(), 0);
        assert_eq!(rib.nexthop_count(), 0);
        assert_eq!(rib.next_expire(), 0);

        // The timer is gone: nothing fires past the old deadline.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rib.counters().sweeps, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_expire_arms_far_future() {
        let rib = rib();
        let p = pfx("10.0.1.0/24");
        rib.add_route(p, &temporal(&rib, 1, u64::MAX)).unwrap();
        assert_eq!(rib.next_expire(), u64::MAX);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(rib.lookup_prefix(&p).is_ok());
        assert_eq!(rib.counters().sweeps, 0);

        // An earlier expiration still takes over the timer.
        rib.add_route(pfx("10.0.2.0/24"), &temporal(&rib, 2, 3605))
            .unwrap();
        assert_eq!(rib.next_expire(), 3605);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rib.route_count(), 1);
        assert_eq!(rib.next_expire(), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_earlier_deadline_armed_during_walk() {
        let rib = rib();
        let slow = pfx("10.0.1.0/24");
        let racing = pfx("10.0.2.0/24");
        rib.add_route(slow, &temporal(&rib, 1, 5)).unwrap();

        let removed = rib.sweep_observing(|| {
            rib.add_route(racing, &temporal(&rib, 2, 2)).unwrap();
        });
        assert_eq!(removed, 0);
        assert_eq!(rib.next_expire(), 2);

        // The timer fires at the racing insert's deadline, not at 5.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(rib.lookup_prefix(&racing).is_err());
        assert!(rib.lookup_prefix(&slow).is_ok());
        assert_eq!(rib.next_expire(), 5);
        let c = rib.counters();
        assert_eq!(c.sweeps, 2);
        assert_eq!(c.routes_expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_overrides_later_deadline_armed_during_walk() {
        let rib = rib();
        let soon = pfx("10.0.1.0/24");
        let racing = pfx("10.0.2.0/24");
        rib.add_route(soon, &temporal(&rib, 1, 5)).unwrap();

        rib.sweep_observing(|| {
            rib.add_route(racing, &temporal(&rib, 2, 40)).unwrap();
        });
        assert_eq!(rib.next_expire(), 5);

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert!(rib.lookup_prefix(&soon).is_err());
        assert!(rib.lookup_prefix(&racing).is_ok());
        assert_eq!(rib.next_expire(), 40);
    }

    fn redirect(last: u8, expire: u64) -> NexthopAttrs {
        NexthopAttrs::new(1)
            .with_gateway(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
            .with_flags(NhopFlags::REDIRECT)
            .with_expire(expire)
    }

    fn gw(last: u8) -> NexthopAttrs {
        NexthopAttrs::new(1).with_gateway(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    #[tokio::test(start_paused = true)]
    async fn expired_member_leaves_multipath_route() {
        let rib = rib();
        let p = pfx("10.0.1.0/24");
        rib.apply(&RouteRequest::new(p, gw(1), Intent::Append)).unwrap();
        rib.apply(&RouteRequest::new(p, redirect(2, 2), Intent::Append))
            .unwrap();
        assert_eq!(rib.lookup_prefix(&p).unwrap().fwd.len(), 2);
        assert_eq!(rib.next_expire(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let fwd = rib.lookup_prefix(&p).unwrap().fwd;
        let nh = fwd.as_nhop().unwrap();
        assert!(!nh.is_temporal());
        assert_eq!(rib.next_expire(), 0);
        assert_eq!(rib.group_count(), 0);
        assert_eq!(rib.nexthop_count(), 1);

        let c = rib.counters();
        assert_eq!(c.sweeps, 1);
        assert_eq!(c.members_expired, 1);
        assert_eq!(c.routes_expired, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn multipath_route_goes_with_last_expired_member() {
        let rib = rib();
        let p = pfx("10.0.1.0/24");
        rib.apply(&RouteRequest::new(p, redirect(1, 3), Intent::Append))
            .unwrap();
        rib.apply(&RouteRequest::new(p, redirect(2, 3), Intent::Append))
            .unwrap();
        let q = pfx("10.0.2.0/24");
        rib.apply(&RouteRequest::new(q, gw(3), Intent::Add)).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rib.lookup_prefix(&p).is_err());
        assert!(rib.lookup_prefix(&q).is_ok());
        assert_eq!(rib.next_expire(), 0);
        assert_eq!(rib.group_count(), 0);
        assert_eq!(rib.nexthop_count(), 1);

        let c = rib.counters();
        assert_eq!(c.members_expired, 2);
        assert_eq!(c.routes_expired, 1);
    }
}
