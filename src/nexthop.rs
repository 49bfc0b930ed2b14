//! Nexthop objects and the per-table store that deduplicates them.
//!
//! A nexthop is published once and never mutated afterwards; only its
//! reference count moves. Every route bound to it and every group containing
//! it holds one reference. At zero the nexthop is unlinked from the store, so
//! a later request for the same attributes allocates a fresh object with a
//! new sequence number. Memory is reclaimed when the last `Arc` drops, which
//! keeps snapshots taken by readers valid.

use crate::error::{Error, Result};
use crate::stats::{bump, RibStats};
use ahash::RandomState;
use bitflags::bitflags;
use foundations::telemetry::log;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => f.write_str("inet"),
            AddressFamily::Inet6 => f.write_str("inet6"),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NhopFlags: u32 {
        const GATEWAY = 1 << 0;
        const REJECT = 1 << 1;
        const BLACKHOLE = 1 << 2;
        /// Installed by redirect processing.
        const REDIRECT = 1 << 3;
        const DEFAULT = 1 << 4;
        const BROADCAST = 1 << 5;
        const STATIC = 1 << 6;
    }
}

/// The attribute tuple that identifies a nexthop within one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NexthopAttrs {
    pub ifindex: u32,
    pub gateway: Option<IpAddr>,
    pub flags: NhopFlags,
    /// Table-uptime second after which routes bound to this nexthop are
    /// removed. 0 means permanent.
    pub expire: u64,
}

impl NexthopAttrs {
    pub fn new(ifindex: u32) -> NexthopAttrs {
        NexthopAttrs {
            ifindex,
            gateway: None,
            flags: NhopFlags::empty(),
            expire: 0,
        }
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> NexthopAttrs {
        self.gateway = Some(gateway);
        self.flags |= NhopFlags::GATEWAY;
        self
    }

    pub fn with_flags(mut self, flags: NhopFlags) -> NexthopAttrs {
        self.flags |= flags;
        self
    }

    pub fn with_expire(mut self, expire: u64) -> NexthopAttrs {
        self.expire = expire;
        self
    }
}

#[derive(Debug)]
pub struct Nexthop {
    idx: u64,
    attrs: NexthopAttrs,
    fibnum: u32,
    family: AddressFamily,
    refcnt: AtomicU32,
}

impl Nexthop {
    /// Allocation sequence number, unique per store for the table lifetime.
    /// Groups order their members by it.
    pub fn idx(&self) -> u64 {
        self.idx
    }

    pub fn attrs(&self) -> &NexthopAttrs {
        &self.attrs
    }

    pub fn ifindex(&self) -> u32 {
        self.attrs.ifindex
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.attrs.gateway
    }

    pub fn flags(&self) -> NhopFlags {
        self.attrs.flags
    }

    pub fn expire(&self) -> u64 {
        self.attrs.expire
    }

    pub fn is_temporal(&self) -> bool {
        self.attrs.expire != 0
    }

    pub fn fibnum(&self) -> u32 {
        self.fibnum
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn refcount(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// False once the last reference was released.
    pub fn is_live(&self) -> bool {
        self.refcount() != 0
    }

    // Caller must already own a reference.
    pub(crate) fn hold(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a reference unless the count already dropped to zero.
    pub(crate) fn try_hold(&self) -> bool {
        self.refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c != 0).then(|| c + 1)
            })
            .is_ok()
    }

    // Returns true when this call dropped the last reference.
    fn put(&self) -> bool {
        match self
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => {
                log::error!("nexthop refcount underflow"; "idx" => self.idx);
                false
            }
        }
    }
}

impl fmt::Display for Nexthop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attrs.gateway {
            Some(gw) => write!(f, "nh#{} via {} if{}", self.idx, gw, self.attrs.ifindex),
            None => write!(f, "nh#{} dev if{}", self.idx, self.attrs.ifindex),
        }
    }
}

struct NhopMap {
    map: HashMap<NexthopAttrs, Arc<Nexthop>, RandomState>,
    next_idx: u64,
}

pub struct NexthopStore {
    fibnum: u32,
    family: AddressFamily,
    max_nexthops: usize,
    inner: Mutex<NhopMap>,
    stats: Arc<RibStats>,
}

impl NexthopStore {
    pub fn new(
        fibnum: u32,
        family: AddressFamily,
        max_nexthops: u32,
        stats: Arc<RibStats>,
    ) -> NexthopStore {
        NexthopStore {
            fibnum,
            family,
            max_nexthops: max_nexthops as usize,
            inner: Mutex::new(NhopMap {
                map: HashMap::with_hasher(RandomState::new()),
                next_idx: 1,
            }),
            stats,
        }
    }

    /// Returns the canonical nexthop for `attrs` with one reference taken
    /// for the caller, allocating it if no live one exists.
    pub fn get_nexthop(&self, attrs: &NexthopAttrs) -> Result<Arc<Nexthop>> {
        let mut inner = self.inner.lock();
        if let Some(nh) = inner.map.get(attrs) {
            if nh.try_hold() {
                return Ok(Arc::clone(nh));
            }
            // Lost the race with the final release; the entry is doomed and
            // gets replaced below.
        }

        let replacing = inner.map.contains_key(attrs);
        if !replacing && inner.map.len() >= self.max_nexthops {
            return Error::err_oom("nexthop table full");
        }
        inner.map.try_reserve(1)?;

        let nh = Arc::new(Nexthop {
            idx: inner.next_idx,
            attrs: *attrs,
            fibnum: self.fibnum,
            family: self.family,
            refcnt: AtomicU32::new(1),
        });
        inner.next_idx += 1;
        inner.map.insert(*attrs, Arc::clone(&nh));
        drop(inner);

        bump(&self.stats.nhops_allocated);
        log::debug!("nexthop created"; "fib" => self.fibnum, "nhop" => %nh);
        Ok(nh)
    }

    /// Live nexthop for `attrs` without taking a reference.
    pub fn peek(&self, attrs: &NexthopAttrs) -> Option<Arc<Nexthop>> {
        self.inner
            .lock()
            .map
            .get(attrs)
            .filter(|nh| nh.is_live())
            .cloned()
    }

    pub fn hold(&self, nh: &Nexthop) {
        nh.hold();
    }

    /// Drops one reference and unlinks the nexthop when it was the last.
    pub fn release(&self, nh: &Arc<Nexthop>) {
        if !nh.put() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner
            .map
            .get(&nh.attrs)
            .is_some_and(|cur| Arc::ptr_eq(cur, nh))
        {
            inner.map.remove(&nh.attrs);
        }
        drop(inner);

        bump(&self.stats.nhops_freed);
        log::debug!("nexthop unlinked"; "fib" => self.fibnum, "nhop" => %nh);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
