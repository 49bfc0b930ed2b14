//! Adapter over the prefix trie that stores a table's routes.

use crate::nexthop::AddressFamily;
use crate::table::Route;
use ipnet::{Ipv4Net, Ipv6Net};
use prefix_trie::{Prefix, PrefixMap};
use std::fmt;

/// Prefix types a RIB head can be keyed on.
pub trait RibPrefix: Prefix + Copy + Eq + fmt::Display + fmt::Debug + Send + Sync + 'static {
    const FAMILY: AddressFamily;
}

impl RibPrefix for Ipv4Net {
    const FAMILY: AddressFamily = AddressFamily::Inet;
}

impl RibPrefix for Ipv6Net {
    const FAMILY: AddressFamily = AddressFamily::Inet6;
}

pub struct RouteTrie<P: RibPrefix> {
    map: PrefixMap<P, Route<P>>,
    count: usize,
}

impl<P: RibPrefix> RouteTrie<P> {
    pub fn new() -> RouteTrie<P> {
        RouteTrie {
            map: PrefixMap::new(),
            count: 0,
        }
    }

    /// Exact match.
    pub fn lookup(&self, prefix: &P) -> Option<&Route<P>> {
        self.map.get(prefix)
    }

    pub fn lookup_mut(&mut self, prefix: &P) -> Option<&mut Route<P>> {
        self.map.get_mut(prefix)
    }

    /// Longest-prefix match.
    pub fn matches(&self, prefix: &P) -> Option<&Route<P>> {
        self.map.get_lpm(prefix).map(|(_, route)| route)
    }

    pub fn insert(&mut self, route: Route<P>) -> Option<Route<P>> {
        let old = self.map.insert(route.prefix, route);
        if old.is_none() {
            self.count += 1;
        }
        old
    }

    pub fn remove(&mut self, prefix: &P) -> Option<Route<P>> {
        let old = self.map.remove(prefix);
        if old.is_some() {
            self.count -= 1;
        }
        old
    }

    /// Removes the route at `prefix` only if `pred` holds for it.
    pub fn remove_if(
        &mut self,
        prefix: &P,
        pred: impl FnOnce(&Route<P>) -> bool,
    ) -> Option<Route<P>> {
        match self.map.get(prefix) {
            Some(route) if pred(route) => self.remove(prefix),
            _ => None,
        }
    }

    pub fn walk(&self, mut f: impl FnMut(&Route<P>)) {
        for (_, route) in self.map.iter() {
            f(route);
        }
    }

    /// Empties the trie, handing back every route.
    pub fn drain(&mut self) -> Vec<Route<P>> {
        let prefixes: Vec<P> = self.map.iter().map(|(p, _)| *p).collect();
        prefixes
            .iter()
            .filter_map(|p| self.remove(p))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<P: RibPrefix> Default for RouteTrie<P> {
    fn default() -> Self {
        Self::new()
    }
}
