//! Routing table core: deduplicated nexthops, canonical multipath groups,
//! compare-and-swap route binding, and expiration of temporal routes.

pub mod config;
pub mod error;
pub mod expire;
pub mod multipath;
pub mod nexthop;
pub mod nhgrp;
pub mod stats;
pub mod table;
pub mod trie;

pub use config::{InstanceConfig, RibSettings};
pub use error::{Error, Result, Transient};
pub use multipath::{Intent, MultipathPolicy, RouteRequest};
pub use nexthop::{AddressFamily, Nexthop, NexthopAttrs, NhopFlags};
pub use nhgrp::{Forward, NexthopGroup};
pub use stats::RibCounters;
pub use table::{RcInfo, RibHead, RibInstance, Route, RouteCmd};
pub use trie::RibPrefix;
