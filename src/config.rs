use foundations::settings::settings;

// A lost race is rare; a third consecutive one means the route is churning
// and the caller should back off.
pub const DFLT_MULTIPATH_MAX_ATTEMPTS: u32 = 3;

pub const DFLT_FLOW_TABLE_SIZE: u32 = 64;
pub const MAX_FLOW_TABLE_SIZE: u32 = 1 << 16;

pub const DFLT_MAX_NEXTHOPS: u32 = 1 << 20;
pub const DFLT_MAX_GROUPS: u32 = 1 << 16;
pub const DFLT_MAX_GROUP_MEMBERS: u32 = 512;

/// Per-table tunables of a RIB head.
#[settings]
pub struct RibSettings {
    /// Number of compose/commit attempts a multipath change makes before
    /// giving up with a retry-exhausted error.
    #[serde(default = "RibSettings::default_multipath_max_attempts")]
    pub multipath_max_attempts: u32,

    /// Buckets in a nexthop group's flow-selection table. Rounded up to a
    /// power of two.
    #[serde(default = "RibSettings::default_flow_table_size")]
    pub flow_table_size: u32,

    /// Seed of the flow-selection hash. Fixed per table so bucket ownership
    /// only moves when group membership does.
    pub flow_hash_seed: u64,

    /// Upper bound on live nexthops in the table.
    #[serde(default = "RibSettings::default_max_nexthops")]
    pub max_nexthops: u32,

    /// Upper bound on live nexthop groups in the table.
    #[serde(default = "RibSettings::default_max_groups")]
    pub max_groups: u32,

    /// Upper bound on members of a single group.
    #[serde(default = "RibSettings::default_max_group_members")]
    pub max_group_members: u32,

    /// Initial value of the instance's local flow-hash switch.
    pub local_flow_hash: bool,
}

impl RibSettings {
    fn default_multipath_max_attempts() -> u32 {
        DFLT_MULTIPATH_MAX_ATTEMPTS
    }

    fn default_flow_table_size() -> u32 {
        DFLT_FLOW_TABLE_SIZE
    }

    fn default_max_nexthops() -> u32 {
        DFLT_MAX_NEXTHOPS
    }

    fn default_max_groups() -> u32 {
        DFLT_MAX_GROUPS
    }

    fn default_max_group_members() -> u32 {
        DFLT_MAX_GROUP_MEMBERS
    }

    /// Effective flow table size: a power of two in `1..=MAX_FLOW_TABLE_SIZE`.
    pub fn flow_buckets(&self) -> usize {
        self.flow_table_size
            .clamp(1, MAX_FLOW_TABLE_SIZE)
            .next_power_of_two() as usize
    }

    /// Attempt budget, never zero.
    pub fn max_attempts(&self) -> u32 {
        self.multipath_max_attempts.max(1)
    }
}

/// Identity of a routing instance (FIB).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceConfig {
    pub fibnum: u32,
    pub name: String,
}

impl InstanceConfig {
    pub fn new(fibnum: u32) -> InstanceConfig {
        InstanceConfig {
            fibnum,
            name: format!("fib{}", fibnum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = RibSettings::default();
        assert_eq!(s.multipath_max_attempts, DFLT_MULTIPATH_MAX_ATTEMPTS);
        assert_eq!(s.flow_buckets(), 64);
        assert_eq!(s.max_groups, DFLT_MAX_GROUPS);
        assert!(!s.local_flow_hash);
    }

    #[test]
    fn flow_buckets_round_up() {
        let s = RibSettings {
            flow_table_size: 100,
            ..Default::default()
        };
        assert_eq!(s.flow_buckets(), 128);

        let s = RibSettings {
            flow_table_size: 0,
            ..Default::default()
        };
        assert_eq!(s.flow_buckets(), 1);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let s = RibSettings {
            multipath_max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(s.max_attempts(), 1);
    }

    #[test]
    fn instance_name() {
        assert_eq!(InstanceConfig::new(3).name, "fib3");
    }
}
