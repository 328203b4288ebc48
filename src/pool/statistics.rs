//! Template usage statistics
//!
//! Classifies every device of a template path into exactly one bucket by
//! looking at that device's own `(connections, reserved, state, owner)`
//! tuple, then renders each bucket as a collapsed range string.

use crate::domain::ports::{FcpId, FcpRecord, FcpStatus, PathMap};
use crate::hardware::range::collapse_to_ranges;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Statistics bucket of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UsageBucket {
    /// Free on the hardware and unused by the pool
    Available,
    /// Reserved and connected
    Allocated,
    /// Reserved without connections
    ReserveOnly,
    /// Connected but not reserved
    ConnectionOnly,
    /// Hardware reports it active while the pool has no assignment
    UnallocatedButActive,
    /// Pool reports it connected while the hardware reports it free
    AllocatedButFree,
    NotFound,
    Offline,
}

/// Classify one device; `None` means the pool has no record of it
pub fn classify(record: Option<&FcpRecord>) -> UsageBucket {
    let Some(r) = record else {
        return UsageBucket::NotFound;
    };
    match (r.state, r.connections > 0, r.reserved) {
        (FcpStatus::NotFound, _, _) => UsageBucket::NotFound,
        (FcpStatus::Offline, _, _) => UsageBucket::Offline,
        (_, true, false) => UsageBucket::ConnectionOnly,
        (FcpStatus::Free, true, true) => UsageBucket::AllocatedButFree,
        (_, true, true) => UsageBucket::Allocated,
        (_, false, true) => UsageBucket::ReserveOnly,
        (FcpStatus::Free, false, false) => UsageBucket::Available,
        (FcpStatus::Active, false, false) => UsageBucket::UnallocatedButActive,
    }
}

/// Device ids of one bucket, collapsed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRanges {
    pub ranges: String,
    pub count: usize,
}

impl DeviceRanges {
    fn from_ids(ids: &BTreeSet<FcpId>) -> Self {
        Self {
            ranges: collapse_to_ranges(ids),
            count: ids.len(),
        }
    }
}

/// Usage statistics of one template path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStatistics {
    pub total: DeviceRanges,
    pub available: DeviceRanges,
    pub allocated: DeviceRanges,
    pub reserve_only: DeviceRanges,
    pub connection_only: DeviceRanges,
    /// device id -> owner reported by the hypervisor
    pub unallocated_but_active: BTreeMap<String, String>,
    pub allocated_but_free: DeviceRanges,
    pub not_found: DeviceRanges,
    pub offline: DeviceRanges,
    /// chpid -> device ranges on that channel path
    pub chpids: BTreeMap<String, String>,
}

/// Compute statistics for the devices of one path
pub fn path_statistics(ids: &BTreeSet<FcpId>, records: &HashMap<FcpId, FcpRecord>) -> PathStatistics {
    let mut buckets: BTreeMap<UsageBucket, BTreeSet<FcpId>> = BTreeMap::new();
    let mut chpids: BTreeMap<String, BTreeSet<FcpId>> = BTreeMap::new();
    let mut unallocated_but_active = BTreeMap::new();

    for id in ids {
        let record = records.get(id);
        let bucket = classify(record);
        if bucket == UsageBucket::UnallocatedButActive {
            if let Some(r) = record {
                unallocated_but_active.insert(id.to_string(), r.owner.clone());
            }
        }
        buckets.entry(bucket).or_default().insert(id.clone());

        if let Some(r) = record.filter(|r| !r.chpid.is_empty()) {
            chpids.entry(r.chpid.clone()).or_default().insert(id.clone());
        }
    }

    let bucket = |b: UsageBucket| {
        buckets
            .get(&b)
            .map(DeviceRanges::from_ids)
            .unwrap_or_default()
    };

    PathStatistics {
        total: DeviceRanges::from_ids(ids),
        available: bucket(UsageBucket::Available),
        allocated: bucket(UsageBucket::Allocated),
        reserve_only: bucket(UsageBucket::ReserveOnly),
        connection_only: bucket(UsageBucket::ConnectionOnly),
        unallocated_but_active,
        allocated_but_free: bucket(UsageBucket::AllocatedButFree),
        not_found: bucket(UsageBucket::NotFound),
        offline: bucket(UsageBucket::Offline),
        chpids: chpids
            .iter()
            .map(|(chpid, ids)| (chpid.clone(), collapse_to_ranges(ids)))
            .collect(),
    }
}

/// Compute statistics for every path of a template
pub fn template_statistics(
    paths: &PathMap,
    records: &HashMap<FcpId, FcpRecord>,
) -> BTreeMap<u32, PathStatistics> {
    paths
        .iter()
        .map(|(path, ids)| (*path, path_statistics(ids, records)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::range::expand_ranges;

    fn record(id: &str, connections: u32, reserved: bool, state: FcpStatus) -> FcpRecord {
        let mut r = FcpRecord::placeholder(FcpId::parse(id).unwrap());
        r.connections = connections;
        r.reserved = reserved;
        r.state = state;
        r.chpid = "27".into();
        if connections > 0 || reserved {
            r.assigner_id = "USER1".into();
        }
        r
    }

    #[test]
    fn test_classification_is_exclusive() {
        let cases = [
            (record("1a00", 0, false, FcpStatus::Free), UsageBucket::Available),
            (record("1a00", 1, true, FcpStatus::Active), UsageBucket::Allocated),
            (record("1a00", 0, true, FcpStatus::Free), UsageBucket::ReserveOnly),
            (record("1a00", 1, false, FcpStatus::Active), UsageBucket::ConnectionOnly),
            (record("1a00", 0, false, FcpStatus::Active), UsageBucket::UnallocatedButActive),
            (record("1a00", 2, true, FcpStatus::Free), UsageBucket::AllocatedButFree),
            (record("1a00", 0, false, FcpStatus::NotFound), UsageBucket::NotFound),
            (record("1a00", 1, true, FcpStatus::Offline), UsageBucket::Offline),
        ];
        for (r, expected) in cases {
            assert_eq!(classify(Some(&r)), expected, "{:?}", r);
        }
        assert_eq!(classify(None), UsageBucket::NotFound);
    }

    #[test]
    fn test_path_statistics() {
        let paths = expand_ranges("1a00-1a05").unwrap();
        let mut active = record("1a04", 0, false, FcpStatus::Active);
        active.owner = "x".into();
        active.chpid = "28".into();
        let records: HashMap<FcpId, FcpRecord> = [
            record("1a00", 0, false, FcpStatus::Free),
            record("1a01", 0, false, FcpStatus::Free),
            record("1a02", 1, true, FcpStatus::Active),
            record("1a03", 1, false, FcpStatus::Active),
            active,
        ]
        .into_iter()
        .map(|r| (r.fcp_id.clone(), r))
        .collect();

        let stats = template_statistics(&paths, &records);
        let path0 = &stats[&0];
        assert_eq!(path0.total.ranges, "1A00-1A05");
        assert_eq!(path0.total.count, 6);
        assert_eq!(path0.available.ranges, "1A00-1A01");
        assert_eq!(path0.allocated.ranges, "1A02");
        assert_eq!(path0.connection_only.ranges, "1A03");
        assert_eq!(path0.unallocated_but_active.get("1a04").map(String::as_str), Some("x"));
        assert_eq!(path0.not_found.ranges, "1A05");
        assert_eq!(path0.offline.count, 0);
        assert_eq!(path0.chpids.get("27").map(String::as_str), Some("1A00-1A03"));
        assert_eq!(path0.chpids.get("28").map(String::as_str), Some("1A04"));
    }
}
