//! Stock predicates for device and pool discovery.

use crate::runtime::{AgentInfo, DeviceClass, PoolInfo, Scan, SegmentClass};

/// Match the first accelerator-class agent.
pub fn accelerator(agent: &AgentInfo) -> Scan {
    if agent.class == DeviceClass::Accelerator {
        Scan::Match
    } else {
        Scan::Next
    }
}

/// Match an agent by exact device name.
pub fn named(name: &str) -> impl Fn(&AgentInfo) -> Scan + '_ {
    move |agent| {
        if agent.name == name {
            Scan::Match
        } else {
            Scan::Next
        }
    }
}

/// Match the first global-segment memory pool.
pub fn global_segment(pool: &PoolInfo) -> Scan {
    if pool.segment == SegmentClass::Global {
        Scan::Match
    } else {
        Scan::Next
    }
}

/// Match a pool of `segment` with at least `min_capacity` bytes.
pub fn segment_with_capacity(
    segment: SegmentClass,
    min_capacity: u64,
) -> impl Fn(&PoolInfo) -> Scan {
    move |pool| {
        if pool.segment == segment && pool.capacity >= min_capacity {
            Scan::Match
        } else {
            Scan::Next
        }
    }
}
