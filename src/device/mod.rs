//! Device Directory - enumerates agents and memory pools
//!
//! Pure queries over the runtime's enumeration: the directory folds each
//! enumeration through a caller-supplied predicate and returns the first
//! match. Predicates return [`Scan`]: `Match` takes the element and stops,
//! `Next` keeps going, `Stop` abandons the scan early with no result.
//!
//! Discovery-detail logging (agent names, pool capacities) is gated by the
//! `verbose` flag passed at construction; nothing in here reads the process
//! environment.

use tracing::info;

use crate::error::{FuzzError, Result};
use crate::runtime::{AgentInfo, PoolInfo, Runtime, Scan};

pub mod predicates;

/// Read-only view over the runtime's agents and memory pools.
pub struct DeviceDirectory {
    runtime: Runtime,
    verbose: bool,
}

impl DeviceDirectory {
    pub fn new(runtime: Runtime, verbose: bool) -> Self {
        Self { runtime, verbose }
    }

    /// Find the first agent satisfying `predicate`.
    ///
    /// Enumerates the runtime's agents exactly once, short-circuiting on the
    /// first `Match`. Returns [`FuzzError::AgentNotFound`] when the set is
    /// exhausted (or the predicate stops the scan) without a match.
    pub fn find_device(&self, predicate: impl Fn(&AgentInfo) -> Scan) -> Result<AgentInfo> {
        let mut found: Option<AgentInfo> = None;
        self.runtime.backend().for_each_agent(&mut |agent| {
            match predicate(agent) {
                Scan::Match => {
                    if self.verbose {
                        info!(
                            agent = %agent.name,
                            class = ?agent.class,
                            "agent matched device predicate"
                        );
                    }
                    found = Some(agent.clone());
                    Scan::Match
                }
                other => other,
            }
        })?;
        found.ok_or(FuzzError::AgentNotFound)
    }

    /// Find the first memory pool on `agent` satisfying `predicate`.
    pub fn find_memory_pool(
        &self,
        agent: &AgentInfo,
        predicate: impl Fn(&PoolInfo) -> Scan,
    ) -> Result<PoolInfo> {
        let mut found: Option<PoolInfo> = None;
        self.runtime
            .backend()
            .for_each_pool(agent.handle, &mut |pool| match predicate(pool) {
                Scan::Match => {
                    if self.verbose {
                        info!(
                            agent = %agent.name,
                            segment = ?pool.segment,
                            capacity = pool.capacity,
                            "memory pool matched predicate"
                        );
                    }
                    found = Some(*pool);
                    Scan::Match
                }
                other => other,
            })?;
        found.ok_or_else(|| FuzzError::PoolNotFound {
            agent: agent.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{DeviceClass, SegmentClass};

    fn directory(backend: MockRuntime) -> DeviceDirectory {
        let runtime = Runtime::new(Box::new(backend)).unwrap();
        DeviceDirectory::new(runtime, false)
    }

    #[test]
    fn test_find_device_skips_non_matching() {
        let dir = directory(MockRuntime::host_and_accelerator());
        let agent = dir.find_device(predicates::accelerator).unwrap();
        assert_eq!(agent.class, DeviceClass::Accelerator);
        assert_eq!(agent.name, "gfx90a-mock");
    }

    #[test]
    fn test_find_device_not_found() {
        let dir = directory(MockRuntime::host_only());
        let err = dir.find_device(predicates::accelerator).unwrap_err();
        assert!(matches!(err, FuzzError::AgentNotFound));
    }

    #[test]
    fn test_predicate_stop_abandons_scan() {
        let dir = directory(MockRuntime::host_and_accelerator());
        // Stop on the first (host) agent: the accelerator is never visited.
        let err = dir.find_device(|_| Scan::Stop).unwrap_err();
        assert!(matches!(err, FuzzError::AgentNotFound));
    }

    #[test]
    fn test_find_global_pool() {
        let dir = directory(MockRuntime::single_accelerator());
        let agent = dir.find_device(predicates::accelerator).unwrap();
        let pool = dir
            .find_memory_pool(&agent, predicates::global_segment)
            .unwrap();
        assert_eq!(pool.segment, SegmentClass::Global);
    }

    #[test]
    fn test_find_device_by_name() {
        let dir = directory(MockRuntime::host_and_accelerator());
        let agent = dir.find_device(predicates::named("mock-cpu")).unwrap();
        assert_eq!(agent.class, DeviceClass::Host);
    }
}
