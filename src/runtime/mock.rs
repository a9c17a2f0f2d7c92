//! In-process mock of the device runtime
//!
//! Drives the exact same verb surface as the vendor backend without touching
//! hardware, so the controller can be exercised on machines with no GPU and
//! the test suite can assert on resource accounting (queues created, bytes
//! allocated, signals completed) after the fact.
//!
//! Mock code objects are plain text files listing one kernel symbol per
//! line; `reader_from_file` parses them and `symbol_resolve` checks
//! membership.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{FuzzError, Result};

use super::{
    AgentHandle, AgentInfo, DeviceClass, DeviceRuntime, DispatchPacket, ExecHandle, PoolHandle,
    PoolInfo, QueueHandle, ReaderHandle, Scan, SegmentClass, SignalHandle, SymbolInfo,
    WaitOutcome,
};

/// One fake memory pool.
#[derive(Debug, Clone, Copy)]
pub struct MockPool {
    pub segment: SegmentClass,
    pub capacity: u64,
}

/// One fake agent with its pools.
#[derive(Debug, Clone)]
pub struct MockAgent {
    pub name: String,
    pub class: DeviceClass,
    pub pools: Vec<MockPool>,
}

#[derive(Debug)]
struct ExecState {
    symbols: Vec<String>,
    frozen: bool,
}

#[derive(Debug, Default)]
struct Inner {
    agents: Vec<MockAgent>,
    init_count: u32,
    shutdown_count: u32,
    queues: HashMap<u64, u32>,
    next_queue: u64,
    /// ptr -> (size, owning pool handle)
    allocations: HashMap<u64, (u64, u64)>,
    next_ptr: u64,
    buffer_contents: HashMap<u64, Vec<u8>>,
    readers: HashMap<u64, Vec<String>>,
    next_reader: u64,
    executables: HashMap<u64, ExecState>,
    next_exec: u64,
    signals: HashMap<u64, i64>,
    next_signal: u64,
    submitted: u32,
    hold_completions: bool,
    fail_next_submit: bool,
    kernarg_segment_size: u32,
    kernarg_alignment: u32,
}

/// Shared, lockable state behind a [`MockRuntime`] and its probes.
#[derive(Debug)]
pub struct MockState {
    inner: Mutex<Inner>,
}

/// Mock device-runtime backend.
pub struct MockRuntime {
    state: Arc<MockState>,
}

/// Handle for inspecting and steering a mock runtime from outside, after the
/// backend itself has been boxed into a [`super::Runtime`].
#[derive(Clone)]
pub struct MockProbe {
    state: Arc<MockState>,
}

const AGENT_SHIFT: u64 = 8;
const FIRST_PTR: u64 = 0x1000_0000;

fn agent_handle(idx: usize) -> u64 {
    ((idx as u64) + 1) << AGENT_SHIFT
}

fn pool_handle(agent_idx: usize, pool_idx: usize) -> u64 {
    agent_handle(agent_idx) | ((pool_idx as u64) + 1)
}

fn decode_agent(handle: u64) -> usize {
    ((handle >> AGENT_SHIFT) - 1) as usize
}

fn decode_pool(handle: u64) -> (usize, usize) {
    (decode_agent(handle), ((handle & 0xff) - 1) as usize)
}

impl MockRuntime {
    /// Build a mock with an explicit agent/pool topology.
    pub fn new(agents: Vec<MockAgent>) -> Self {
        let inner = Inner {
            agents,
            next_ptr: FIRST_PTR,
            kernarg_segment_size: 64,
            kernarg_alignment: 16,
            ..Inner::default()
        };
        Self {
            state: Arc::new(MockState {
                inner: Mutex::new(inner),
            }),
        }
    }

    /// One accelerator with a global and a group pool.
    pub fn single_accelerator() -> Self {
        Self::new(vec![accelerator_agent()])
    }

    /// A host agent enumerated before an accelerator, to exercise
    /// first-match predicate skipping.
    pub fn host_and_accelerator() -> Self {
        Self::new(vec![host_agent(), accelerator_agent()])
    }

    /// A host agent only; accelerator predicates find nothing here.
    pub fn host_only() -> Self {
        Self::new(vec![host_agent()])
    }

    /// Obtain a probe sharing this runtime's state.
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.state.inner.lock().unwrap()
    }
}

impl MockProbe {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.state.inner.lock().unwrap()
    }

    pub fn init_count(&self) -> u32 {
        self.lock().init_count
    }

    pub fn shutdown_count(&self) -> u32 {
        self.lock().shutdown_count
    }

    pub fn live_queues(&self) -> usize {
        self.lock().queues.len()
    }

    /// Number of pool allocations that have not been freed.
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    pub fn live_executables(&self) -> usize {
        self.lock().executables.len()
    }

    pub fn live_signals(&self) -> usize {
        self.lock().signals.len()
    }

    pub fn submitted(&self) -> u32 {
        self.lock().submitted
    }

    /// Keep completion signals pending until [`MockProbe::complete_all`].
    pub fn hold_completions(&self, hold: bool) {
        self.lock().hold_completions = hold;
    }

    /// Complete every pending signal.
    pub fn complete_all(&self) {
        let mut inner = self.lock();
        for value in inner.signals.values_mut() {
            *value = 0;
        }
    }

    /// Make the next submission fail at the queue level.
    pub fn fail_next_submit(&self) {
        self.lock().fail_next_submit = true;
    }

    /// Override the kernarg segment metadata reported for resolved symbols.
    pub fn set_kernarg_layout(&self, segment_size: u32, alignment: u32) {
        let mut inner = self.lock();
        inner.kernarg_segment_size = segment_size;
        inner.kernarg_alignment = alignment;
    }
}

fn accelerator_agent() -> MockAgent {
    MockAgent {
        name: "gfx90a-mock".to_string(),
        class: DeviceClass::Accelerator,
        pools: vec![
            MockPool {
                segment: SegmentClass::Global,
                capacity: 16 * 1024 * 1024 * 1024,
            },
            MockPool {
                segment: SegmentClass::Group,
                capacity: 64 * 1024,
            },
        ],
    }
}

fn host_agent() -> MockAgent {
    MockAgent {
        name: "mock-cpu".to_string(),
        class: DeviceClass::Host,
        pools: vec![MockPool {
            segment: SegmentClass::Global,
            capacity: 64 * 1024 * 1024 * 1024,
        }],
    }
}

fn api(call: &'static str, reason: impl Into<String>) -> FuzzError {
    FuzzError::Api {
        call,
        reason: reason.into(),
    }
}

impl DeviceRuntime for MockRuntime {
    fn init(&self) -> Result<()> {
        self.lock().init_count += 1;
        Ok(())
    }

    fn shutdown(&self) {
        self.lock().shutdown_count += 1;
    }

    fn for_each_agent(&self, visit: &mut dyn FnMut(&AgentInfo) -> Scan) -> Result<()> {
        let agents: Vec<AgentInfo> = {
            let inner = self.lock();
            inner
                .agents
                .iter()
                .enumerate()
                .map(|(idx, a)| AgentInfo {
                    handle: AgentHandle(agent_handle(idx)),
                    name: a.name.clone(),
                    class: a.class,
                })
                .collect()
        };
        for info in &agents {
            if visit(info) != Scan::Next {
                break;
            }
        }
        Ok(())
    }

    fn for_each_pool(
        &self,
        agent: AgentHandle,
        visit: &mut dyn FnMut(&PoolInfo) -> Scan,
    ) -> Result<()> {
        let pools: Vec<PoolInfo> = {
            let inner = self.lock();
            let idx = decode_agent(agent.0);
            let mock = inner
                .agents
                .get(idx)
                .ok_or_else(|| api("hsa_amd_agent_iterate_memory_pools", "unknown agent"))?;
            mock.pools
                .iter()
                .enumerate()
                .map(|(p, pool)| PoolInfo {
                    handle: PoolHandle(pool_handle(idx, p)),
                    segment: pool.segment,
                    capacity: pool.capacity,
                })
                .collect()
        };
        for info in &pools {
            if visit(info) != Scan::Next {
                break;
            }
        }
        Ok(())
    }

    fn queue_create(&self, agent: AgentHandle, capacity: u32) -> Result<QueueHandle> {
        let mut inner = self.lock();
        let idx = decode_agent(agent.0);
        if inner.agents.get(idx).is_none() {
            return Err(api("hsa_queue_create", "unknown agent"));
        }
        inner.next_queue += 1;
        let handle = inner.next_queue;
        inner.queues.insert(handle, capacity);
        Ok(QueueHandle(handle))
    }

    fn queue_destroy(&self, queue: QueueHandle) -> Result<()> {
        let mut inner = self.lock();
        inner
            .queues
            .remove(&queue.0)
            .map(|_| ())
            .ok_or_else(|| api("hsa_queue_destroy", "unknown queue"))
    }

    fn pool_allocate(&self, pool: PoolHandle, size: u64) -> Result<u64> {
        let mut inner = self.lock();
        let (agent_idx, pool_idx) = decode_pool(pool.0);
        let capacity = inner
            .agents
            .get(agent_idx)
            .and_then(|a| a.pools.get(pool_idx))
            .map(|p| p.capacity)
            .ok_or_else(|| api("hsa_amd_memory_pool_allocate", "unknown pool"))?;
        let used: u64 = inner
            .allocations
            .values()
            .filter(|(_, owner)| *owner == pool.0)
            .map(|(sz, _)| *sz)
            .sum();
        if used + size > capacity {
            return Err(api("hsa_amd_memory_pool_allocate", "pool exhausted"));
        }
        let ptr = inner.next_ptr;
        inner.next_ptr += size.max(1).div_ceil(4096) * 4096;
        inner.allocations.insert(ptr, (size, pool.0));
        Ok(ptr)
    }

    fn pool_free(&self, ptr: u64) -> Result<()> {
        let mut inner = self.lock();
        inner.buffer_contents.remove(&ptr);
        inner
            .allocations
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| api("hsa_amd_memory_pool_free", "unknown allocation"))
    }

    fn buffer_write(&self, ptr: u64, bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let (size, _) = *inner
            .allocations
            .get(&ptr)
            .ok_or_else(|| api("buffer_write", "unknown allocation"))?;
        if bytes.len() as u64 > size {
            return Err(api("buffer_write", "write exceeds allocation"));
        }
        inner.buffer_contents.insert(ptr, bytes.to_vec());
        Ok(())
    }

    fn reader_from_file(&self, file: &File) -> Result<ReaderHandle> {
        let mut content = String::new();
        let mut reader = file;
        reader
            .read_to_string(&mut content)
            .map_err(|e| api("hsa_code_object_reader_create_from_file", e.to_string()))?;
        let symbols: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let mut inner = self.lock();
        inner.next_reader += 1;
        let handle = inner.next_reader;
        inner.readers.insert(handle, symbols);
        Ok(ReaderHandle(handle))
    }

    fn reader_destroy(&self, reader: ReaderHandle) -> Result<()> {
        let mut inner = self.lock();
        inner
            .readers
            .remove(&reader.0)
            .map(|_| ())
            .ok_or_else(|| api("hsa_code_object_reader_destroy", "unknown reader"))
    }

    fn executable_create(&self) -> Result<ExecHandle> {
        let mut inner = self.lock();
        inner.next_exec += 1;
        let handle = inner.next_exec;
        inner.executables.insert(
            handle,
            ExecState {
                symbols: Vec::new(),
                frozen: false,
            },
        );
        Ok(ExecHandle(handle))
    }

    fn executable_load(
        &self,
        exec: ExecHandle,
        _agent: AgentHandle,
        reader: ReaderHandle,
    ) -> Result<()> {
        let mut inner = self.lock();
        let symbols = inner
            .readers
            .get(&reader.0)
            .cloned()
            .ok_or_else(|| api("hsa_executable_load_agent_code_object", "unknown reader"))?;
        let state = inner
            .executables
            .get_mut(&exec.0)
            .ok_or_else(|| api("hsa_executable_load_agent_code_object", "unknown executable"))?;
        if state.frozen {
            return Err(api(
                "hsa_executable_load_agent_code_object",
                "executable is frozen",
            ));
        }
        state.symbols.extend(symbols);
        Ok(())
    }

    fn executable_freeze(&self, exec: ExecHandle) -> Result<()> {
        let mut inner = self.lock();
        let state = inner
            .executables
            .get_mut(&exec.0)
            .ok_or_else(|| api("hsa_executable_freeze", "unknown executable"))?;
        state.frozen = true;
        Ok(())
    }

    fn executable_destroy(&self, exec: ExecHandle) -> Result<()> {
        let mut inner = self.lock();
        inner
            .executables
            .remove(&exec.0)
            .map(|_| ())
            .ok_or_else(|| api("hsa_executable_destroy", "unknown executable"))
    }

    fn symbol_resolve(
        &self,
        exec: ExecHandle,
        _agent: AgentHandle,
        name: &str,
    ) -> Result<SymbolInfo> {
        let inner = self.lock();
        let state = inner
            .executables
            .get(&exec.0)
            .ok_or_else(|| api("hsa_executable_get_symbol_by_name", "unknown executable"))?;
        if !state.frozen {
            return Err(api(
                "hsa_executable_get_symbol_by_name",
                "executable not frozen",
            ));
        }
        let position = state
            .symbols
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| FuzzError::SymbolNotFound {
                name: name.to_string(),
            })?;
        Ok(SymbolInfo {
            kernel_object: 0x4000 + position as u64,
            group_segment_size: 0,
            private_segment_size: 0,
            kernarg_segment_size: inner.kernarg_segment_size,
            kernarg_alignment: inner.kernarg_alignment,
        })
    }

    fn signal_create(&self) -> Result<SignalHandle> {
        let mut inner = self.lock();
        inner.next_signal += 1;
        let handle = inner.next_signal;
        inner.signals.insert(handle, 1);
        Ok(SignalHandle(handle))
    }

    fn signal_destroy(&self, signal: SignalHandle) -> Result<()> {
        let mut inner = self.lock();
        inner
            .signals
            .remove(&signal.0)
            .map(|_| ())
            .ok_or_else(|| api("hsa_signal_destroy", "unknown signal"))
    }

    fn signal_wait(&self, signal: SignalHandle, _timeout: Duration) -> Result<WaitOutcome> {
        // Nothing completes signals concurrently in the mock, so a pending
        // signal is reported as a timeout no matter the bound.
        let inner = self.lock();
        let value = inner
            .signals
            .get(&signal.0)
            .copied()
            .ok_or_else(|| api("hsa_signal_wait_scacquire", "unknown signal"))?;
        if value < 1 {
            Ok(WaitOutcome::Completed)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }

    fn submit(&self, queue: QueueHandle, packet: &DispatchPacket) -> Result<()> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(&queue.0) {
            return Err(api("submit", "unknown queue"));
        }
        if inner.fail_next_submit {
            inner.fail_next_submit = false;
            return Err(api("submit", "injected submission failure"));
        }
        if !inner.signals.contains_key(&packet.completion.0) {
            return Err(api("submit", "unknown completion signal"));
        }
        inner.submitted += 1;
        if !inner.hold_completions {
            inner.signals.insert(packet.completion.0, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let mock = MockRuntime::new(vec![MockAgent {
            name: "tiny".to_string(),
            class: DeviceClass::Accelerator,
            pools: vec![MockPool {
                segment: SegmentClass::Global,
                capacity: 4096,
            }],
        }]);
        let pool = PoolHandle(pool_handle(0, 0));

        let ptr = mock.pool_allocate(pool, 4096).unwrap();
        assert!(mock.pool_allocate(pool, 1).is_err());
        mock.pool_free(ptr).unwrap();
        assert!(mock.pool_allocate(pool, 4096).is_ok());
    }

    #[test]
    fn test_enumeration_stops_on_match() {
        let mock = MockRuntime::host_and_accelerator();
        let mut seen = 0;
        mock.for_each_agent(&mut |_| {
            seen += 1;
            Scan::Match
        })
        .unwrap();
        assert_eq!(seen, 1);
    }
}
