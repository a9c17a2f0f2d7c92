//! Device runtime surface
//!
//! `DeviceRuntime` is the typed, directly-callable binding surface the
//! offline generator produces from the system headers. The controller depends
//! on this trait only; two backends implement it:
//!
//! - `hsa` - the vendor `libhsa-runtime64` loaded dynamically
//! - `mock` - an in-process fake for tests and no-GPU fuzz runs
//!
//! `Runtime` wraps a backend in a reference-counted init/shutdown guard: the
//! constructor initializes the runtime exactly once, and the backend is shut
//! down when the last clone drops. Sessions hold a clone for their lifetime,
//! so the first session brings the runtime up and the last owner tears it
//! down, with no process-lifetime globals involved.

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub mod hsa;
pub mod mock;

/// Opaque handle to a physical compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentHandle(pub u64);

/// Opaque handle to an allocatable memory segment on an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub u64);

/// Opaque handle to a command-submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

/// Opaque handle to a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle(pub u64);

/// Opaque handle to an executable context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecHandle(pub u64);

/// Opaque handle to a code-object reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderHandle(pub u64);

/// Device class of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Host CPU agent.
    Host,
    /// GPU or other accelerator agent.
    Accelerator,
}

/// Segment class of a memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    Global,
    ReadOnly,
    Private,
    Group,
}

/// An agent as seen during enumeration.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub handle: AgentHandle,
    /// Human-readable device name (e.g. "gfx90a").
    pub name: String,
    pub class: DeviceClass,
}

/// A memory pool as seen during per-agent enumeration.
#[derive(Debug, Clone, Copy)]
pub struct PoolInfo {
    pub handle: PoolHandle,
    pub segment: SegmentClass,
    /// Pool capacity in bytes.
    pub capacity: u64,
}

/// Resolved metadata for a kernel entry point.
#[derive(Debug, Clone, Copy)]
pub struct SymbolInfo {
    pub kernel_object: u64,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
    pub kernarg_segment_size: u32,
    pub kernarg_alignment: u32,
}

/// Outcome of one predicate application during enumeration.
///
/// The directory folds the runtime's enumeration through a predicate
/// returning this sum type; backends only distinguish `Next` (keep
/// iterating) from anything else (stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// This element is the result; stop enumerating.
    Match,
    /// Not this one; continue with the next element.
    Next,
    /// Abandon the enumeration with no result.
    Stop,
}

/// A dispatch request in backend-neutral form.
///
/// Only the backend knows the wire-level packet layout; the controller fills
/// in dimensions, segment sizes and handles and leaves the lowering to the
/// `submit` implementation.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPacket {
    pub workgroup: [u16; 3],
    pub grid: [u32; 3],
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
    pub completion: SignalHandle,
}

/// Result of waiting on a completion signal with a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
}

/// The low-level device-runtime API surface.
///
/// Methods mirror the runtime's verbs one-to-one; no method holds state
/// across calls beyond what the underlying runtime itself holds.
pub trait DeviceRuntime: Send + Sync {
    /// Initialize the runtime. Idempotent at the backend's discretion;
    /// failure means no devices are usable.
    fn init(&self) -> Result<()>;

    /// Shut the runtime down. Called exactly once, after every queue owned
    /// by a session has been destroyed. Failures are logged, not returned:
    /// there is nothing a caller could do with one.
    fn shutdown(&self);

    /// Enumerate agents, calling `visit` for each until it returns something
    /// other than [`Scan::Next`] or the set is exhausted.
    fn for_each_agent(&self, visit: &mut dyn FnMut(&AgentInfo) -> Scan) -> Result<()>;

    /// Enumerate the memory pools of one agent, same protocol as
    /// [`DeviceRuntime::for_each_agent`].
    fn for_each_pool(
        &self,
        agent: AgentHandle,
        visit: &mut dyn FnMut(&PoolInfo) -> Scan,
    ) -> Result<()>;

    /// Create a command queue of fixed `capacity` packets against `agent`.
    fn queue_create(&self, agent: AgentHandle, capacity: u32) -> Result<QueueHandle>;

    fn queue_destroy(&self, queue: QueueHandle) -> Result<()>;

    /// Allocate `size` bytes from `pool`, returning the device pointer.
    fn pool_allocate(&self, pool: PoolHandle, size: u64) -> Result<u64>;

    fn pool_free(&self, ptr: u64) -> Result<()>;

    /// Copy host bytes into an allocation previously returned by
    /// [`DeviceRuntime::pool_allocate`].
    fn buffer_write(&self, ptr: u64, bytes: &[u8]) -> Result<()>;

    /// Construct a code-object reader from an open artifact file. The caller
    /// closes the file as soon as this returns.
    fn reader_from_file(&self, file: &File) -> Result<ReaderHandle>;

    fn reader_destroy(&self, reader: ReaderHandle) -> Result<()>;

    /// Create an empty executable context with the fixed profile and
    /// float-rounding policy.
    fn executable_create(&self) -> Result<ExecHandle>;

    /// Load the read code object into `exec`, bound to `agent`.
    fn executable_load(
        &self,
        exec: ExecHandle,
        agent: AgentHandle,
        reader: ReaderHandle,
    ) -> Result<()>;

    /// Freeze `exec`; no further code objects may target it.
    fn executable_freeze(&self, exec: ExecHandle) -> Result<()>;

    fn executable_destroy(&self, exec: ExecHandle) -> Result<()>;

    /// Resolve `name` within a frozen executable for `agent`.
    ///
    /// Fails with [`crate::FuzzError::SymbolNotFound`] when absent.
    fn symbol_resolve(&self, exec: ExecHandle, agent: AgentHandle, name: &str)
        -> Result<SymbolInfo>;

    /// Create a one-shot completion signal with initial value 1.
    fn signal_create(&self) -> Result<SignalHandle>;

    fn signal_destroy(&self, signal: SignalHandle) -> Result<()>;

    /// Wait until `signal` drops below 1 or `timeout` elapses.
    /// `Duration::ZERO` polls once without blocking.
    fn signal_wait(&self, signal: SignalHandle, timeout: Duration) -> Result<WaitOutcome>;

    /// Enqueue a dispatch packet. Non-blocking: returns as soon as the
    /// packet is visible to the device.
    fn submit(&self, queue: QueueHandle, packet: &DispatchPacket) -> Result<()>;
}

struct RuntimeInner {
    backend: Box<dyn DeviceRuntime>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.backend.shutdown();
    }
}

/// Reference-counted ownership of an initialized device runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Initialize `backend` and take shared ownership of it.
    pub fn new(backend: Box<dyn DeviceRuntime>) -> Result<Self> {
        backend.init()?;
        Ok(Self {
            inner: Arc::new(RuntimeInner { backend }),
        })
    }

    /// The underlying binding surface.
    pub fn backend(&self) -> &dyn DeviceRuntime {
        self.inner.backend.as_ref()
    }

    /// Number of live owners of the initialized runtime.
    pub fn owner_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("owners", &self.owner_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRuntime;
    use super::*;

    #[test]
    fn test_runtime_guard_initializes_and_shuts_down_once() {
        let backend = MockRuntime::single_accelerator();
        let probe = backend.probe();

        let runtime = Runtime::new(Box::new(backend)).unwrap();
        let second = runtime.clone();
        assert_eq!(runtime.owner_count(), 2);
        assert_eq!(probe.shutdown_count(), 0);

        drop(runtime);
        assert_eq!(probe.shutdown_count(), 0);
        drop(second);
        assert_eq!(probe.shutdown_count(), 1);
    }
}
