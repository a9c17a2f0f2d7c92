//! Device session - the unit of resource lifetime
//!
//! A `Session` owns one command queue against one discovered agent, plus
//! every buffer and executable context acquired through it. Construction is
//! a strict three-step sequence (runtime handle, agent discovery, queue
//! creation), each step fatal on failure with any partial acquisition
//! released. Teardown runs in exact reverse order and is idempotent.
//!
//! State machine: `Uninitialized -> Initializing -> Ready -> Closing ->
//! Closed`. `Closing` is entered on explicit `close()` or on a fatal
//! submission error; `Closed` is terminal.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::device::{predicates, DeviceDirectory};
use crate::error::{FuzzError, Result};
use crate::metrics;
use crate::runtime::{AgentInfo, ExecHandle, PoolHandle, QueueHandle, Runtime, Scan};

pub mod dispatch;
pub mod loader;

pub use dispatch::{DispatchHandle, Dispatcher, KernelArg, LaunchDims};
pub use loader::{ArtifactId, CodeLoader, KernelSymbol};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No resources acquired yet.
    Uninitialized,
    /// Construction in progress.
    Initializing,
    /// Fully usable: queue is live, dispatches may be issued.
    Ready,
    /// Teardown requested or forced by a fatal device error.
    Closing,
    /// Terminal; every owned resource has been released.
    Closed,
}

/// A raw allocation from a memory pool, owned by the session that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    id: u64,
    ptr: u64,
    size: u64,
    pool: PoolHandle,
}

impl Buffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Device pointer to the start of the allocation.
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The memory pool this buffer was allocated from.
    pub fn pool(&self) -> PoolHandle {
        self.pool
    }
}

/// A loaded, frozen code object bound to the session's agent.
#[derive(Debug)]
pub struct ExecutableContext {
    pub(crate) handle: ExecHandle,
    artifact: PathBuf,
    frozen: bool,
}

impl ExecutableContext {
    /// Path the code object was actually read from (primary or fallback).
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// One device session: agent reference, owned queue, tracked allocations.
pub struct Session {
    id: String,
    runtime: Option<Runtime>,
    agent: AgentInfo,
    queue: Option<QueueHandle>,
    buffers: Vec<Buffer>,
    executables: Vec<ExecutableContext>,
    next_buffer_id: u64,
    state: SessionState,
    config: SessionConfig,
}

impl Session {
    /// Open a session against the first agent matching `predicate`.
    ///
    /// Construction sequence, each step fatal on failure:
    /// 1. take a clone of the initialized runtime handle (the `Runtime`
    ///    guard initialized the backend exactly once when it was built);
    /// 2. discover the target agent through the device directory;
    /// 3. create a queue of `config.queue_capacity` packets against it.
    ///
    /// A failure at any step releases whatever was acquired before it and
    /// surfaces as a single typed error.
    pub fn open(
        runtime: &Runtime,
        predicate: impl Fn(&AgentInfo) -> Scan,
        config: SessionConfig,
    ) -> Result<Session> {
        let started = Instant::now();
        let id = format!("fuzz-{}", Uuid::now_v7());
        let runtime = runtime.clone();

        let directory = DeviceDirectory::new(runtime.clone(), config.verbose);
        let agent = directory.find_device(predicate)?;

        let queue = runtime
            .backend()
            .queue_create(agent.handle, config.queue_capacity)
            .map_err(|e| FuzzError::QueueCreate {
                agent: agent.name.clone(),
                reason: e.to_string(),
            })?;

        let session = Session {
            id: id.clone(),
            runtime: Some(runtime),
            agent: agent.clone(),
            queue: Some(queue),
            buffers: Vec::new(),
            executables: Vec::new(),
            next_buffer_id: 1,
            state: SessionState::Ready,
            config,
        };

        metrics::SESSION_OPEN_DURATION.observe(started.elapsed().as_secs_f64());
        info!(session = %id, agent = %agent.name, "session ready");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SessionState::Ready)
    }

    /// The agent this session is bound to. The session references the agent,
    /// it does not own it.
    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    /// The owned queue, `None` once teardown has destroyed it.
    pub fn queue(&self) -> Option<QueueHandle> {
        self.queue
    }

    /// Buffers currently tracked by this session, in allocation order.
    pub fn tracked_buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// The loaded executable context named by `id`.
    pub fn executable(&self, id: ArtifactId) -> Result<&ExecutableContext> {
        self.executables
            .get(id.index())
            .ok_or(FuzzError::UnknownArtifact(id.index()))
    }

    /// Allocate `size` bytes from the agent's first global-segment pool and
    /// track the buffer for release at teardown.
    ///
    /// On failure nothing is tracked; the session stays usable.
    pub fn allocate(&mut self, size: u64) -> Result<Buffer> {
        self.ensure_ready()?;
        let runtime = self.runtime_handle()?;
        let directory = DeviceDirectory::new(runtime.clone(), self.config.verbose);
        let pool = directory.find_memory_pool(&self.agent, predicates::global_segment)?;
        let ptr = runtime
            .backend()
            .pool_allocate(pool.handle, size)
            .map_err(|e| {
                metrics::ALLOCATION_FAILURES.inc();
                FuzzError::Allocation {
                    size,
                    reason: e.to_string(),
                }
            })?;

        let buffer = Buffer {
            id: self.next_buffer_id,
            ptr,
            size,
            pool: pool.handle,
        };
        self.next_buffer_id += 1;
        self.buffers.push(buffer);
        metrics::TRACKED_BUFFERS.inc();
        Ok(buffer)
    }

    /// Release `buffer` ahead of teardown and stop tracking it.
    pub fn free(&mut self, buffer: Buffer) -> Result<()> {
        self.ensure_ready()?;
        let position = self
            .buffers
            .iter()
            .position(|b| b.id == buffer.id)
            .ok_or(FuzzError::UntrackedBuffer(buffer.id))?;
        let runtime = self.runtime_handle()?;
        runtime.backend().pool_free(buffer.ptr)?;
        self.buffers.remove(position);
        metrics::TRACKED_BUFFERS.dec();
        Ok(())
    }

    /// Tear the session down in reverse acquisition order: tracked buffers,
    /// loaded executables, the queue, then this session's runtime handle.
    ///
    /// Safe to call more than once; only the first call has effect. Must not
    /// be called while dispatches referencing tracked buffers are still
    /// outstanding - wait on their handles first.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(runtime) = self.runtime.take() {
            let released = self.buffers.len();
            for buffer in self.buffers.drain(..) {
                if let Err(e) = runtime.backend().pool_free(buffer.ptr) {
                    warn!(session = %self.id, buffer = buffer.id, error = %e, "buffer release failed");
                }
            }
            metrics::TRACKED_BUFFERS.sub(released as i64);

            for exec in self.executables.drain(..) {
                if let Err(e) = runtime.backend().executable_destroy(exec.handle) {
                    warn!(session = %self.id, artifact = %exec.artifact.display(), error = %e, "executable destroy failed");
                }
            }

            if let Some(queue) = self.queue.take() {
                if let Err(e) = runtime.backend().queue_destroy(queue) {
                    warn!(session = %self.id, error = %e, "queue destroy failed");
                }
            }
            // Dropping the handle here lets the last owner shut the runtime
            // down after every queue is gone.
            drop(runtime);
        }

        self.state = SessionState::Closed;
        info!(session = %self.id, "session closed");
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(FuzzError::SessionClosed)
        }
    }

    pub(crate) fn runtime_handle(&self) -> Result<Runtime> {
        self.runtime.clone().ok_or(FuzzError::SessionClosed)
    }

    pub(crate) fn verbose(&self) -> bool {
        self.config.verbose
    }

    pub(crate) fn track_executable(&mut self, handle: ExecHandle, artifact: PathBuf) -> ArtifactId {
        self.executables.push(ExecutableContext {
            handle,
            artifact,
            frozen: true,
        });
        ArtifactId::new(self.executables.len() - 1)
    }

    /// Force the session into `Closing` after a fatal device error. Further
    /// operations fail with `SessionClosed` until `close()` finishes the
    /// teardown.
    pub(crate) fn mark_fatal(&mut self) {
        if !matches!(self.state, SessionState::Closed) {
            self.state = SessionState::Closing;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("agent", &self.agent.name)
            .field("state", &self.state)
            .field("queue", &self.queue)
            .field("tracked_buffers", &self.buffers.len())
            .field("executables", &self.executables.len())
            .finish()
    }
}
