//! Dynamic loading of the vendor HSA runtime.
//!
//! Uses `libloading` to load `libhsa-runtime64.so.1` and resolves the raw
//! runtime entry points into a table of typed function pointers once, at
//! backend construction. Handle-carrying HSA structs (`hsa_agent_t`,
//! `hsa_signal_t`, ...) are single-`u64` wrappers with identical ABI, so the
//! signatures below pass the bare `u64`.

use std::ffi::{c_char, c_int, c_void};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use libloading::Library;
use tracing::warn;

use crate::error::{FuzzError, Result};

use super::{
    AgentHandle, AgentInfo, DeviceClass, DeviceRuntime, DispatchPacket, ExecHandle, PoolHandle,
    PoolInfo, QueueHandle, ReaderHandle, Scan, SegmentClass, SignalHandle, SymbolInfo,
    WaitOutcome,
};

const SONAME: &str = "libhsa-runtime64.so.1";

const HSA_STATUS_SUCCESS: c_int = 0;
const HSA_STATUS_INFO_BREAK: c_int = 0x1;

const HSA_AGENT_INFO_NAME: c_int = 0;
const HSA_AGENT_INFO_DEVICE: c_int = 17;
const HSA_DEVICE_TYPE_GPU: c_int = 1;

const HSA_AMD_MEMORY_POOL_INFO_SEGMENT: c_int = 0;
const HSA_AMD_MEMORY_POOL_INFO_SIZE: c_int = 2;
const HSA_AMD_SEGMENT_GLOBAL: u32 = 0;
const HSA_AMD_SEGMENT_READONLY: u32 = 1;
const HSA_AMD_SEGMENT_PRIVATE: u32 = 2;

const HSA_QUEUE_TYPE_MULTI: c_int = 0;
const HSA_PROFILE_FULL: c_int = 1;
const HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT: c_int = 0;

const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT: c_int = 21;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE: c_int = 22;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_ALIGNMENT: c_int = 23;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE: c_int = 24;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE: c_int = 25;

const HSA_SIGNAL_CONDITION_LT: c_int = 2;
const HSA_WAIT_STATE_BLOCKED: c_int = 0;

const HSA_PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;
const HSA_PACKET_HEADER_TYPE: u16 = 0;
const HSA_PACKET_HEADER_SCACQUIRE_FENCE_SCOPE: u16 = 9;
const HSA_PACKET_HEADER_SCRELEASE_FENCE_SCOPE: u16 = 11;
const HSA_FENCE_SCOPE_SYSTEM: u16 = 2;
const HSA_KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS: u16 = 0;

/// In-memory queue structure returned by `hsa_queue_create`.
#[repr(C)]
struct HsaQueue {
    queue_type: u32,
    features: u32,
    base_address: *mut c_void,
    doorbell_signal: u64,
    size: u32,
    reserved1: u32,
    id: u64,
}

/// 64-byte AQL kernel dispatch packet.
#[repr(C)]
struct HsaKernelDispatchPacket {
    header: u16,
    setup: u16,
    workgroup_size_x: u16,
    workgroup_size_y: u16,
    workgroup_size_z: u16,
    reserved0: u16,
    grid_size_x: u32,
    grid_size_y: u32,
    grid_size_z: u32,
    private_segment_size: u32,
    group_segment_size: u32,
    kernel_object: u64,
    kernarg_address: *mut c_void,
    reserved2: u64,
    completion_signal: u64,
}

type IterCallback = unsafe extern "C" fn(u64, *mut c_void) -> c_int;

type FnHsaInit = unsafe extern "C" fn() -> c_int;
type FnHsaShutDown = unsafe extern "C" fn() -> c_int;
type FnHsaIterateAgents = unsafe extern "C" fn(IterCallback, *mut c_void) -> c_int;
type FnHsaAgentGetInfo = unsafe extern "C" fn(u64, c_int, *mut c_void) -> c_int;
type FnHsaAgentIteratePools = unsafe extern "C" fn(u64, IterCallback, *mut c_void) -> c_int;
type FnHsaPoolGetInfo = unsafe extern "C" fn(u64, c_int, *mut c_void) -> c_int;
type FnHsaPoolAllocate = unsafe extern "C" fn(u64, usize, u32, *mut *mut c_void) -> c_int;
type FnHsaPoolFree = unsafe extern "C" fn(*mut c_void) -> c_int;
type FnHsaQueueCreate = unsafe extern "C" fn(
    u64,
    u32,
    c_int,
    Option<unsafe extern "C" fn(c_int, *mut HsaQueue, *mut c_void)>,
    *mut c_void,
    u32,
    u32,
    *mut *mut HsaQueue,
) -> c_int;
type FnHsaQueueDestroy = unsafe extern "C" fn(*mut HsaQueue) -> c_int;
type FnHsaQueueAddWriteIndex = unsafe extern "C" fn(*mut HsaQueue, u64) -> u64;
type FnHsaQueueLoadReadIndex = unsafe extern "C" fn(*mut HsaQueue) -> u64;
type FnHsaReaderCreateFromFile = unsafe extern "C" fn(c_int, *mut u64) -> c_int;
type FnHsaReaderDestroy = unsafe extern "C" fn(u64) -> c_int;
type FnHsaExecutableCreateAlt =
    unsafe extern "C" fn(c_int, c_int, *const c_char, *mut u64) -> c_int;
type FnHsaExecutableLoad =
    unsafe extern "C" fn(u64, u64, u64, *const c_char, *mut u64) -> c_int;
type FnHsaExecutableFreeze = unsafe extern "C" fn(u64, *const c_char) -> c_int;
type FnHsaExecutableDestroy = unsafe extern "C" fn(u64) -> c_int;
type FnHsaExecutableGetSymbolByName =
    unsafe extern "C" fn(u64, *const c_char, *const u64, *mut u64) -> c_int;
type FnHsaSymbolGetInfo = unsafe extern "C" fn(u64, c_int, *mut c_void) -> c_int;
type FnHsaSignalCreate = unsafe extern "C" fn(i64, u32, *const u64, *mut u64) -> c_int;
type FnHsaSignalDestroy = unsafe extern "C" fn(u64) -> c_int;
type FnHsaSignalWaitScacquire = unsafe extern "C" fn(u64, c_int, i64, u64, c_int) -> i64;
type FnHsaSignalStoreScrelease = unsafe extern "C" fn(u64, i64);
type FnHsaStatusString = unsafe extern "C" fn(c_int, *mut *const c_char) -> c_int;

/// Resolved HSA entry points.
struct Api {
    init: FnHsaInit,
    shut_down: FnHsaShutDown,
    iterate_agents: FnHsaIterateAgents,
    agent_get_info: FnHsaAgentGetInfo,
    agent_iterate_pools: FnHsaAgentIteratePools,
    pool_get_info: FnHsaPoolGetInfo,
    pool_allocate: FnHsaPoolAllocate,
    pool_free: FnHsaPoolFree,
    queue_create: FnHsaQueueCreate,
    queue_destroy: FnHsaQueueDestroy,
    queue_add_write_index: FnHsaQueueAddWriteIndex,
    queue_load_read_index: FnHsaQueueLoadReadIndex,
    reader_create_from_file: FnHsaReaderCreateFromFile,
    reader_destroy: FnHsaReaderDestroy,
    executable_create_alt: FnHsaExecutableCreateAlt,
    executable_load: FnHsaExecutableLoad,
    executable_freeze: FnHsaExecutableFreeze,
    executable_destroy: FnHsaExecutableDestroy,
    executable_get_symbol_by_name: FnHsaExecutableGetSymbolByName,
    symbol_get_info: FnHsaSymbolGetInfo,
    signal_create: FnHsaSignalCreate,
    signal_destroy: FnHsaSignalDestroy,
    signal_wait_scacquire: FnHsaSignalWaitScacquire,
    signal_store_screlease: FnHsaSignalStoreScrelease,
    status_string: FnHsaStatusString,
}

unsafe fn sym<T: Copy>(lib: &Library, name: &[u8]) -> Result<T> {
    lib.get::<T>(name)
        .map(|s| *s)
        .map_err(|e| FuzzError::RuntimeUnavailable(e.to_string()))
}

impl Api {
    unsafe fn resolve(lib: &Library) -> Result<Self> {
        Ok(Self {
            init: sym(lib, b"hsa_init\0")?,
            shut_down: sym(lib, b"hsa_shut_down\0")?,
            iterate_agents: sym(lib, b"hsa_iterate_agents\0")?,
            agent_get_info: sym(lib, b"hsa_agent_get_info\0")?,
            agent_iterate_pools: sym(lib, b"hsa_amd_agent_iterate_memory_pools\0")?,
            pool_get_info: sym(lib, b"hsa_amd_memory_pool_get_info\0")?,
            pool_allocate: sym(lib, b"hsa_amd_memory_pool_allocate\0")?,
            pool_free: sym(lib, b"hsa_amd_memory_pool_free\0")?,
            queue_create: sym(lib, b"hsa_queue_create\0")?,
            queue_destroy: sym(lib, b"hsa_queue_destroy\0")?,
            queue_add_write_index: sym(lib, b"hsa_queue_add_write_index_screlease\0")?,
            queue_load_read_index: sym(lib, b"hsa_queue_load_read_index_scacquire\0")?,
            reader_create_from_file: sym(lib, b"hsa_code_object_reader_create_from_file\0")?,
            reader_destroy: sym(lib, b"hsa_code_object_reader_destroy\0")?,
            executable_create_alt: sym(lib, b"hsa_executable_create_alt\0")?,
            executable_load: sym(lib, b"hsa_executable_load_agent_code_object\0")?,
            executable_freeze: sym(lib, b"hsa_executable_freeze\0")?,
            executable_destroy: sym(lib, b"hsa_executable_destroy\0")?,
            executable_get_symbol_by_name: sym(lib, b"hsa_executable_get_symbol_by_name\0")?,
            symbol_get_info: sym(lib, b"hsa_executable_symbol_get_info\0")?,
            signal_create: sym(lib, b"hsa_signal_create\0")?,
            signal_destroy: sym(lib, b"hsa_signal_destroy\0")?,
            signal_wait_scacquire: sym(lib, b"hsa_signal_wait_scacquire\0")?,
            signal_store_screlease: sym(lib, b"hsa_signal_store_screlease\0")?,
            status_string: sym(lib, b"hsa_status_string\0")?,
        })
    }
}

/// HSA backend over the dynamically loaded vendor runtime.
pub struct HsaRuntime {
    _lib: Library,
    api: Api,
}

// The HSA runtime is documented thread-safe; the raw pointers in the table
// are immutable once resolved.
unsafe impl Send for HsaRuntime {}
unsafe impl Sync for HsaRuntime {}

impl HsaRuntime {
    /// Load the vendor runtime library and resolve the entry points.
    /// Does not initialize the runtime; that happens through
    /// [`DeviceRuntime::init`].
    pub fn load() -> Result<Self> {
        let lib = unsafe { Library::new(SONAME) }
            .map_err(|e| FuzzError::RuntimeUnavailable(format!("{SONAME}: {e}")))?;
        let api = unsafe { Api::resolve(&lib) }?;
        Ok(Self { _lib: lib, api })
    }

    /// Whether the vendor runtime library can be located at all.
    pub fn available() -> bool {
        unsafe { Library::new(SONAME).is_ok() }
    }

    fn describe_status(&self, status: c_int) -> String {
        let mut msg: *const c_char = std::ptr::null();
        let rc = unsafe { (self.api.status_string)(status, &mut msg) };
        if rc == HSA_STATUS_SUCCESS && !msg.is_null() {
            unsafe { std::ffi::CStr::from_ptr(msg) }
                .to_string_lossy()
                .into_owned()
        } else {
            format!("status {status}")
        }
    }

    fn check(&self, call: &'static str, status: c_int) -> Result<()> {
        if status == HSA_STATUS_SUCCESS {
            Ok(())
        } else {
            Err(FuzzError::Api {
                call,
                reason: self.describe_status(status),
            })
        }
    }

    fn agent_name(&self, agent: u64) -> Result<String> {
        let mut buf = [0u8; 64];
        let status = unsafe {
            (self.api.agent_get_info)(agent, HSA_AGENT_INFO_NAME, buf.as_mut_ptr() as *mut c_void)
        };
        self.check("hsa_agent_get_info", status)?;
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }
}

/// Context threaded through the C enumeration trampolines.
struct IterCtx<'a, T> {
    runtime: &'a HsaRuntime,
    visit: &'a mut dyn FnMut(&T) -> Scan,
    error: Option<FuzzError>,
}

unsafe extern "C" fn agent_trampoline(agent: u64, data: *mut c_void) -> c_int {
    let ctx = &mut *(data as *mut IterCtx<'_, AgentInfo>);

    let mut device_type: c_int = 0;
    let status = (ctx.runtime.api.agent_get_info)(
        agent,
        HSA_AGENT_INFO_DEVICE,
        &mut device_type as *mut c_int as *mut c_void,
    );
    if status != HSA_STATUS_SUCCESS {
        ctx.error = Some(FuzzError::Api {
            call: "hsa_agent_get_info",
            reason: ctx.runtime.describe_status(status),
        });
        return HSA_STATUS_INFO_BREAK;
    }
    let name = match ctx.runtime.agent_name(agent) {
        Ok(name) => name,
        Err(e) => {
            ctx.error = Some(e);
            return HSA_STATUS_INFO_BREAK;
        }
    };
    let info = AgentInfo {
        handle: AgentHandle(agent),
        name,
        class: if device_type == HSA_DEVICE_TYPE_GPU {
            DeviceClass::Accelerator
        } else {
            DeviceClass::Host
        },
    };
    match (ctx.visit)(&info) {
        Scan::Next => HSA_STATUS_SUCCESS,
        _ => HSA_STATUS_INFO_BREAK,
    }
}

unsafe extern "C" fn pool_trampoline(pool: u64, data: *mut c_void) -> c_int {
    let ctx = &mut *(data as *mut IterCtx<'_, PoolInfo>);

    let mut segment: u32 = 0;
    let status = (ctx.runtime.api.pool_get_info)(
        pool,
        HSA_AMD_MEMORY_POOL_INFO_SEGMENT,
        &mut segment as *mut u32 as *mut c_void,
    );
    if status != HSA_STATUS_SUCCESS {
        ctx.error = Some(FuzzError::Api {
            call: "hsa_amd_memory_pool_get_info",
            reason: ctx.runtime.describe_status(status),
        });
        return HSA_STATUS_INFO_BREAK;
    }
    let mut capacity: usize = 0;
    let status = (ctx.runtime.api.pool_get_info)(
        pool,
        HSA_AMD_MEMORY_POOL_INFO_SIZE,
        &mut capacity as *mut usize as *mut c_void,
    );
    if status != HSA_STATUS_SUCCESS {
        ctx.error = Some(FuzzError::Api {
            call: "hsa_amd_memory_pool_get_info",
            reason: ctx.runtime.describe_status(status),
        });
        return HSA_STATUS_INFO_BREAK;
    }
    let info = PoolInfo {
        handle: PoolHandle(pool),
        segment: match segment {
            HSA_AMD_SEGMENT_GLOBAL => SegmentClass::Global,
            HSA_AMD_SEGMENT_READONLY => SegmentClass::ReadOnly,
            HSA_AMD_SEGMENT_PRIVATE => SegmentClass::Private,
            _ => SegmentClass::Group,
        },
        capacity: capacity as u64,
    };
    match (ctx.visit)(&info) {
        Scan::Next => HSA_STATUS_SUCCESS,
        _ => HSA_STATUS_INFO_BREAK,
    }
}

impl DeviceRuntime for HsaRuntime {
    fn init(&self) -> Result<()> {
        let status = unsafe { (self.api.init)() };
        if status == HSA_STATUS_SUCCESS {
            Ok(())
        } else {
            Err(FuzzError::RuntimeInit(self.describe_status(status)))
        }
    }

    fn shutdown(&self) {
        let status = unsafe { (self.api.shut_down)() };
        if status != HSA_STATUS_SUCCESS {
            warn!(
                reason = %self.describe_status(status),
                "hsa_shut_down reported failure"
            );
        }
    }

    fn for_each_agent(&self, visit: &mut dyn FnMut(&AgentInfo) -> Scan) -> Result<()> {
        let mut ctx = IterCtx::<AgentInfo> {
            runtime: self,
            visit,
            error: None,
        };
        let status = unsafe {
            (self.api.iterate_agents)(
                agent_trampoline,
                &mut ctx as *mut IterCtx<'_, AgentInfo> as *mut c_void,
            )
        };
        if let Some(e) = ctx.error {
            return Err(e);
        }
        // INFO_BREAK is the trampoline's own early-exit, not a failure.
        if status == HSA_STATUS_INFO_BREAK {
            return Ok(());
        }
        self.check("hsa_iterate_agents", status)
    }

    fn for_each_pool(
        &self,
        agent: AgentHandle,
        visit: &mut dyn FnMut(&PoolInfo) -> Scan,
    ) -> Result<()> {
        let mut ctx = IterCtx::<PoolInfo> {
            runtime: self,
            visit,
            error: None,
        };
        let status = unsafe {
            (self.api.agent_iterate_pools)(
                agent.0,
                pool_trampoline,
                &mut ctx as *mut IterCtx<'_, PoolInfo> as *mut c_void,
            )
        };
        if let Some(e) = ctx.error {
            return Err(e);
        }
        if status == HSA_STATUS_INFO_BREAK {
            return Ok(());
        }
        self.check("hsa_amd_agent_iterate_memory_pools", status)
    }

    fn queue_create(&self, agent: AgentHandle, capacity: u32) -> Result<QueueHandle> {
        let mut queue: *mut HsaQueue = std::ptr::null_mut();
        let status = unsafe {
            (self.api.queue_create)(
                agent.0,
                capacity,
                HSA_QUEUE_TYPE_MULTI,
                None,
                std::ptr::null_mut(),
                u32::MAX,
                u32::MAX,
                &mut queue,
            )
        };
        self.check("hsa_queue_create", status)?;
        Ok(QueueHandle(queue as u64))
    }

    fn queue_destroy(&self, queue: QueueHandle) -> Result<()> {
        let status = unsafe { (self.api.queue_destroy)(queue.0 as *mut HsaQueue) };
        self.check("hsa_queue_destroy", status)
    }

    fn pool_allocate(&self, pool: PoolHandle, size: u64) -> Result<u64> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let status =
            unsafe { (self.api.pool_allocate)(pool.0, size as usize, 0, &mut ptr) };
        self.check("hsa_amd_memory_pool_allocate", status)?;
        Ok(ptr as u64)
    }

    fn pool_free(&self, ptr: u64) -> Result<()> {
        let status = unsafe { (self.api.pool_free)(ptr as *mut c_void) };
        self.check("hsa_amd_memory_pool_free", status)
    }

    fn buffer_write(&self, ptr: u64, bytes: &[u8]) -> Result<()> {
        // Global-segment pools on APU/full-profile systems are host
        // accessible; the fuzzer only writes kernargs through this path.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn reader_from_file(&self, file: &File) -> Result<ReaderHandle> {
        let fd: libc::c_int = file.as_raw_fd();
        let mut reader: u64 = 0;
        let status = unsafe { (self.api.reader_create_from_file)(fd, &mut reader) };
        self.check("hsa_code_object_reader_create_from_file", status)?;
        Ok(ReaderHandle(reader))
    }

    fn reader_destroy(&self, reader: ReaderHandle) -> Result<()> {
        let status = unsafe { (self.api.reader_destroy)(reader.0) };
        self.check("hsa_code_object_reader_destroy", status)
    }

    fn executable_create(&self) -> Result<ExecHandle> {
        let mut exec: u64 = 0;
        let status = unsafe {
            (self.api.executable_create_alt)(
                HSA_PROFILE_FULL,
                HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT,
                std::ptr::null(),
                &mut exec,
            )
        };
        self.check("hsa_executable_create_alt", status)?;
        Ok(ExecHandle(exec))
    }

    fn executable_load(
        &self,
        exec: ExecHandle,
        agent: AgentHandle,
        reader: ReaderHandle,
    ) -> Result<()> {
        let status = unsafe {
            (self.api.executable_load)(exec.0, agent.0, reader.0, std::ptr::null(), std::ptr::null_mut())
        };
        self.check("hsa_executable_load_agent_code_object", status)
    }

    fn executable_freeze(&self, exec: ExecHandle) -> Result<()> {
        let status = unsafe { (self.api.executable_freeze)(exec.0, std::ptr::null()) };
        self.check("hsa_executable_freeze", status)
    }

    fn executable_destroy(&self, exec: ExecHandle) -> Result<()> {
        let status = unsafe { (self.api.executable_destroy)(exec.0) };
        self.check("hsa_executable_destroy", status)
    }

    fn symbol_resolve(
        &self,
        exec: ExecHandle,
        agent: AgentHandle,
        name: &str,
    ) -> Result<SymbolInfo> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| FuzzError::SymbolNotFound { name: name.to_string() })?;
        let mut symbol: u64 = 0;
        let agent_ref: u64 = agent.0;
        let status = unsafe {
            (self.api.executable_get_symbol_by_name)(
                exec.0,
                c_name.as_ptr(),
                &agent_ref,
                &mut symbol,
            )
        };
        if status != HSA_STATUS_SUCCESS {
            return Err(FuzzError::SymbolNotFound {
                name: name.to_string(),
            });
        }

        let mut info = SymbolInfo {
            kernel_object: 0,
            group_segment_size: 0,
            private_segment_size: 0,
            kernarg_segment_size: 0,
            kernarg_alignment: 0,
        };
        let queries: [(c_int, *mut c_void); 5] = [
            (
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT,
                &mut info.kernel_object as *mut u64 as *mut c_void,
            ),
            (
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE,
                &mut info.group_segment_size as *mut u32 as *mut c_void,
            ),
            (
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE,
                &mut info.private_segment_size as *mut u32 as *mut c_void,
            ),
            (
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE,
                &mut info.kernarg_segment_size as *mut u32 as *mut c_void,
            ),
            (
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_ALIGNMENT,
                &mut info.kernarg_alignment as *mut u32 as *mut c_void,
            ),
        ];
        for (attribute, out) in queries {
            let status = unsafe { (self.api.symbol_get_info)(symbol, attribute, out) };
            self.check("hsa_executable_symbol_get_info", status)?;
        }
        Ok(info)
    }

    fn signal_create(&self) -> Result<SignalHandle> {
        let mut signal: u64 = 0;
        let status =
            unsafe { (self.api.signal_create)(1, 0, std::ptr::null(), &mut signal) };
        self.check("hsa_signal_create", status)?;
        Ok(SignalHandle(signal))
    }

    fn signal_destroy(&self, signal: SignalHandle) -> Result<()> {
        let status = unsafe { (self.api.signal_destroy)(signal.0) };
        self.check("hsa_signal_destroy", status)
    }

    fn signal_wait(&self, signal: SignalHandle, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // The runtime's timeout hint is a lower-bound in timestamp ticks;
            // nanoseconds over-estimate it, so the deadline check below is
            // what actually bounds the wait.
            let hint = remaining.as_nanos().min(u128::from(u64::MAX)) as u64;
            let observed = unsafe {
                (self.api.signal_wait_scacquire)(
                    signal.0,
                    HSA_SIGNAL_CONDITION_LT,
                    1,
                    hint,
                    HSA_WAIT_STATE_BLOCKED,
                )
            };
            if observed < 1 {
                return Ok(WaitOutcome::Completed);
            }
            if Instant::now() >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    fn submit(&self, queue: QueueHandle, packet: &DispatchPacket) -> Result<()> {
        let q = queue.0 as *mut HsaQueue;
        if q.is_null() {
            return Err(FuzzError::Submission("null queue handle".to_string()));
        }
        unsafe {
            let size = (*q).size as u64;
            let write_index = (self.api.queue_add_write_index)(q, 1);
            // FIFO ring: wait for a free slot if the queue is full.
            while write_index.wrapping_sub((self.api.queue_load_read_index)(q)) >= size {
                std::hint::spin_loop();
            }

            let slot = ((*q).base_address as *mut HsaKernelDispatchPacket)
                .add((write_index & (size - 1)) as usize);

            let dims: u16 = if packet.grid[2] > 1 {
                3
            } else if packet.grid[1] > 1 {
                2
            } else {
                1
            };
            (*slot).setup = dims << HSA_KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS;
            (*slot).workgroup_size_x = packet.workgroup[0];
            (*slot).workgroup_size_y = packet.workgroup[1];
            (*slot).workgroup_size_z = packet.workgroup[2];
            (*slot).reserved0 = 0;
            (*slot).grid_size_x = packet.grid[0];
            (*slot).grid_size_y = packet.grid[1];
            (*slot).grid_size_z = packet.grid[2];
            (*slot).private_segment_size = packet.private_segment_size;
            (*slot).group_segment_size = packet.group_segment_size;
            (*slot).kernel_object = packet.kernel_object;
            (*slot).kernarg_address = packet.kernarg_address as *mut c_void;
            (*slot).reserved2 = 0;
            (*slot).completion_signal = packet.completion.0;

            // Header is published last so the packet processor never sees a
            // partially written packet.
            let header: u16 = (HSA_PACKET_TYPE_KERNEL_DISPATCH << HSA_PACKET_HEADER_TYPE)
                | (HSA_FENCE_SCOPE_SYSTEM << HSA_PACKET_HEADER_SCACQUIRE_FENCE_SCOPE)
                | (HSA_FENCE_SCOPE_SYSTEM << HSA_PACKET_HEADER_SCRELEASE_FENCE_SCOPE);
            fence(Ordering::Release);
            std::ptr::write_volatile(&mut (*slot).header, header);

            (self.api.signal_store_screlease)((*q).doorbell_signal, write_index as i64);
        }
        Ok(())
    }
}
