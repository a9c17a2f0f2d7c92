//! Dispatcher - packages kernel arguments and submits dispatch packets
//!
//! `execute` packs the caller's arguments into a kernarg buffer sized and
//! aligned per the resolved symbol's metadata, allocates that buffer through
//! the session (so it is tracked and released at teardown), builds a
//! backend-neutral dispatch packet and submits it. Submission never blocks;
//! the returned [`DispatchHandle`] carries the completion signal and its
//! `wait` is the only blocking point, always bounded by a timeout.
//!
//! Packaging failures are reportable and submit nothing. Submission failures
//! are session-fatal: the queue state after a bad submission cannot be
//! trusted, so the session is forced into `Closing`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{FuzzError, Result};
use crate::metrics;
use crate::runtime::{DispatchPacket, Runtime, SignalHandle, WaitOutcome};
use crate::session::{Buffer, KernelSymbol, Session};

/// Grid and workgroup dimensions for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchDims {
    pub grid: [u32; 3],
    pub workgroup: [u16; 3],
}

impl Default for LaunchDims {
    fn default() -> Self {
        Self {
            grid: [64, 1, 1],
            workgroup: [64, 1, 1],
        }
    }
}

impl LaunchDims {
    /// A 1-D launch of `elements` work items in workgroups of 64.
    pub fn linear(elements: u32) -> Self {
        Self {
            grid: [elements.max(1), 1, 1],
            workgroup: [64, 1, 1],
        }
    }
}

/// One kernel argument value.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg {
    /// Device pointer (e.g. a tracked buffer's address).
    Ptr(u64),
    U32(u32),
    I32(i32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl KernelArg {
    /// Device-pointer argument referencing a session buffer.
    pub fn buffer(buffer: &Buffer) -> Self {
        KernelArg::Ptr(buffer.device_ptr())
    }

    fn size(&self) -> usize {
        match self {
            KernelArg::Ptr(_) | KernelArg::U64(_) | KernelArg::F64(_) => 8,
            KernelArg::U32(_) | KernelArg::I32(_) | KernelArg::F32(_) => 4,
        }
    }

    /// Natural alignment equals size for every supported scalar.
    fn align(&self) -> usize {
        self.size()
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            KernelArg::Ptr(v) | KernelArg::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// Pack `args` into a kernarg image of exactly `segment_size` bytes,
/// respecting each argument's natural alignment.
fn pack_kernargs(args: &[KernelArg], segment_size: u32, alignment: u32) -> Result<Vec<u8>> {
    if alignment != 0 && !alignment.is_power_of_two() {
        return Err(FuzzError::KernargLayout(format!(
            "kernarg alignment {alignment} is not a power of two"
        )));
    }

    let mut image = Vec::with_capacity(segment_size as usize);
    for arg in args {
        let align = arg.align();
        let padded = image.len().next_multiple_of(align);
        image.resize(padded, 0);
        arg.write(&mut image);
    }

    if image.len() > segment_size as usize {
        return Err(FuzzError::KernargLayout(format!(
            "packed {} bytes exceed kernarg segment of {} bytes",
            image.len(),
            segment_size
        )));
    }
    image.resize(segment_size as usize, 0);
    Ok(image)
}

/// Completion handle for one submitted dispatch.
///
/// Holds the completion signal and a runtime reference so the signal can be
/// waited on and destroyed independently of the session's own lifetime. The
/// kernarg buffer referenced by the dispatch stays tracked by the session
/// and must not be freed until this handle resolves.
pub struct DispatchHandle {
    runtime: Runtime,
    signal: SignalHandle,
    kernarg: Buffer,
    kernel: String,
}

impl DispatchHandle {
    /// Block until the dispatch completes or `timeout` elapses.
    ///
    /// `Duration::ZERO` polls once. On [`FuzzError::Timeout`] the dispatch
    /// may still complete later; callers must keep referenced buffers alive
    /// and wait again.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        match self.runtime.backend().signal_wait(self.signal, timeout)? {
            WaitOutcome::Completed => Ok(()),
            WaitOutcome::TimedOut => Err(FuzzError::Timeout(timeout)),
        }
    }

    /// The tracked buffer holding this dispatch's packed arguments.
    pub fn kernarg_buffer(&self) -> Buffer {
        self.kernarg
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.backend().signal_destroy(self.signal) {
            warn!(kernel = %self.kernel, error = %e, "completion signal destroy failed");
        }
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("kernel", &self.kernel)
            .field("signal", &self.signal)
            .field("kernarg", &self.kernarg.id())
            .finish()
    }
}

/// Issues kernel execution requests against a session's queue.
#[derive(Debug, Default)]
pub struct Dispatcher;

impl Dispatcher {
    /// Package `args` and submit one dispatch of `symbol`.
    ///
    /// The kernarg buffer is allocated through the session and remains
    /// tracked until teardown or an explicit free after completion.
    pub fn execute(
        &self,
        session: &mut Session,
        symbol: &KernelSymbol,
        args: &[KernelArg],
        dims: LaunchDims,
    ) -> Result<DispatchHandle> {
        session.ensure_ready()?;

        // Packaging failures are reportable; nothing has been submitted.
        let image = pack_kernargs(args, symbol.kernarg_segment_size, symbol.kernarg_alignment)?;

        let kernarg = session.allocate(symbol.kernarg_segment_size.max(1) as u64)?;
        let runtime = session.runtime_handle()?;
        runtime.backend().buffer_write(kernarg.device_ptr(), &image)?;

        let signal = runtime.backend().signal_create()?;
        let queue = match session.queue() {
            Some(queue) => queue,
            None => {
                let _ = runtime.backend().signal_destroy(signal);
                return Err(FuzzError::SessionClosed);
            }
        };

        let packet = DispatchPacket {
            workgroup: dims.workgroup,
            grid: dims.grid,
            kernel_object: symbol.kernel_object,
            kernarg_address: kernarg.device_ptr(),
            group_segment_size: symbol.group_segment_size,
            private_segment_size: symbol.private_segment_size,
            completion: signal,
        };

        match runtime.backend().submit(queue, &packet) {
            Ok(()) => {
                metrics::DISPATCHES_SUBMITTED.inc();
                debug!(
                    session = %session.id(),
                    kernel = %symbol.name,
                    grid = ?dims.grid,
                    "dispatch submitted"
                );
                Ok(DispatchHandle {
                    runtime,
                    signal,
                    kernarg,
                    kernel: symbol.name.clone(),
                })
            }
            Err(e) => {
                metrics::DISPATCH_FAILURES.inc();
                let _ = runtime.backend().signal_destroy(signal);
                // The queue cannot be trusted after a failed submission.
                session.mark_fatal();
                Err(FuzzError::Submission(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_respects_alignment() {
        // u32 then u64: the u64 must start at offset 8, not 4.
        let image = pack_kernargs(&[KernelArg::U32(7), KernelArg::U64(9)], 16, 8).unwrap();
        assert_eq!(image.len(), 16);
        assert_eq!(&image[0..4], &7u32.to_le_bytes());
        assert_eq!(&image[4..8], &[0, 0, 0, 0]);
        assert_eq!(&image[8..16], &9u64.to_le_bytes());
    }

    #[test]
    fn test_pack_pads_to_segment_size() {
        let image = pack_kernargs(&[KernelArg::F32(1.5)], 32, 16).unwrap();
        assert_eq!(image.len(), 32);
        assert_eq!(&image[0..4], &1.5f32.to_le_bytes());
    }

    #[test]
    fn test_pack_rejects_oversized_layout() {
        let args = vec![KernelArg::U64(0); 9];
        let err = pack_kernargs(&args, 64, 16).unwrap_err();
        assert!(matches!(err, FuzzError::KernargLayout(_)));
    }

    #[test]
    fn test_pack_rejects_bad_alignment() {
        let err = pack_kernargs(&[KernelArg::U32(1)], 64, 24).unwrap_err();
        assert!(matches!(err, FuzzError::KernargLayout(_)));
    }

    #[test]
    fn test_linear_dims() {
        let dims = LaunchDims::linear(1024);
        assert_eq!(dims.grid, [1024, 1, 1]);
        assert_eq!(dims.workgroup, [64, 1, 1]);
    }
}
