//! hsafuzz - fuzz harness for an HSA-shaped GPU compute runtime
//!
//! This library drives the runtime's agent-discovery, command-queue,
//! memory-pool and code-object subsystems from a single controlling thread,
//! tracking every acquired resource so teardown is exact.
//!
//! # Modules
//!
//! - `runtime` - typed low-level runtime surface (vendor HSA or mock backend)
//! - `device` - agent and memory-pool discovery with first-match predicates
//! - `session` - session lifecycle, code loading, kernel dispatch
//! - `kernels` - kernel artifact provider (compile + cache)
//! - `config` - explicit fuzz-run configuration
//! - `metrics` - Prometheus metrics for observability
//! - `logging` - console tracing setup for the driver
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use hsafuzz::{
//!     CodeLoader, Dispatcher, KernelArg, LaunchDims, Runtime, Session, SessionConfig,
//! };
//! use hsafuzz::device::predicates;
//! use hsafuzz::runtime::hsa::HsaRuntime;
//!
//! # fn main() -> hsafuzz::Result<()> {
//! let runtime = Runtime::new(Box::new(HsaRuntime::load()?))?;
//! let mut session = Session::open(&runtime, predicates::accelerator, SessionConfig::default())?;
//!
//! let loader = CodeLoader::default();
//! let symbol = loader.load(&mut session, "vector_add.hsaco".as_ref(), "vector_add")?;
//!
//! let n = 1024u32;
//! let a = session.allocate(u64::from(n) * 4)?;
//! let b = session.allocate(u64::from(n) * 4)?;
//! let c = session.allocate(u64::from(n) * 4)?;
//!
//! let dispatch = Dispatcher::default().execute(
//!     &mut session,
//!     &symbol,
//!     &[
//!         KernelArg::buffer(&a),
//!         KernelArg::buffer(&b),
//!         KernelArg::buffer(&c),
//!         KernelArg::U32(n),
//!     ],
//!     LaunchDims::linear(n),
//! )?;
//! dispatch.wait(Duration::from_secs(5))?;
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod metrics;
pub mod runtime;
pub mod session;

// Re-export commonly used types at crate root for convenience
pub use config::{Backend, FuzzConfig, SessionConfig};
pub use error::{FuzzError, Result};
pub use kernels::KernelCatalog;
pub use runtime::{AgentInfo, DeviceClass, DeviceRuntime, PoolInfo, Runtime, Scan, SegmentClass};
pub use session::{
    ArtifactId, Buffer, CodeLoader, DispatchHandle, Dispatcher, KernelArg, KernelSymbol,
    LaunchDims, Session, SessionState,
};
