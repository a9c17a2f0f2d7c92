//! Fuzz-run driver
//!
//! Opens one session against the first accelerator, pulls kernels from the
//! artifact provider, and hammers the dispatch path with varying buffer
//! sizes. Non-fatal errors are logged and the run continues with the next
//! case; device-level failures abort the run with a nonzero exit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};

use hsafuzz::device::predicates;
use hsafuzz::runtime::hsa::HsaRuntime;
use hsafuzz::runtime::mock::MockRuntime;
use hsafuzz::{
    Backend, CodeLoader, DeviceRuntime, Dispatcher, FuzzConfig, FuzzError, KernelArg,
    KernelCatalog, LaunchDims, Result, Runtime, Session,
};

const CONFIG_PATH: &str = "hsafuzz.json";
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    hsafuzz::logging::init_logging("info,hsafuzz=debug");

    let config_path = Path::new(CONFIG_PATH);
    let config = if config_path.exists() {
        match FuzzConfig::load(config_path) {
            Ok(config) => {
                info!(path = CONFIG_PATH, "loaded fuzz configuration");
                config
            }
            Err(e) => {
                error!(path = CONFIG_PATH, error = %e, "bad fuzz configuration");
                std::process::exit(1);
            }
        }
    } else {
        FuzzConfig::default()
    };

    if let Err(e) = run(&config) {
        error!(error = %e, fatal = e.is_session_fatal(), "fuzz run aborted");
        std::process::exit(1);
    }
    info!("fuzz run complete");
}

fn run(config: &FuzzConfig) -> Result<()> {
    let (backend, is_mock): (Box<dyn DeviceRuntime>, bool) = match config.backend {
        Backend::Mock => (Box::new(MockRuntime::host_and_accelerator()), true),
        Backend::Hsa if HsaRuntime::available() => (Box::new(HsaRuntime::load()?), false),
        Backend::Hsa => {
            warn!("HSA runtime not found; falling back to the mock backend");
            (Box::new(MockRuntime::host_and_accelerator()), true)
        }
    };
    let runtime = Runtime::new(backend)?;
    let mut session = Session::open(&runtime, predicates::accelerator, config.session.clone())?;
    info!(session = %session.id(), agent = %session.agent().name, "fuzzing device");

    let catalog = KernelCatalog::new(&config.cache_dir)?;
    let loader = CodeLoader::default();
    let dispatcher = Dispatcher::default();
    let mut rng = XorShift::new(0x5eed_cafe);

    for kernel in &config.kernels {
        let artifact = match obtain_artifact(&catalog, kernel, is_mock) {
            Ok(path) => path,
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                warn!(kernel = %kernel, error = %e, "no artifact, skipping kernel");
                continue;
            }
        };

        let symbol = match loader.load(&mut session, &artifact, kernel) {
            Ok(symbol) => symbol,
            Err(e) if e.is_session_fatal() => {
                error!(agent = %session.agent().name, error = %e, "fatal device error while loading");
                return Err(e);
            }
            Err(e) => {
                warn!(kernel = %kernel, error = %e, "load failed, skipping kernel");
                continue;
            }
        };

        let mut inflight = Vec::new();
        for iteration in 0..config.iterations {
            let max_elements = (config.max_alloc_bytes / 4).max(1);
            let elements = (rng.next() % max_elements).max(1) as u32;
            let bytes = u64::from(elements) * 4;

            let submitted = session.allocate(bytes).and_then(|a| {
                let b = session.allocate(bytes)?;
                let c = session.allocate(bytes)?;
                dispatcher.execute(
                    &mut session,
                    &symbol,
                    &[
                        KernelArg::buffer(&a),
                        KernelArg::buffer(&b),
                        KernelArg::buffer(&c),
                        KernelArg::U32(elements),
                    ],
                    LaunchDims::linear(elements),
                )
            });
            match submitted {
                Ok(handle) => inflight.push(handle),
                Err(e) if e.is_session_fatal() => {
                    error!(agent = %session.agent().name, error = %e, "fatal device error during dispatch");
                    drop(inflight);
                    return Err(e);
                }
                Err(e) => warn!(kernel = %kernel, iteration, error = %e, "iteration failed"),
            }
        }

        for handle in &inflight {
            match handle.wait(COMPLETION_TIMEOUT) {
                Ok(()) => {}
                Err(FuzzError::Timeout(bound)) => {
                    warn!(kernel = %handle.kernel(), timeout = ?bound, "dispatch still pending")
                }
                Err(e) => warn!(kernel = %handle.kernel(), error = %e, "wait failed"),
            }
        }
        info!(kernel = %kernel, dispatched = inflight.len(), "kernel fuzz pass complete");
    }

    session.close();
    Ok(())
}

/// Real runs compile through the provider; mock runs materialize a symbol
/// list the mock reader understands, at the same cache location, so the
/// loader path is exercised identically.
fn obtain_artifact(catalog: &KernelCatalog, kernel: &str, is_mock: bool) -> Result<PathBuf> {
    if !is_mock {
        return catalog.compile(kernel);
    }
    if !hsafuzz::kernels::known_kernels().iter().any(|k| *k == kernel) {
        return Err(FuzzError::KernelNotFound(kernel.to_string()));
    }
    let path = catalog.artifact_path(kernel);
    if !path.exists() {
        std::fs::write(&path, format!("{kernel}\n"))?;
    }
    Ok(path)
}

/// Small deterministic generator for fuzzed sizes; reproducible run to run.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}
