//! Fuzz-run configuration
//!
//! All knobs are explicit values carried in these structs; core logic never
//! consults the process environment. The driver binary may load a
//! `FuzzConfig` from a JSON file, mirroring how the runtime's own control
//! planes take JSON payloads.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default command-queue capacity in packets.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 256;

/// Per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed queue capacity, set at creation.
    pub queue_capacity: u32,
    /// Log discovery details (agent names, pool capacities).
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            verbose: false,
        }
    }
}

/// Which device-runtime backend drives the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The vendor HSA runtime, loaded dynamically.
    Hsa,
    /// The in-process mock, for machines with no GPU.
    Mock,
}

/// Configuration for one fuzz run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzConfig {
    pub backend: Backend,
    /// Dispatches issued per kernel.
    pub iterations: u32,
    /// Kernel names to pull from the artifact provider.
    pub kernels: Vec<String>,
    /// Artifact cache directory, keyed by kernel name.
    pub cache_dir: PathBuf,
    /// Upper bound for fuzzed buffer sizes, in bytes.
    pub max_alloc_bytes: u64,
    pub session: SessionConfig,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Hsa,
            iterations: 16,
            kernels: vec!["vector_add".to_string()],
            cache_dir: PathBuf::from(".cache/hsafuzz"),
            max_alloc_bytes: 1024 * 1024,
            session: SessionConfig::default(),
        }
    }
}

impl FuzzConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.queue_capacity, 256);
        assert!(!config.verbose);
    }

    #[test]
    fn test_fuzz_config_defaults() {
        let config = FuzzConfig::default();
        assert_eq!(config.backend, Backend::Hsa);
        assert!(config.iterations > 0);
        assert_eq!(config.kernels, vec!["vector_add".to_string()]);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: FuzzConfig =
            serde_json::from_str(r#"{"backend": "mock", "iterations": 4}"#).unwrap();
        assert_eq!(config.backend, Backend::Mock);
        assert_eq!(config.iterations, 4);
        assert_eq!(config.session.queue_capacity, 256);
    }
}
