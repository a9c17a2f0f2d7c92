//! Kernel Artifact Provider
//!
//! Compiles named kernels from an embedded HIP source catalog into loadable
//! code objects, cached on disk keyed by kernel name. The compiler itself is
//! external (hipcc producing `--genco` output); this module only drives it
//! and guarantees the cache never holds a partial artifact: output goes to a
//! temp file and is renamed into place on success.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{FuzzError, Result};

const VECTOR_ADD: &str = r#"
    #include <hip/hip_runtime.h>
    extern "C" __global__ void vector_add(const float* a, const float* b, float* c, int N) {
        int i = hipBlockIdx_x * hipBlockDim_x + hipThreadIdx_x;
        if (i < N) {
            c[i] = a[i] + b[i];
        }
    }
"#;

const VECTOR_MUL: &str = r#"
    #include <hip/hip_runtime.h>
    extern "C" __global__ void vector_mul(const float* a, const float* b, float* c, int N) {
        int i = hipBlockIdx_x * hipBlockDim_x + hipThreadIdx_x;
        if (i < N) {
            c[i] = a[i] * b[i];
        }
    }
"#;

fn source_for(name: &str) -> Option<&'static str> {
    match name {
        "vector_add" => Some(VECTOR_ADD),
        "vector_mul" => Some(VECTOR_MUL),
        _ => None,
    }
}

/// Kernel names this provider can compile.
pub fn known_kernels() -> &'static [&'static str] {
    &["vector_add", "vector_mul"]
}

/// Compiles and caches kernel artifacts under one cache directory.
#[derive(Debug, Clone)]
pub struct KernelCatalog {
    cache_dir: PathBuf,
    compiler: PathBuf,
}

impl KernelCatalog {
    /// Create a catalog caching artifacts under `cache_dir`, creating the
    /// directory if needed.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_compiler(cache_dir, "hipcc")
    }

    /// Same as [`KernelCatalog::new`] with an explicit compiler binary.
    pub fn with_compiler(
        cache_dir: impl Into<PathBuf>,
        compiler: impl Into<PathBuf>,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            compiler: compiler.into(),
        })
    }

    /// Deterministic artifact location for `name`, whether or not it has
    /// been compiled yet.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.hsaco"))
    }

    /// Compile `name` to a code object, reusing the cached artifact when
    /// present.
    ///
    /// Unknown names fail with [`FuzzError::KernelNotFound`]; a compiler
    /// failure surfaces as [`FuzzError::Compilation`] and leaves no partial
    /// artifact in the cache.
    pub fn compile(&self, name: &str) -> Result<PathBuf> {
        let source =
            source_for(name).ok_or_else(|| FuzzError::KernelNotFound(name.to_string()))?;

        let artifact = self.artifact_path(name);
        if artifact.exists() {
            debug!(kernel = name, artifact = %artifact.display(), "artifact cache hit");
            return Ok(artifact);
        }

        let source_path = self.cache_dir.join(format!("{name}.cpp"));
        let partial = self.cache_dir.join(format!(".{name}.hsaco.partial"));
        fs::write(&source_path, source)?;

        let status = Command::new(&self.compiler)
            .arg("--genco")
            .arg(&source_path)
            .arg("-o")
            .arg(&partial)
            .status();
        let _ = fs::remove_file(&source_path);

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(FuzzError::Compilation(format!(
                    "failed to run {}: {e}",
                    self.compiler.display()
                )));
            }
        };
        if !status.success() {
            let _ = fs::remove_file(&partial);
            return Err(FuzzError::Compilation(format!(
                "{} exited with {status} for kernel `{name}`",
                self.compiler.display()
            )));
        }

        fs::rename(&partial, &artifact)?;
        info!(kernel = name, artifact = %artifact.display(), "kernel compiled");
        Ok(artifact)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unknown_kernel() {
        let dir = tempdir().unwrap();
        let catalog = KernelCatalog::new(dir.path()).unwrap();
        let err = catalog.compile("definitely_not_a_kernel").unwrap_err();
        assert!(matches!(err, FuzzError::KernelNotFound(_)));
    }

    #[test]
    fn test_cache_hit_skips_compiler() {
        let dir = tempdir().unwrap();
        // Compiler binary that cannot exist; the pre-seeded artifact means
        // it must never be invoked.
        let catalog =
            KernelCatalog::with_compiler(dir.path(), "/nonexistent/hipcc").unwrap();
        fs::write(catalog.artifact_path("vector_add"), b"cached").unwrap();

        let path = catalog.compile("vector_add").unwrap();
        assert_eq!(path, catalog.artifact_path("vector_add"));
    }

    #[test]
    fn test_failed_compile_leaves_no_partial_artifact() {
        let dir = tempdir().unwrap();
        let catalog = KernelCatalog::with_compiler(dir.path(), "false").unwrap();

        let err = catalog.compile("vector_mul").unwrap_err();
        assert!(matches!(err, FuzzError::Compilation(_)));
        assert!(!catalog.artifact_path("vector_mul").exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "cache should be empty: {leftovers:?}");
    }

    #[test]
    fn test_catalog_lists_embedded_kernels() {
        assert!(known_kernels().contains(&"vector_add"));
        assert!(source_for("vector_add").unwrap().contains("__global__"));
    }
}
