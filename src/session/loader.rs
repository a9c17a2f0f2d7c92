//! Code Loader - turns a compiled kernel artifact into resolvable symbols
//!
//! Load sequence: open the artifact (falling back to a device-name-qualified
//! path for multi-device artifact caches), build a code-object reader from
//! the file handle, close the file, create an executable context with the
//! fixed profile policy, load the code object bound to the session's agent,
//! freeze the context, destroy the reader. Symbol resolution is a separate
//! step so a misspelled name leaves the frozen context queryable.
//!
//! Any failure aborts this load only; the session stays usable for other
//! artifacts.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{FuzzError, Result};
use crate::session::Session;

/// Names one loaded executable context within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactId(usize);

impl ArtifactId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

/// A resolved kernel entry point with the segment metadata the dispatcher
/// needs to size argument buffers. Read-only after resolution.
#[derive(Debug, Clone)]
pub struct KernelSymbol {
    pub name: String,
    pub kernel_object: u64,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
    pub kernarg_segment_size: u32,
    pub kernarg_alignment: u32,
}

/// Loads code objects into a session and resolves kernel symbols.
#[derive(Debug, Default)]
pub struct CodeLoader;

impl CodeLoader {
    /// Load `artifact` and resolve `symbol` in one step.
    pub fn load(
        &self,
        session: &mut Session,
        artifact: &Path,
        symbol: &str,
    ) -> Result<KernelSymbol> {
        let id = self.load_artifact(session, artifact)?;
        self.resolve(session, id, symbol)
    }

    /// Load `artifact` into a new, frozen executable context owned by the
    /// session.
    pub fn load_artifact(&self, session: &mut Session, artifact: &Path) -> Result<ArtifactId> {
        session.ensure_ready()?;
        let runtime = session.runtime_handle()?;
        let agent = session.agent().clone();

        let (file, resolved) = open_with_fallback(artifact, &agent.name)?;
        if session.verbose() && resolved != artifact {
            debug!(
                artifact = %artifact.display(),
                resolved = %resolved.display(),
                "artifact found via device-qualified fallback"
            );
        }

        let load_err = |reason: String| FuzzError::Load {
            path: resolved.clone(),
            reason,
        };

        let reader = runtime
            .backend()
            .reader_from_file(&file)
            .map_err(|e| load_err(e.to_string()))?;
        // The reader owns what it needs from here on.
        drop(file);

        let exec = match runtime.backend().executable_create() {
            Ok(exec) => exec,
            Err(e) => {
                let _ = runtime.backend().reader_destroy(reader);
                return Err(load_err(e.to_string()));
            }
        };

        let loaded = runtime
            .backend()
            .executable_load(exec, agent.handle, reader)
            .and_then(|()| runtime.backend().executable_freeze(exec));
        let _ = runtime.backend().reader_destroy(reader);
        if let Err(e) = loaded {
            let _ = runtime.backend().executable_destroy(exec);
            return Err(load_err(e.to_string()));
        }

        let id = session.track_executable(exec, resolved.clone());
        info!(
            session = %session.id(),
            artifact = %resolved.display(),
            "code object loaded and frozen"
        );
        Ok(id)
    }

    /// Resolve `symbol` within a previously loaded, frozen context.
    ///
    /// Fails with [`FuzzError::SymbolNotFound`] when absent; the context
    /// remains usable for further resolutions.
    pub fn resolve(
        &self,
        session: &Session,
        artifact: ArtifactId,
        symbol: &str,
    ) -> Result<KernelSymbol> {
        session.ensure_ready()?;
        let runtime = session.runtime_handle()?;
        let context = session.executable(artifact)?;

        let info = runtime
            .backend()
            .symbol_resolve(context.handle, session.agent().handle, symbol)?;
        Ok(KernelSymbol {
            name: symbol.to_string(),
            kernel_object: info.kernel_object,
            group_segment_size: info.group_segment_size,
            private_segment_size: info.private_segment_size,
            kernarg_segment_size: info.kernarg_segment_size,
            kernarg_alignment: info.kernarg_alignment,
        })
    }
}

/// Open `artifact`, retrying once under a `<device-name>/` qualification
/// when the primary path is missing. Relative paths are qualified from the
/// working directory, absolute paths from their parent directory.
fn open_with_fallback(artifact: &Path, device_name: &str) -> Result<(File, PathBuf)> {
    match File::open(artifact) {
        Ok(file) => return Ok((file, artifact.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let fallback = if artifact.is_absolute() {
        let name = artifact.file_name().unwrap_or_default();
        match artifact.parent() {
            Some(parent) => parent.join(device_name).join(name),
            None => PathBuf::from(device_name).join(name),
        }
    } else {
        PathBuf::from(device_name).join(artifact)
    };

    match File::open(&fallback) {
        Ok(file) => Ok((file, fallback)),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(FuzzError::ArtifactNotFound {
            path: artifact.to_path_buf(),
            fallback,
        }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_path_shapes() {
        let rel = Path::new("kernels/add.hsaco");
        match open_with_fallback(rel, "gfx90a") {
            Err(FuzzError::ArtifactNotFound { fallback, .. }) => {
                assert_eq!(fallback, Path::new("gfx90a/kernels/add.hsaco"));
            }
            other => panic!("expected ArtifactNotFound, got {other:?}"),
        }

        let abs = Path::new("/nonexistent-hsafuzz/add.hsaco");
        match open_with_fallback(abs, "gfx90a") {
            Err(FuzzError::ArtifactNotFound { fallback, .. }) => {
                assert_eq!(fallback, Path::new("/nonexistent-hsafuzz/gfx90a/add.hsaco"));
            }
            other => panic!("expected ArtifactNotFound, got {other:?}"),
        }
    }
}
