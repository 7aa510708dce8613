//! Ephemeral run workspace
//!
//! One temporary directory per run. Files are only ever written beneath it;
//! paths that would escape (absolute, `..`, drive prefixes) are rejected
//! before anything touches the disk. The directory is removed when the run
//! ends, whatever the outcome.

use crate::error::SandboxError;
use crate::types::FileMap;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

/// Temporary directory holding one run's files
#[derive(Debug)]
pub(crate) struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh empty workspace
    pub(crate) fn provision() -> Result<Self, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("atl-sandbox-")
            .tempdir()
            .map_err(|e| SandboxError::unavailable(format!("cannot create workspace: {e}")))?;
        Ok(Self { dir })
    }

    /// Workspace root
    #[inline]
    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Resolve a relative file path inside the workspace
    pub(crate) fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        let candidate = Path::new(relative);
        if relative.trim().is_empty() {
            return Err(SandboxError::invalid("empty file path"));
        }
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(SandboxError::invalid(format!(
                        "file path escapes the workspace: {relative}"
                    )));
                }
            }
        }
        Ok(self.dir.path().join(candidate))
    }

    /// Write a snapshot of files into the workspace
    pub(crate) async fn write_files(&self, files: &FileMap) -> Result<(), SandboxError> {
        for (relative, content) in files {
            let target = self.resolve(relative)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SandboxError::internal(format!("cannot create directory for {relative}: {e}"))
                })?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| SandboxError::internal(format!("cannot write {relative}: {e}")))?;
        }
        Ok(())
    }

    /// Drop an empty `__init__.py` into the root and every subdirectory
    pub(crate) async fn scaffold_python_packages(&self) -> Result<(), SandboxError> {
        let root = self.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), SandboxError> {
            for entry in walkdir::WalkDir::new(&root) {
                let entry =
                    entry.map_err(|e| SandboxError::internal(format!("cannot scan workspace: {e}")))?;
                if !entry.file_type().is_dir() {
                    continue;
                }
                let init = entry.path().join("__init__.py");
                if !init.exists() {
                    std::fs::write(&init, "").map_err(|e| {
                        SandboxError::internal(format!("cannot create {}: {e}", init.display()))
                    })?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| SandboxError::internal(format!("workspace scaffolding panicked: {e}")))?
    }

    /// Remove the workspace, logging (not failing) on error
    pub(crate) fn destroy(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            tracing::warn!(workspace = %path.display(), error = %e, "failed to remove sandbox workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        let ws = Workspace::provision().unwrap();
        assert!(ws.resolve("../outside.py").is_err());
        assert!(ws.resolve("/etc/passwd").is_err());
        assert!(ws.resolve("pkg/../../x.py").is_err());
        assert!(ws.resolve("").is_err());
        assert!(ws.resolve("pkg/module.py").is_ok());
        assert!(ws.resolve("./main.py").is_ok());
        ws.destroy();
    }

    #[tokio::test]
    async fn writes_nested_files_and_scaffolds_packages() {
        let ws = Workspace::provision().unwrap();
        let mut files = FileMap::new();
        files.insert("main.py".to_string(), "print('hello')".to_string());
        files.insert("utils/helper.py".to_string(), "def help(): pass".to_string());

        ws.write_files(&files).await.unwrap();
        ws.scaffold_python_packages().await.unwrap();

        let main = std::fs::read_to_string(ws.path().join("main.py")).unwrap();
        assert_eq!(main, "print('hello')");
        assert!(ws.path().join("utils/helper.py").exists());
        assert!(ws.path().join("__init__.py").exists());
        assert!(ws.path().join("utils/__init__.py").exists());
        ws.destroy();
    }

    #[test]
    fn destroy_removes_directory() {
        let ws = Workspace::provision().unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.exists());
        ws.destroy();
        assert!(!path.exists());
    }
}
