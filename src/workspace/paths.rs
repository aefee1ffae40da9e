//! Sandbox-to-dispatcher path translation

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Maps the sandbox's workspace mount onto `{root}/{branch}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    agent_root: PathBuf,
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(agent_root: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            agent_root: agent_root.into(),
            root: root.into(),
        }
    }

    /// Checkout directory of a branch
    pub fn branch_dir(&self, branch: &str) -> PathBuf {
        self.root.join(branch)
    }

    /// Translate a sandbox working directory.
    ///
    /// The path is normalised lexically; the result must be the workspace
    /// itself or lie below it.
    pub fn translate(&self, branch: &str, agent_cwd: &str) -> Result<PathBuf> {
        let normalized = normalize(Path::new(agent_cwd)).ok_or_else(|| {
            Error::Workspace(format!("working directory must be absolute, got '{}'", agent_cwd))
        })?;

        let relative = normalized.strip_prefix(&self.agent_root).map_err(|_| {
            Error::Workspace(format!(
                "working directory must be within {}, got '{}'",
                self.agent_root.display(),
                agent_cwd
            ))
        })?;

        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Workspace(format!(
                "path traversal not allowed: '{}'",
                agent_cwd
            )));
        }

        Ok(self.branch_dir(branch).join(relative))
    }
}

/// Resolve `.` and `..` without touching the filesystem. `None` for
/// relative paths.
fn normalize(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
