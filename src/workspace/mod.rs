//! Per-branch workspaces
//!
//! The sandbox sees one workspace mount. The dispatcher keeps a checkout per
//! assigned branch under `workspace.root` and runs allowed commands there
//! with a managed identity and credentials.

mod paths;
mod runner;

pub use paths::WorkspacePaths;
pub use runner::GitWorkspace;
