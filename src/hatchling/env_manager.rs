//! The external environment/package manager collaborator.
//!
//! The core only consumes two methods from whatever system resolves Python
//! environments and discovers MCP server scripts; everything else about
//! that system (install, uninstall, dependency resolution) is out of
//! scope. [`StaticEnvironmentManager`] is a fixed-list implementation
//! suitable for tests and for callers that already resolved these paths
//! some other way.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[derive(Debug)]
pub enum EnvError {
    NoInterpreter(String),
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvError::NoInterpreter(env) => {
                write!(f, "no Python interpreter resolved for environment '{env}'")
            }
        }
    }
}

impl std::error::Error for EnvError {}

#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    async fn list_server_entry_points(&self) -> Result<Vec<PathBuf>, EnvError>;
    fn resolve_python_executable(&self, env_name: Option<&str>) -> Result<PathBuf, EnvError>;
}

/// Fixed-list implementation: a pre-resolved interpreter plus a static set
/// of server script paths.
pub struct StaticEnvironmentManager {
    python_executable: PathBuf,
    server_paths: Vec<PathBuf>,
}

impl StaticEnvironmentManager {
    pub fn new(python_executable: impl AsRef<Path>, server_paths: Vec<PathBuf>) -> Self {
        Self {
            python_executable: python_executable.as_ref().to_path_buf(),
            server_paths,
        }
    }
}

#[async_trait]
impl EnvironmentManager for StaticEnvironmentManager {
    async fn list_server_entry_points(&self) -> Result<Vec<PathBuf>, EnvError> {
        Ok(self.server_paths.clone())
    }

    fn resolve_python_executable(&self, _env_name: Option<&str>) -> Result<PathBuf, EnvError> {
        Ok(self.python_executable.clone())
    }
}
