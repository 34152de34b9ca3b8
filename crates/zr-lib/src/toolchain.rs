//! Toolchain resolution seam.
//!
//! Tasks may declare `tool@version` specs. Resolving those to PATH
//! entries (and downloading missing tools) is an external collaborator's
//! job; the core only needs the trait below. The default implementation
//! looks for locally installed toolchains under `~/.zr/toolchains` and
//! falls back to whatever is already on PATH.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("invalid toolchain spec {spec:?}: expected tool@version")]
    InvalidSpec { spec: String },
    #[error("tool {tool} not found")]
    MissingTool { tool: String },
}

/// Resolved toolchain material for one task: directories to prepend to
/// PATH plus extra env vars.
#[derive(Debug, Default, Clone)]
pub struct ToolchainEnv {
    pub path_prepends: Vec<Utf8PathBuf>,
    pub env: Vec<(String, String)>,
}

pub trait ToolchainResolver: Send + Sync {
    fn resolve(&self, specs: &[String]) -> Result<ToolchainEnv, ToolchainError>;
}

/// Resolves against `~/.zr/toolchains/<tool>/<version>/bin`, falling
/// back to a PATH lookup of the bare tool name.
#[derive(Debug, Default)]
pub struct LocalToolchainResolver {
    root: Option<Utf8PathBuf>,
}

impl LocalToolchainResolver {
    pub fn new() -> Self {
        Self {
            root: crate::zr_home().map(|home| home.join("toolchains")),
        }
    }

    pub fn with_root(root: Utf8PathBuf) -> Self {
        Self { root: Some(root) }
    }
}

impl ToolchainResolver for LocalToolchainResolver {
    fn resolve(&self, specs: &[String]) -> Result<ToolchainEnv, ToolchainError> {
        let mut resolved = ToolchainEnv::default();
        for spec in specs {
            let (tool, version) = spec
                .split_once('@')
                .filter(|(tool, version)| !tool.is_empty() && !version.is_empty())
                .ok_or_else(|| ToolchainError::InvalidSpec { spec: spec.clone() })?;

            if let Some(root) = &self.root {
                let bin = root.join(tool).join(version).join("bin");
                if bin.is_dir() {
                    resolved.path_prepends.push(bin);
                    continue;
                }
            }
            if which::which(tool).is_err() {
                return Err(ToolchainError::MissingTool {
                    tool: tool.to_string(),
                });
            }
        }
        Ok(resolved)
    }
}
