//! Backend implementations and the process-wide search path.
//!
//! Every implementation in this build runs on the CPU; they differ in the
//! instruction set they need. `"auto"` picks the first one the host supports.

use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::cpu::CpuModel;
use crate::engine::LLModel;
use crate::error::{LLModelError, Result};
use crate::format::ModelHeader;

/// Backend name that selects the best supported implementation.
pub const AUTO_BACKEND: &str = "auto";

/// Separator between directories in the search path.
pub const SEARCH_PATH_SEPARATOR: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Implementation {
    name: &'static str,
    requires_avx: bool,
}

/// Known implementations in order of preference.
pub const IMPLEMENTATIONS: &[Implementation] = &[
    Implementation { name: "cpu", requires_avx: true },
    Implementation { name: "cpu-compat", requires_avx: false },
];

impl Implementation {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the host CPU can run this implementation.
    pub fn is_supported(&self) -> bool {
        !self.requires_avx || host_has_avx()
    }

    pub fn find(name: &str) -> Option<&'static Implementation> {
        IMPLEMENTATIONS.iter().find(|i| i.name == name)
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn host_has_avx() -> bool {
    is_x86_feature_detected!("avx")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn host_has_avx() -> bool {
    true
}

static SEARCH_PATH: Lazy<RwLock<String>> = Lazy::new(|| RwLock::new(default_search_path()));

fn default_search_path() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.display().to_string()))
        .unwrap_or_default()
}

pub fn set_implementations_search_path(path: &str) {
    let mut guard = SEARCH_PATH.write().unwrap_or_else(|e| e.into_inner());
    *guard = path.to_string();
    debug!(search_path = path, "implementation search path set");
}

pub fn implementations_search_path() -> String {
    SEARCH_PATH.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Resolve a relative `path` that does not exist from the working directory
/// against each search path directory in turn.
pub fn resolve_model_path(path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        return path.to_path_buf();
    }
    implementations_search_path()
        .split(SEARCH_PATH_SEPARATOR)
        .filter(|dir| !dir.trim().is_empty())
        .map(|dir| Path::new(dir.trim()).join(path))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Pick the implementation for `backend`.
pub fn select(backend: &str) -> Result<&'static Implementation> {
    if backend == AUTO_BACKEND {
        return IMPLEMENTATIONS
            .iter()
            .find(|i| i.is_supported())
            .ok_or_else(|| LLModelError::Unsupported("no implementation supports this CPU".into()));
    }
    let imp = Implementation::find(backend)
        .ok_or_else(|| LLModelError::UnknownBackend(backend.to_string()))?;
    if !imp.is_supported() {
        return Err(LLModelError::invalid_argument(format!(
            "backend '{}' needs AVX, which this CPU lacks",
            backend
        )));
    }
    Ok(imp)
}

/// Build an engine for the model at `path` without loading its weights.
///
/// The file header is checked so that unrecognised files fail here rather
/// than at load time.
pub fn construct(path: &Path, backend: &str) -> Result<Box<dyn LLModel>> {
    let imp = select(backend)?;
    let path = resolve_model_path(path);
    ModelHeader::read_from_path(&path)?;
    info!(backend = imp.name(), path = %path.display(), "constructing model");
    Ok(Box::new(CpuModel::new(imp.name())))
}
