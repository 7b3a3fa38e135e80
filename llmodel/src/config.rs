//! Configuration types for llmodel.

use serde::Deserialize;
use std::path::PathBuf;

use crate::engine::PromptContext;
use crate::error::{LLModelError, Result};
use crate::implementation::{self, AUTO_BACKEND};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Model configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Default sampling parameters.
    #[serde(default)]
    pub prompt: PromptContext,

    /// `;`-separated directories searched for model files.
    #[serde(default)]
    pub search_path: Option<String>,
}

/// Model configuration.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    /// Path to the model file.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Implementation name, or `"auto"`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Device to select after construction.
    #[serde(default)]
    pub device: Option<String>,

    /// Worker threads, one per logical CPU when unset.
    #[serde(default)]
    pub threads: Option<i32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            backend: default_backend(),
            device: None,
            threads: None,
        }
    }
}

fn default_backend() -> String {
    AUTO_BACKEND.to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.model.backend != AUTO_BACKEND
            && implementation::Implementation::find(&self.model.backend).is_none()
        {
            return Err(LLModelError::config(format!(
                "unknown backend '{}'",
                self.model.backend
            )));
        }
        if !(0.0..=1.0).contains(&self.prompt.context_erase) {
            return Err(LLModelError::config("context_erase must be within [0, 1]"));
        }
        Ok(())
    }
}
