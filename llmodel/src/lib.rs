//! llmodel: a small language-model engine behind a backend-agnostic interface.
//!
//! Engines implement [`LLModel`]. [`implementation::construct`] picks a
//! backend for a model file and returns it boxed; the caller then loads the
//! weights and drives prompting, embedding, state snapshots and device
//! selection through the trait.
//!
//! # Example
//!
//! ```ignore
//! use llmodel::{implementation, LLModel, PromptContext};
//!
//! let mut model = implementation::construct("demo.bin".as_ref(), "auto")?;
//! model.load_model("demo.bin".as_ref())?;
//! model.prompt(
//!     "hello world",
//!     &mut |_tokens, _cached| true,
//!     &mut |_id, piece| {
//!         print!("{}", piece);
//!         true
//!     },
//!     &PromptContext::default(),
//! )?;
//! ```

pub mod config;
pub mod cpu;
pub mod device;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod format;
pub mod implementation;
pub mod model;
pub mod sampling;
pub mod state;
pub mod tokenizer;

// Re-export commonly used types
pub use config::Config;
pub use cpu::CpuModel;
pub use device::GpuDevice;
pub use embedding::EmbedOptions;
pub use engine::{
    EmbedCancelCallback, EmbedOutcome, LLModel, PromptCallback, PromptContext, ResponseCallback,
    Token,
};
pub use error::{LLModelError, Result};
pub use format::ModelFile;
