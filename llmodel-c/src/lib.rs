//! C ABI over the llmodel engine.
//!
//! Every `llmodel_*` function is `extern "C"` and never unwinds: errors and
//! panics are reported through a thread-local message slot, and handed out
//! buffers are released only through the matching `llmodel_*free*` function.
//!
//! ```c
//! llmodel_error err;
//! llmodel_model m = llmodel_model_create2("demo.bin", "auto", &err);
//! if (!m) { fprintf(stderr, "%s (%d)\n", err.message, err.code); return 1; }
//! llmodel_loadModel(m, "demo.bin");
//! ```
#![allow(non_camel_case_types)]

pub mod device;
pub mod embed;
pub mod error;
pub mod model;
pub mod prompt;
pub mod state;

pub use device::*;
pub use embed::*;
pub use error::llmodel_error;
pub use model::*;
pub use prompt::*;
pub use state::*;
