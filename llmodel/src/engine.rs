//! The engine interface every backend implements.

use serde::Deserialize;
use std::path::Path;

use crate::device::GpuDevice;
use crate::embedding::EmbedOptions;
use crate::error::Result;

/// Token id as it crosses the C boundary.
pub type Token = i32;

/// Called with each chunk of prompt tokens and whether it came from the cache.
/// Returning `false` stops prompt processing.
pub type PromptCallback<'a> = dyn FnMut(&[Token], bool) -> bool + 'a;

/// Called with each generated token and its text. Returning `false` stops generation.
pub type ResponseCallback<'a> = dyn FnMut(Token, &str) -> bool + 'a;

/// Called before each embedding batch with the token count of every text in
/// the batch and the backend name. Returning `true` cancels the call.
pub type EmbedCancelCallback<'a> = dyn FnMut(&[u32], &str) -> bool + 'a;

/// Sampling and window parameters for one prompt call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PromptContext {
    /// Maximum number of tokens to generate.
    pub n_predict: usize,
    /// Keep only the `top_k` most likely tokens, 0 disables.
    pub top_k: usize,
    /// Nucleus sampling threshold.
    pub top_p: f32,
    /// Drop tokens less likely than `min_p` times the most likely one.
    pub min_p: f32,
    /// Sampling temperature, zero or below is greedy.
    #[serde(alias = "temperature")]
    pub temp: f32,
    /// Prompt tokens processed per chunk.
    pub n_batch: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    /// Fraction of the window discarded when generation runs out of context.
    pub context_erase: f32,
}

impl Default for PromptContext {
    fn default() -> Self {
        Self {
            n_predict: 128,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
            temp: 0.7,
            n_batch: 8,
            repeat_penalty: 1.18,
            repeat_last_n: 64,
            context_erase: 0.5,
        }
    }
}

/// How an embedding call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedOutcome {
    /// Every text was embedded; `token_count` tokens were evaluated.
    Completed { token_count: usize },
    /// The cancel callback asked to stop. The output buffer is incomplete.
    Cancelled,
}

/// A model implementation.
///
/// One instance owns one model and its running context. Calls are expected
/// from one thread at a time.
pub trait LLModel {
    /// Name of the implementation that built this instance.
    fn backend_name(&self) -> &str;

    fn load_model(&mut self, path: &Path) -> Result<()>;
    fn is_model_loaded(&self) -> bool;

    /// Estimated bytes needed to load the model at `path`.
    fn required_mem(&self, path: &Path) -> Result<usize>;

    /// Size of the blob written by [`LLModel::save_state`].
    fn state_size(&self) -> usize;

    /// Write the state blob into `dest` and the tokens in context into
    /// `input_tokens`. Nothing is written when `dest` is too small.
    fn save_state(&self, dest: &mut [u8], input_tokens: &mut Vec<Token>) -> Result<usize>;

    /// Apply a blob produced by [`LLModel::save_state`]. The running state is
    /// left untouched when the blob does not match this model.
    fn restore_state(&mut self, src: &[u8], input_tokens: &[Token]) -> Result<usize>;

    fn prompt(
        &mut self,
        prompt: &str,
        prompt_callback: &mut PromptCallback<'_>,
        response_callback: &mut ResponseCallback<'_>,
        ctx: &PromptContext,
    ) -> Result<()>;

    /// Number of tokens `prompt` tokenizes to.
    fn count_prompt_tokens(&self, prompt: &str) -> Result<usize>;

    /// `(name, text)` pairs of the model's special tokens.
    fn special_tokens(&self) -> Vec<(String, String)>;

    fn embedding_size(&self) -> Result<usize>;

    /// Embed `texts` into `embeddings`, which must hold
    /// `texts.len() * options.output_size(embedding_size)` floats.
    fn embed(
        &mut self,
        texts: &[String],
        embeddings: &mut [f32],
        options: &EmbedOptions<'_>,
        cancel: Option<&mut EmbedCancelCallback<'_>>,
    ) -> Result<EmbedOutcome>;

    /// Devices with at least `memory_required` bytes of heap.
    fn available_gpu_devices(&self, memory_required: usize) -> Vec<GpuDevice>;
    fn init_gpu_device_by_string(&mut self, memory_required: usize, name: &str) -> bool;
    fn init_gpu_device(&mut self, device: &GpuDevice) -> bool;
    fn init_gpu_device_by_index(&mut self, index: i32) -> bool;
    fn has_gpu_device(&self) -> bool;
    fn gpu_device_name(&self) -> Option<&str>;

    /// Set the number of worker threads. Zero or below restores the default
    /// of one per logical CPU.
    fn set_thread_count(&mut self, n_threads: i32);
    fn thread_count(&self) -> i32;
}
