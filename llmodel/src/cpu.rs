//! The CPU implementation of [`LLModel`].

use std::path::Path;
use tracing::{debug, info};

use crate::device::{self, GpuDevice};
use crate::embedding::{self, EmbedOptions, ATLAS_MAX_TOKENS, EMBED_BATCH_TEXTS};
use crate::engine::{
    EmbedCancelCallback, EmbedOutcome, LLModel, PromptCallback, PromptContext, ResponseCallback,
    Token,
};
use crate::error::{LLModelError, Result};
use crate::format::{ModelFile, ModelHeader};
use crate::model::Transformer;
use crate::sampling;
use crate::state::{self, Snapshot};
use crate::tokenizer::Tokenizer;

/// Seed of the sampling stream of a fresh model.
pub const DEFAULT_SEED: u64 = 0x5EED_CAFE;

struct Loaded {
    tokenizer: Tokenizer,
    transformer: Transformer,
}

pub struct CpuModel {
    backend: String,
    loaded: Option<Loaded>,
    /// Tokens currently in context.
    tokens: Vec<Token>,
    /// Logits for the position after `tokens`, empty when `tokens` is.
    logits: Vec<f32>,
    seed: u64,
    step: u64,
    device: Option<GpuDevice>,
    n_threads: usize,
}

impl CpuModel {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            loaded: None,
            tokens: Vec::new(),
            logits: Vec::new(),
            seed: DEFAULT_SEED,
            step: 0,
            device: None,
            n_threads: device::cpu_threads(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Tokens currently in context.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    fn loaded(&self) -> Result<&Loaded> {
        self.loaded.as_ref().ok_or(LLModelError::NotLoaded)
    }

    fn tokenize(tokenizer: &Tokenizer, text: &str) -> Vec<usize> {
        tokenizer.bos_id().into_iter().chain(tokenizer.encode(text)).collect()
    }
}

fn to_ids(tokens: &[Token]) -> Vec<usize> {
    tokens.iter().map(|&t| t as usize).collect()
}

fn next_logits(transformer: &Transformer, tokens: &[Token]) -> Vec<f32> {
    if tokens.is_empty() {
        Vec::new()
    } else {
        transformer.next_logits(&to_ids(tokens)).to_vec()
    }
}

fn common_prefix(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl LLModel for CpuModel {
    fn backend_name(&self) -> &str {
        &self.backend
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        let file = ModelFile::load(path)?;
        let args = file.args().clone();
        info!(
            path = %path.display(),
            backend = %self.backend,
            n_ctx = args.max_seq_len,
            vocab = args.vocab_size,
            "model loaded"
        );
        self.loaded = Some(Loaded {
            tokenizer: Tokenizer::new(file.vocab),
            transformer: file.transformer,
        });
        self.tokens.clear();
        self.logits.clear();
        self.step = 0;
        Ok(())
    }

    fn is_model_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn required_mem(&self, path: &Path) -> Result<usize> {
        let args = ModelHeader::read_from_path(path)?.args();
        let weights = args.param_count() * std::mem::size_of::<f32>();
        let window = args.max_seq_len * (args.dim + args.vocab_size) * std::mem::size_of::<f32>();
        Ok(weights + window + state::state_size(&args))
    }

    fn state_size(&self) -> usize {
        self.loaded
            .as_ref()
            .map(|l| state::state_size(&l.transformer.args))
            .unwrap_or(0)
    }

    fn save_state(&self, dest: &mut [u8], input_tokens: &mut Vec<Token>) -> Result<usize> {
        let loaded = self.loaded()?;
        let snapshot = Snapshot {
            n_past: self.tokens.len(),
            seed: self.seed,
            step: self.step,
            logits: self.logits.clone(),
        };
        let written = state::encode(&loaded.transformer.args, &snapshot, dest)?;
        input_tokens.clear();
        input_tokens.extend_from_slice(&self.tokens);
        Ok(written)
    }

    fn restore_state(&mut self, src: &[u8], input_tokens: &[Token]) -> Result<usize> {
        let loaded = self.loaded()?;
        let snapshot = state::decode(&loaded.transformer.args, src, input_tokens)?;
        self.tokens = input_tokens.to_vec();
        self.logits = snapshot.logits;
        self.seed = snapshot.seed;
        self.step = snapshot.step;
        debug!(n_past = self.tokens.len(), "state restored");
        Ok(src.len())
    }

    fn prompt(
        &mut self,
        prompt: &str,
        prompt_callback: &mut PromptCallback<'_>,
        response_callback: &mut ResponseCallback<'_>,
        ctx: &PromptContext,
    ) -> Result<()> {
        let loaded = self.loaded.as_ref().ok_or(LLModelError::NotLoaded)?;
        let n_ctx = loaded.transformer.args.max_seq_len;

        let input: Vec<Token> = Self::tokenize(&loaded.tokenizer, prompt)
            .into_iter()
            .map(|t| t as Token)
            .collect();
        if input.is_empty() {
            return Err(LLModelError::invalid_argument("prompt tokenized to zero tokens"));
        }
        if input.len() > n_ctx {
            return Err(LLModelError::ContextOverflow { n_tokens: input.len(), n_ctx });
        }

        // Reuse the longest shared prefix with what is already in context.
        // When the whole input is cached the last token is evaluated again
        // unless its logits are the ones we hold.
        let mut n_cached = common_prefix(&self.tokens, &input);
        if n_cached == input.len() && !(self.tokens.len() == n_cached && !self.logits.is_empty()) {
            n_cached -= 1;
        }
        if n_cached < self.tokens.len() {
            self.tokens.truncate(n_cached);
            self.logits.clear();
        }
        debug!(n_cached, n_new = input.len() - n_cached, "prompt");

        if n_cached > 0 && !prompt_callback(&input[..n_cached], true) {
            if self.logits.is_empty() {
                self.logits = next_logits(&loaded.transformer, &self.tokens);
            }
            debug!(n_past = self.tokens.len(), "prompt stopped on the cached prefix");
            return Ok(());
        }
        let n_batch = ctx.n_batch.max(1);
        let mut pending = false;
        for chunk in input[n_cached..].chunks(n_batch) {
            self.tokens.extend_from_slice(chunk);
            pending = true;
            if !prompt_callback(chunk, false) {
                self.logits = next_logits(&loaded.transformer, &self.tokens);
                debug!(n_past = self.tokens.len(), "prompt processing stopped by callback");
                return Ok(());
            }
        }
        if pending || self.logits.is_empty() {
            self.logits = next_logits(&loaded.transformer, &self.tokens);
        }

        let eos = loaded.tokenizer.eos_id();
        let keep_bos = n_ctx > 1
            && loaded.tokenizer.bos_id().map(|b| b as Token) == self.tokens.first().copied();
        let keep = usize::from(keep_bos);
        for _ in 0..ctx.n_predict {
            if self.logits.is_empty() {
                break;
            }
            let recent_start = self.tokens.len().saturating_sub(ctx.repeat_last_n);
            let recent = to_ids(&self.tokens[recent_start..]);
            let mut rng = sampling::step_rng(self.seed, self.step);
            self.step += 1;
            let id = sampling::sample(&self.logits, &recent, ctx, &mut rng);
            if Some(id) == eos {
                break;
            }

            if self.tokens.len() >= n_ctx {
                let n_discard = ((n_ctx as f32 * ctx.context_erase) as usize)
                    .max(1)
                    .min(self.tokens.len() - keep);
                self.tokens.drain(keep..keep + n_discard);
                debug!(n_discard, n_past = self.tokens.len(), "context window full, erased");
            }
            self.tokens.push(id as Token);
            self.logits = next_logits(&loaded.transformer, &self.tokens);

            if !response_callback(id as Token, &loaded.tokenizer.piece(id)) {
                debug!("generation stopped by callback");
                break;
            }
        }
        Ok(())
    }

    fn count_prompt_tokens(&self, prompt: &str) -> Result<usize> {
        Ok(Self::tokenize(&self.loaded()?.tokenizer, prompt).len())
    }

    fn special_tokens(&self) -> Vec<(String, String)> {
        self.loaded
            .as_ref()
            .map(|l| l.tokenizer.special_tokens())
            .unwrap_or_default()
    }

    fn embedding_size(&self) -> Result<usize> {
        Ok(self.loaded()?.transformer.args.dim)
    }

    fn embed(
        &mut self,
        texts: &[String],
        embeddings: &mut [f32],
        options: &EmbedOptions<'_>,
        mut cancel: Option<&mut EmbedCancelCallback<'_>>,
    ) -> Result<EmbedOutcome> {
        let loaded = self.loaded()?;
        if texts.is_empty() {
            return Err(LLModelError::invalid_argument("no texts to embed"));
        }
        let args = &loaded.transformer.args;
        let out_size = options.output_size(args.dim);
        if embeddings.len() != out_size * texts.len() {
            return Err(LLModelError::invalid_argument(format!(
                "output holds {} floats, {} texts need {}",
                embeddings.len(),
                texts.len(),
                out_size * texts.len()
            )));
        }

        let prefix = options.effective_prefix()?;
        let tokenized: Vec<Vec<usize>> = texts
            .iter()
            .map(|t| Self::tokenize(&loaded.tokenizer, &embedding::apply_prefix(prefix, t)))
            .collect();
        for (i, tokens) in tokenized.iter().enumerate() {
            if tokens.is_empty() {
                return Err(LLModelError::embedding(format!("text {} has no tokens", i)));
            }
            if options.atlas && options.do_mean && tokens.len() > ATLAS_MAX_TOKENS {
                return Err(LLModelError::embedding(format!(
                    "text {} has {} tokens, Atlas mode allows {}",
                    i,
                    tokens.len(),
                    ATLAS_MAX_TOKENS
                )));
            }
        }

        let mut token_count = 0;
        for (batch_idx, batch) in tokenized.chunks(EMBED_BATCH_TEXTS).enumerate() {
            if let Some(cancel) = cancel.as_deref_mut() {
                let sizes: Vec<u32> = batch.iter().map(|t| t.len() as u32).collect();
                if cancel(&sizes, &self.backend) {
                    debug!(batch = batch_idx, "embedding cancelled");
                    return Ok(EmbedOutcome::Cancelled);
                }
            }

            let pooled =
                pool_batch(&loaded.transformer, batch, options.do_mean, self.n_threads);
            for (j, (pooled, n_pooled)) in pooled.into_iter().enumerate() {
                let text_idx = batch_idx * EMBED_BATCH_TEXTS + j;
                token_count += n_pooled;
                let out = &mut embeddings[text_idx * out_size..(text_idx + 1) * out_size];
                out.copy_from_slice(&pooled[..out_size]);
                if out_size < args.dim {
                    embedding::l2_normalize(out);
                }
            }
        }
        Ok(EmbedOutcome::Completed { token_count })
    }

    fn available_gpu_devices(&self, memory_required: usize) -> Vec<GpuDevice> {
        device::with_headroom(device::host_devices(&self.backend), memory_required)
    }

    fn init_gpu_device_by_string(&mut self, memory_required: usize, name: &str) -> bool {
        let found = self
            .available_gpu_devices(memory_required)
            .into_iter()
            .find(|d| d.matches(name));
        self.select(found, name)
    }

    fn init_gpu_device(&mut self, device: &GpuDevice) -> bool {
        let found = self
            .available_gpu_devices(0)
            .into_iter()
            .find(|d| d.index == device.index && d.name == device.name);
        self.select(found, &device.name)
    }

    fn init_gpu_device_by_index(&mut self, index: i32) -> bool {
        let found = self
            .available_gpu_devices(0)
            .into_iter()
            .find(|d| d.index == index);
        self.select(found, &index.to_string())
    }

    fn has_gpu_device(&self) -> bool {
        self.device.as_ref().map(|d| d.is_gpu()).unwrap_or(false)
    }

    fn gpu_device_name(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.name.as_str())
    }

    fn set_thread_count(&mut self, n_threads: i32) {
        self.n_threads = match usize::try_from(n_threads) {
            Ok(n) if n > 0 => n,
            _ => device::cpu_threads(),
        };
        debug!(n_threads = self.n_threads, "thread count set");
    }

    fn thread_count(&self) -> i32 {
        self.n_threads.min(i32::MAX as usize) as i32
    }
}

/// Mean-pool and normalise every text of `batch`, spreading the texts over
/// up to `n_threads` workers. Returns the vector and pooled token count of
/// each text, in order.
fn pool_batch(
    transformer: &Transformer,
    batch: &[Vec<usize>],
    do_mean: bool,
    n_threads: usize,
) -> Vec<(Vec<f32>, usize)> {
    let n_ctx = transformer.args.max_seq_len;
    let dim = transformer.args.dim;
    let pool_one = |tokens: &Vec<usize>| {
        let mut pooled = vec![0.0_f32; dim];
        let mut n_pooled = 0;
        for chunk in embedding::chunk_tokens(tokens, n_ctx, do_mean) {
            let mean = embedding::mean_pool(&transformer.hidden(chunk));
            for (acc, v) in pooled.iter_mut().zip(mean.iter()) {
                *acc += v * chunk.len() as f32;
            }
            n_pooled += chunk.len();
        }
        embedding::l2_normalize(&mut pooled);
        (pooled, n_pooled)
    };

    let n_workers = n_threads.clamp(1, batch.len().max(1));
    if n_workers == 1 {
        return batch.iter().map(pool_one).collect();
    }
    let per_worker = batch.len().div_ceil(n_workers);
    std::thread::scope(|scope| {
        let workers: Vec<_> = batch
            .chunks(per_worker)
            .map(|part| scope.spawn(move || part.iter().map(pool_one).collect::<Vec<_>>()))
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}

impl CpuModel {
    fn select(&mut self, found: Option<GpuDevice>, query: &str) -> bool {
        match found {
            Some(d) => {
                info!(device = %d.name, backend = %d.backend, "device selected");
                self.device = Some(d);
                true
            }
            None => {
                debug!(query, "no matching device");
                false
            }
        }
    }
}
