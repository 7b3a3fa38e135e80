//! CLI entry point: writes demo models and drives the C interface end to end.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::{CStr, CString};
use std::io::Write;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use llmodel::model::ModelArgs;
use llmodel::{Config, ModelFile};
use llmodel_c::*;

/// Run llmodel models through the C interface.
#[derive(Parser, Debug)]
#[command(name = "llmodel-c")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file. Flags override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a demo model with seeded random weights.
    WriteDemo {
        #[arg(short, long, default_value = "demo.llmr")]
        out: PathBuf,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Context window in tokens.
        #[arg(long, default_value_t = 128)]
        n_ctx: usize,
        #[arg(long, default_value_t = 64)]
        dim: usize,
        #[arg(long, default_value_t = 2)]
        layers: usize,
        #[arg(long, default_value_t = 4)]
        heads: usize,
    },

    /// Generate a response to a prompt.
    Prompt {
        #[arg(short, long)]
        model: Option<PathBuf>,
        #[arg(short, long)]
        backend: Option<String>,
        /// Maximum tokens to generate.
        #[arg(short, long)]
        n_predict: Option<usize>,
        #[arg(short, long)]
        temp: Option<f32>,
        prompt: String,
    },

    /// Embed texts and print the size and norm of each vector.
    Embed {
        #[arg(short, long)]
        model: Option<PathBuf>,
        #[arg(short, long)]
        backend: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
        /// Truncate vectors to this many dimensions.
        #[arg(long)]
        dimensionality: Option<i32>,
        /// Average over window-sized chunks instead of truncating long texts.
        #[arg(long)]
        mean: bool,
        #[arg(required = true)]
        texts: Vec<String>,
    },

    /// List devices with enough memory.
    Devices {
        #[arg(short, long)]
        model: Option<PathBuf>,
        #[arg(short, long)]
        backend: Option<String>,
        /// Required memory in bytes.
        #[arg(long, default_value_t = 0)]
        memory: usize,
    },

    /// Show the backend, memory estimate and state size of a model.
    Info {
        #[arg(short, long)]
        model: Option<PathBuf>,
        #[arg(short, long)]
        backend: Option<String>,
    },
}

/// Owns an `llmodel_model` for the lifetime of a command.
struct Handle(llmodel_model);

impl Handle {
    fn open(path: &Path, backend: &str) -> Result<Self> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())?;
        let c_backend = CString::new(backend)?;
        let mut err = llmodel_error { message: ptr::null(), code: 0 };

        let model =
            unsafe { llmodel_model_create2(c_path.as_ptr(), c_backend.as_ptr(), &mut err) };
        if model.is_null() {
            bail!(
                "cannot create model for {}: {} (code {})",
                path.display(),
                message(err.message),
                err.code
            );
        }
        let handle = Self(model);
        if !unsafe { llmodel_loadModel(model, c_path.as_ptr()) } {
            bail!("failed to load {}", path.display());
        }
        info!(backend = %message(unsafe { llmodel_model_backend_name(model) }), "model ready");
        Ok(handle)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { llmodel_model_destroy(self.0) };
    }
}

fn message(ptr: *const c_char) -> String {
    if ptr.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

unsafe extern "C" fn on_prompt_chunk(
    _tokens: *const token_t,
    n_tokens: usize,
    cached: bool,
) -> bool {
    debug!(n_tokens, cached, "prompt chunk");
    true
}

unsafe extern "C" fn on_response(_token: token_t, piece: *const c_char) -> bool {
    let mut out = std::io::stdout();
    let _ = out.write_all(CStr::from_ptr(piece).to_bytes());
    let _ = out.flush();
    true
}

unsafe extern "C" fn on_special_token(name: *const c_char, token: *const c_char) {
    println!("  {:<10} {}", message(name), message(token));
}

struct Settings {
    config: Config,
}

impl Settings {
    fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Config::from_yaml_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(search_path) = &config.search_path {
            let c_path = CString::new(search_path.as_str())?;
            unsafe { llmodel_set_implementation_search_path(c_path.as_ptr()) };
        }
        Ok(Self { config })
    }

    fn open(&self, model: Option<PathBuf>, backend: Option<String>) -> Result<Handle> {
        let path = model
            .or_else(|| self.config.model.path.clone())
            .context("No model given: pass --model or set model.path in the config")?;
        let backend = backend.unwrap_or_else(|| self.config.model.backend.clone());
        let handle = Handle::open(&path, &backend)?;

        if let Some(threads) = self.config.model.threads {
            unsafe { llmodel_setThreadCount(handle.0, threads) };
        }
        if let Some(device) = &self.config.model.device {
            let c_device = CString::new(device.as_str())?;
            if !unsafe { llmodel_gpu_init_gpu_device_by_string(handle.0, 0, c_device.as_ptr()) } {
                warn!(%device, "configured device not available, staying on the default");
            }
        }
        Ok(handle)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::WriteDemo { out, seed, n_ctx, dim, layers, heads } => {
            if heads == 0 || dim % heads != 0 {
                bail!("--dim {} must be a multiple of --heads {}", dim, heads);
            }
            let args = ModelArgs {
                max_seq_len: n_ctx,
                vocab_size: 0,
                dim,
                n_layers: layers,
                n_heads: heads,
                hidden_dim: dim * 4,
            };
            ModelFile::demo(args, seed)
                .save(&out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("Saved demo model to {}", out.display());
        }

        Commands::Prompt { model, backend, n_predict, temp, prompt } => {
            let handle = settings.open(model, backend)?;
            let mut ctx = settings.config.prompt.clone();
            if let Some(n) = n_predict {
                ctx.n_predict = n;
            }
            if let Some(t) = temp {
                ctx.temp = t;
            }

            let c_ctx = llmodel_prompt_context::from(&ctx);
            let c_prompt = CString::new(prompt)?;
            let mut err: *const c_char = ptr::null();
            let ok = unsafe {
                llmodel_prompt(
                    handle.0,
                    c_prompt.as_ptr(),
                    Some(on_prompt_chunk),
                    Some(on_response),
                    &c_ctx,
                    &mut err,
                )
            };
            println!();
            if !ok {
                bail!("prompt failed: {}", message(err));
            }
        }

        Commands::Embed { model, backend, prefix, dimensionality, mean, texts } => {
            let handle = settings.open(model, backend)?;
            let c_texts = texts
                .iter()
                .map(|t| CString::new(t.as_str()))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut ptrs: Vec<*const c_char> = c_texts.iter().map(|t| t.as_ptr()).collect();
            ptrs.push(ptr::null());
            let c_prefix = prefix.map(CString::new).transpose()?;

            let mut size = 0usize;
            let mut token_count = 0usize;
            let mut err: *const c_char = ptr::null();
            let values = unsafe {
                llmodel_embed(
                    handle.0,
                    ptrs.as_ptr(),
                    &mut size,
                    c_prefix.as_ref().map_or(ptr::null(), |p| p.as_ptr()),
                    dimensionality.unwrap_or(0),
                    &mut token_count,
                    mean,
                    false,
                    None,
                    &mut err,
                )
            };
            if values.is_null() {
                bail!("embedding failed: {}", message(err));
            }

            let all = unsafe { std::slice::from_raw_parts(values, size) };
            let per_text = size / texts.len();
            for (text, vector) in texts.iter().zip(all.chunks(per_text)) {
                let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                println!("{:>4} dims  norm {:.4}  {}", vector.len(), norm, text);
            }
            println!("{} tokens evaluated", token_count);
            unsafe { llmodel_free_embedding(values) };
        }

        Commands::Devices { model, backend, memory } => {
            let handle = settings.open(model, backend)?;
            let mut n: i32 = 0;
            let devices = unsafe { llmodel_available_gpu_devices(handle.0, memory, &mut n) };
            if devices.is_null() {
                println!("No device with {} bytes available", memory);
                return Ok(());
            }
            for device in unsafe { std::slice::from_raw_parts(devices, n as usize) } {
                println!(
                    "[{}] {} ({}) type {} heap {} MiB via {}",
                    device.index,
                    message(device.name),
                    message(device.vendor),
                    device.r#type,
                    device.heap_size / (1024 * 1024),
                    message(device.backend)
                );
            }
            unsafe { llmodel_free_gpu_device_list(devices, n) };
        }

        Commands::Info { model, backend } => {
            let path = model.clone().or_else(|| settings.config.model.path.clone());
            let handle = settings.open(model, backend)?;
            let c_path = CString::new(
                path.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
            )?;
            unsafe {
                println!("llmodel-c v{}", env!("CARGO_PKG_VERSION"));
                println!("backend:       {}", message(llmodel_model_backend_name(handle.0)));
                println!("search path:   {}", message(llmodel_get_implementation_search_path()));
                println!("required mem:  {} bytes", llmodel_required_mem(handle.0, c_path.as_ptr()));
                println!("state size:    {} bytes", llmodel_state_get_size(handle.0));
                println!("threads:       {}", llmodel_threadCount(handle.0));
                println!("special tokens:");
                llmodel_model_foreach_special_token(handle.0, Some(on_special_token));
            }
        }
    }

    Ok(())
}
