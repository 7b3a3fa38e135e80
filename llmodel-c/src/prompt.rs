//! Prompting, token counting and special tokens.

use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;
use tracing::debug;

use llmodel::{LLModelError, PromptContext, Token};

use crate::error::{cstr_to_str, guard};
use crate::model::{llmodel_model, wrapper};

pub type token_t = i32;

/// Called with each chunk of prompt tokens; `cached` is true for the chunk
/// already held in context. Return false to stop.
pub type llmodel_prompt_callback =
    Option<unsafe extern "C" fn(token_ids: *const token_t, n_token_ids: usize, cached: bool) -> bool>;

/// Called with each generated token and its text. Return false to stop.
pub type llmodel_response_callback =
    Option<unsafe extern "C" fn(token_id: token_t, response: *const c_char) -> bool>;

/// Called once per special token with its name and text.
pub type llmodel_special_token_callback =
    Option<unsafe extern "C" fn(name: *const c_char, token: *const c_char)>;

/// Sampling parameters, passed by value on every prompt call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct llmodel_prompt_context {
    pub n_predict: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub temp: f32,
    pub n_batch: i32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub context_erase: f32,
}

fn non_negative(v: i32) -> usize {
    v.max(0) as usize
}

impl From<&llmodel_prompt_context> for PromptContext {
    fn from(ctx: &llmodel_prompt_context) -> Self {
        Self {
            n_predict: non_negative(ctx.n_predict),
            top_k: non_negative(ctx.top_k),
            top_p: ctx.top_p,
            min_p: ctx.min_p,
            temp: ctx.temp,
            n_batch: non_negative(ctx.n_batch),
            repeat_penalty: ctx.repeat_penalty,
            repeat_last_n: non_negative(ctx.repeat_last_n),
            context_erase: ctx.context_erase.clamp(0.0, 1.0),
        }
    }
}

impl From<&PromptContext> for llmodel_prompt_context {
    fn from(ctx: &PromptContext) -> Self {
        let clamp = |v: usize| v.min(i32::MAX as usize) as i32;
        Self {
            n_predict: clamp(ctx.n_predict),
            top_k: clamp(ctx.top_k),
            top_p: ctx.top_p,
            min_p: ctx.min_p,
            temp: ctx.temp,
            n_batch: clamp(ctx.n_batch),
            repeat_penalty: ctx.repeat_penalty,
            repeat_last_n: clamp(ctx.repeat_last_n),
            context_erase: ctx.context_erase,
        }
    }
}

impl Default for llmodel_prompt_context {
    fn default() -> Self {
        Self::from(&PromptContext::default())
    }
}

/// Feed `prompt` to the model and generate a response.
///
/// Returns true when the call completed or a callback stopped it, false with
/// `error` set when it failed. The handle stays usable after a failure.
///
/// # Safety
/// `model` must be a live handle, `prompt` a NUL-terminated string and `ctx`
/// a valid pointer. `error` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn llmodel_prompt(
    model: llmodel_model,
    prompt: *const c_char,
    prompt_callback: llmodel_prompt_callback,
    response_callback: llmodel_response_callback,
    ctx: *const llmodel_prompt_context,
    error: *mut *const c_char,
) -> bool {
    guard(error, false, || {
        let wrapper = wrapper(model)?;
        let prompt = cstr_to_str(prompt, "prompt")?;
        let ctx = ctx
            .as_ref()
            .map(PromptContext::from)
            .ok_or_else(|| LLModelError::invalid_argument("'ctx' is NULL"))?;

        let mut on_prompt = |tokens: &[Token], cached: bool| match prompt_callback {
            Some(cb) => cb(tokens.as_ptr(), tokens.len(), cached),
            None => true,
        };
        let mut on_response = |token: Token, piece: &str| match response_callback {
            Some(cb) => {
                let piece = CString::new(piece).unwrap_or_default();
                cb(token, piece.as_ptr())
            }
            None => true,
        };
        wrapper.model.prompt(prompt, &mut on_prompt, &mut on_response, &ctx)?;
        Ok(true)
    })
}

/// Number of tokens `prompt` tokenizes to, or -1 with `error` set.
///
/// # Safety
/// `model` must be a live handle and `prompt` a NUL-terminated string.
/// `error` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn llmodel_count_prompt_tokens(
    model: llmodel_model,
    prompt: *const c_char,
    error: *mut *const c_char,
) -> i32 {
    guard(error, -1, || {
        let wrapper = wrapper(model)?;
        let n = wrapper.model.count_prompt_tokens(cstr_to_str(prompt, "prompt")?)?;
        Ok(n.min(i32::MAX as usize) as i32)
    })
}

/// Call `callback` with the name and text of each special token.
///
/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_foreach_special_token(
    model: llmodel_model,
    callback: llmodel_special_token_callback,
) {
    guard(ptr::null_mut(), (), || {
        let wrapper = wrapper(model)?;
        let Some(cb) = callback else {
            return Ok(());
        };
        for (name, token) in wrapper.model.special_tokens() {
            let name = CString::new(name).unwrap_or_default();
            let token = CString::new(token).unwrap_or_default();
            cb(name.as_ptr(), token.as_ptr());
        }
        debug!("special tokens enumerated");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_fields_clamp_to_zero() {
        let c = llmodel_prompt_context {
            n_predict: -5,
            top_k: -1,
            n_batch: 0,
            repeat_last_n: -64,
            context_erase: 2.0,
            ..llmodel_prompt_context::default()
        };
        let ctx = PromptContext::from(&c);
        assert_eq!(ctx.n_predict, 0);
        assert_eq!(ctx.top_k, 0);
        assert_eq!(ctx.repeat_last_n, 0);
        assert_eq!(ctx.context_erase, 1.0);
    }

    #[test]
    fn default_matches_engine_defaults() {
        let ctx = PromptContext::from(&llmodel_prompt_context::default());
        assert_eq!(ctx, PromptContext::default());
    }
}
