//! Saving and restoring generation state.

use std::ptr;
use std::slice;
use tracing::warn;

use llmodel::{LLModelError, Result};

use crate::error::guard;
use crate::model::{llmodel_model, wrapper};
use crate::prompt::token_t;

/// Size in bytes of the state blob, 0 when no model is loaded.
///
/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_state_get_size(model: llmodel_model) -> u64 {
    guard(ptr::null_mut(), 0, || Ok(wrapper(model)?.model.state_size() as u64))
}

fn checked_len(len: u64, what: &str) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| LLModelError::invalid_argument(format!("'{}' is too large", what)))
}

/// Write the state blob into `state_out` and the tokens in context into a new
/// buffer stored in `input_tokens_out`.
///
/// Returns the bytes written. When `state_size` is smaller than
/// [`llmodel_state_get_size`] nothing is written, 0 is returned and
/// `input_tokens_out` is set to null. The token buffer must be released with
/// [`llmodel_state_free_input_tokens`].
///
/// # Safety
/// `model` must be a live handle, `state_out` valid for `state_size` bytes,
/// `input_tokens_out` and `n_input_tokens` writable.
#[no_mangle]
pub unsafe extern "C" fn llmodel_state_get_data(
    model: llmodel_model,
    state_out: *mut u8,
    state_size: u64,
    input_tokens_out: *mut *mut token_t,
    n_input_tokens: *mut u64,
) -> u64 {
    if input_tokens_out.is_null() || n_input_tokens.is_null() {
        return 0;
    }
    *input_tokens_out = ptr::null_mut();
    *n_input_tokens = 0;

    guard(ptr::null_mut(), 0, || {
        let wrapper = wrapper(model)?;
        if state_out.is_null() {
            return Err(LLModelError::invalid_argument("'state_out' is NULL"));
        }
        let dest = slice::from_raw_parts_mut(state_out, checked_len(state_size, "state_size")?);

        let mut tokens = Vec::new();
        let written = match wrapper.model.save_state(dest, &mut tokens) {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "failed to save state");
                return Err(err);
            }
        };
        if !tokens.is_empty() {
            let bytes = std::mem::size_of_val(&tokens[..]);
            let buf = libc::malloc(bytes) as *mut token_t;
            if buf.is_null() {
                return Err(LLModelError::state("out of memory"));
            }
            ptr::copy_nonoverlapping(tokens.as_ptr(), buf, tokens.len());
            *input_tokens_out = buf;
            *n_input_tokens = tokens.len() as u64;
        }
        Ok(written as u64)
    })
}

/// Release a token buffer from [`llmodel_state_get_data`]. Null is ignored.
///
/// # Safety
/// `input_tokens` must be null or a buffer not yet released.
#[no_mangle]
pub unsafe extern "C" fn llmodel_state_free_input_tokens(input_tokens: *mut token_t) {
    libc::free(input_tokens as *mut libc::c_void);
}

/// Restore a blob from [`llmodel_state_get_data`] together with its tokens.
///
/// Returns the bytes read, or 0 when the blob does not fit the loaded model;
/// the running state is then unchanged.
///
/// # Safety
/// `model` must be a live handle, `state` valid for `state_size` bytes and
/// `input_tokens` valid for `n_input_tokens` tokens (null when 0).
#[no_mangle]
pub unsafe extern "C" fn llmodel_state_set_data(
    model: llmodel_model,
    state: *const u8,
    state_size: u64,
    input_tokens: *const token_t,
    n_input_tokens: u64,
) -> u64 {
    guard(ptr::null_mut(), 0, || {
        let wrapper = wrapper(model)?;
        if state.is_null() {
            return Err(LLModelError::invalid_argument("'state' is NULL"));
        }
        let src = slice::from_raw_parts(state, checked_len(state_size, "state_size")?);
        let n_tokens = checked_len(n_input_tokens, "n_input_tokens")?;
        let tokens: &[token_t] = if n_tokens == 0 {
            &[]
        } else if input_tokens.is_null() {
            return Err(LLModelError::invalid_argument("'input_tokens' is NULL"));
        } else {
            slice::from_raw_parts(input_tokens, n_tokens)
        };

        match wrapper.model.restore_state(src, tokens) {
            Ok(read) => Ok(read as u64),
            Err(err) => {
                warn!(error = %err, "failed to restore state");
                Err(err)
            }
        }
    })
}
