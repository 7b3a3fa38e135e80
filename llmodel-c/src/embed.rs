//! Batch text embedding.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_uint};
use std::ptr;
use tracing::debug;

use llmodel::{EmbedCancelCallback, EmbedOptions, EmbedOutcome, LLModelError, Result};

use crate::error::{cstr_to_str, guard, set_error};
use crate::model::{llmodel_model, wrapper};

/// Called before each batch with the token count of every text in it and the
/// backend name. Return true to cancel.
pub type llmodel_emb_cancel_callback = Option<
    unsafe extern "C" fn(batch_sizes: *mut c_uint, n_batch: usize, backend: *const c_char) -> bool,
>;

/// Collect a NULL-terminated array of C strings.
unsafe fn collect_texts(texts: *const *const c_char) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut cursor = texts;
    while !(*cursor).is_null() {
        out.push(cstr_to_str(*cursor, "texts")?.to_string());
        cursor = cursor.add(1);
    }
    Ok(out)
}

/// Copy `values` into a buffer released by [`llmodel_free_embedding`].
fn into_c_buffer(values: &[f32]) -> Result<*mut f32> {
    let bytes = std::mem::size_of_val(values);
    let buf = unsafe { libc::malloc(bytes.max(1)) } as *mut f32;
    if buf.is_null() {
        return Err(LLModelError::embedding("out of memory"));
    }
    unsafe { ptr::copy_nonoverlapping(values.as_ptr(), buf, values.len()) };
    Ok(buf)
}

/// Embed a NULL-terminated array of texts.
///
/// On success returns `embedding_size` floats, `embedding_size / n_texts` per
/// text, to be released with [`llmodel_free_embedding`]. `token_count`, when
/// not null, receives the number of tokens evaluated. A positive
/// `dimensionality` truncates each vector to at most that many dimensions.
///
/// Null is returned with `embedding_size` set to 0 both on failure, where
/// `error` is set, and on cancellation by `cancel_cb`, where `error` is set to
/// null.
///
/// # Safety
/// `model` must be a live handle, `texts` null or a NULL-terminated array of
/// NUL-terminated strings, `prefix` null or a NUL-terminated string.
/// `embedding_size` must be writable; `token_count` and `error` null or
/// writable.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn llmodel_embed(
    model: llmodel_model,
    texts: *const *const c_char,
    embedding_size: *mut usize,
    prefix: *const c_char,
    dimensionality: c_int,
    token_count: *mut usize,
    do_mean: bool,
    atlas: bool,
    cancel_cb: llmodel_emb_cancel_callback,
    error: *mut *const c_char,
) -> *mut f32 {
    if let Some(size) = embedding_size.as_mut() {
        *size = 0;
    }
    if texts.is_null() || (*texts).is_null() {
        set_error(error, "'texts' is NULL or empty");
        return ptr::null_mut();
    }

    guard(error, ptr::null_mut(), || {
        if embedding_size.is_null() {
            return Err(LLModelError::invalid_argument("'embedding_size' is NULL"));
        }
        let wrapper = wrapper(model)?;
        let texts = collect_texts(texts)?;
        let prefix = if prefix.is_null() {
            None
        } else {
            Some(cstr_to_str(prefix, "prefix")?)
        };
        let options = EmbedOptions {
            prefix,
            dimensionality: usize::try_from(dimensionality).ok().filter(|&d| d > 0),
            do_mean,
            atlas,
        };

        let per_text = options.output_size(wrapper.model.embedding_size()?);
        let mut values = vec![0.0_f32; per_text * texts.len()];
        let mut on_batch = |sizes: &[u32], backend: &str| match cancel_cb {
            Some(cb) => {
                let mut sizes: Vec<c_uint> = sizes.to_vec();
                let backend = CString::new(backend).unwrap_or_default();
                cb(sizes.as_mut_ptr(), sizes.len(), backend.as_ptr())
            }
            None => false,
        };
        let cancel = match cancel_cb {
            Some(_) => Some(&mut on_batch as &mut EmbedCancelCallback<'_>),
            None => None,
        };

        match wrapper.model.embed(&texts, &mut values, &options, cancel)? {
            EmbedOutcome::Completed { token_count: n_tokens } => {
                let buf = into_c_buffer(&values)?;
                *embedding_size = values.len();
                if let Some(count) = token_count.as_mut() {
                    *count = n_tokens;
                }
                Ok(buf)
            }
            EmbedOutcome::Cancelled => {
                debug!(n_texts = texts.len(), "embedding cancelled by caller");
                if !error.is_null() {
                    *error = ptr::null();
                }
                Ok(ptr::null_mut())
            }
        }
    })
}

/// Release a buffer returned by [`llmodel_embed`]. Null is ignored.
///
/// # Safety
/// `ptr` must be null or a buffer from `llmodel_embed` not yet released.
#[no_mangle]
pub unsafe extern "C" fn llmodel_free_embedding(ptr: *mut f32) {
    libc::free(ptr as *mut libc::c_void);
}
