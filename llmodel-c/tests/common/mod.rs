#![allow(dead_code)]

use llmodel::model::ModelArgs;
use llmodel::ModelFile;
use llmodel_c::*;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use tempfile::NamedTempFile;

pub const N_CTX: usize = 24;
pub const DIM: usize = 16;

/// A loaded handle that is destroyed on drop, along with its model file.
pub struct TestModel {
    pub handle: llmodel_model,
    pub file: NamedTempFile,
}

impl Drop for TestModel {
    fn drop(&mut self) {
        unsafe { llmodel_model_destroy(self.handle) };
    }
}

pub fn c_path(path: &Path) -> CString {
    CString::new(path.to_str().unwrap()).unwrap()
}

pub fn read(ptr: *const c_char) -> String {
    assert!(!ptr.is_null());
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Write a model without an end-of-sequence token so generation only stops
/// at `n_predict` or on request.
pub fn write_model(path: &Path) {
    let args = ModelArgs {
        max_seq_len: N_CTX,
        vocab_size: 0,
        dim: DIM,
        n_layers: 1,
        n_heads: 4,
        hidden_dim: 32,
    };
    let vocab = ["<unk>", "<s>", "hello", "world", "how", "are", "you", "fine", "thanks"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    ModelFile::new(args, vocab, 5).save(path).unwrap();
}

pub fn open_model() -> TestModel {
    let file = NamedTempFile::new().unwrap();
    write_model(file.path());
    let path = c_path(file.path());
    let backend = CString::new("auto").unwrap();
    let mut err = llmodel_error { message: ptr::null(), code: 0 };
    unsafe {
        let handle = llmodel_model_create2(path.as_ptr(), backend.as_ptr(), &mut err);
        assert!(!handle.is_null());
        assert!(llmodel_loadModel(handle, path.as_ptr()));
        TestModel { handle, file }
    }
}

pub fn greedy(n_predict: i32) -> llmodel_prompt_context {
    llmodel_prompt_context {
        n_predict,
        temp: 0.0,
        repeat_penalty: 1.0,
        ..llmodel_prompt_context::default()
    }
}

unsafe extern "C" fn keep_going(_: *const token_t, _: usize, _: bool) -> bool {
    true
}

unsafe extern "C" fn ignore_response(_: token_t, _: *const c_char) -> bool {
    true
}

pub fn prompt(model: &TestModel, text: &str, n_predict: i32) {
    let text = CString::new(text).unwrap();
    let ctx = greedy(n_predict);
    let mut err: *const c_char = ptr::null();
    let ok = unsafe {
        llmodel_prompt(
            model.handle,
            text.as_ptr(),
            Some(keep_going),
            Some(ignore_response),
            &ctx,
            &mut err,
        )
    };
    assert!(ok, "prompt failed: {}", read(err));
}

/// Saved state and the tokens that came with it.
pub fn save(model: &TestModel) -> (Vec<u8>, Vec<token_t>) {
    unsafe {
        let size = llmodel_state_get_size(model.handle);
        let mut blob = vec![0u8; size as usize];
        let mut tokens: *mut token_t = ptr::null_mut();
        let mut n_tokens = 0u64;
        let written =
            llmodel_state_get_data(model.handle, blob.as_mut_ptr(), size, &mut tokens, &mut n_tokens);
        assert_eq!(written, size);
        let copied = if tokens.is_null() {
            Vec::new()
        } else {
            std::slice::from_raw_parts(tokens, n_tokens as usize).to_vec()
        };
        llmodel_state_free_input_tokens(tokens);
        (blob, copied)
    }
}
