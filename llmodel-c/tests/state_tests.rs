mod common;

use common::*;
use llmodel_c::*;
use std::ptr;

#[test]
fn short_buffer_is_left_alone() {
    let model = open_model();
    prompt(&model, "hello world", 2);
    unsafe {
        let size = llmodel_state_get_size(model.handle);
        let mut blob = vec![0x5Au8; size as usize - 1];
        let mut tokens: *mut token_t = ptr::NonNull::dangling().as_ptr();
        let mut n_tokens = 99u64;
        let written = llmodel_state_get_data(
            model.handle,
            blob.as_mut_ptr(),
            blob.len() as u64,
            &mut tokens,
            &mut n_tokens,
        );
        assert_eq!(written, 0);
        assert!(tokens.is_null());
        assert_eq!(n_tokens, 0);
        assert!(blob.iter().all(|&b| b == 0x5A));
    }
}

#[test]
fn restore_returns_to_the_saved_point() {
    let model = open_model();
    prompt(&model, "hello world", 2);
    let (blob, tokens) = save(&model);
    assert_eq!(tokens.len(), 5);

    prompt(&model, "how are you", 3);
    assert_ne!(save(&model), (blob.clone(), tokens.clone()));

    let read = unsafe {
        llmodel_state_set_data(
            model.handle,
            blob.as_ptr(),
            blob.len() as u64,
            tokens.as_ptr(),
            tokens.len() as u64,
        )
    };
    assert_eq!(read, blob.len() as u64);
    assert_eq!(save(&model), (blob, tokens));
}

#[test]
fn mismatched_blob_leaves_state_unchanged() {
    let model = open_model();
    prompt(&model, "hello world", 2);
    let (blob, tokens) = save(&model);
    prompt(&model, "fine thanks", 1);
    let current = save(&model);

    unsafe {
        let short = llmodel_state_set_data(
            model.handle,
            blob.as_ptr(),
            blob.len() as u64 - 1,
            tokens.as_ptr(),
            tokens.len() as u64,
        );
        assert_eq!(short, 0);

        let wrong_tokens = llmodel_state_set_data(
            model.handle,
            blob.as_ptr(),
            blob.len() as u64,
            tokens.as_ptr(),
            tokens.len() as u64 - 1,
        );
        assert_eq!(wrong_tokens, 0);

        let missing_tokens = llmodel_state_set_data(
            model.handle,
            blob.as_ptr(),
            blob.len() as u64,
            ptr::null(),
            tokens.len() as u64,
        );
        assert_eq!(missing_tokens, 0);

        assert_eq!(llmodel_state_set_data(model.handle, ptr::null(), 0, ptr::null(), 0), 0);
    }
    assert_eq!(save(&model), current);
}

#[test]
fn fresh_model_saves_an_empty_context() {
    let model = open_model();
    let (blob, tokens) = save(&model);
    assert!(tokens.is_empty());
    assert_eq!(blob.len() as u64, unsafe { llmodel_state_get_size(model.handle) });

    let read = unsafe {
        llmodel_state_set_data(model.handle, blob.as_ptr(), blob.len() as u64, ptr::null(), 0)
    };
    assert_eq!(read, blob.len() as u64);
    prompt(&model, "hello", 1);
}

#[test]
fn unloaded_handle_has_no_state() {
    let model = open_model();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("model.bin");
    write_model(&path);
    let c = c_path(&path);
    let backend = std::ffi::CString::new("auto").unwrap();
    let mut err = llmodel_error { message: ptr::null(), code: 0 };
    unsafe {
        let handle = llmodel_model_create2(c.as_ptr(), backend.as_ptr(), &mut err);
        assert!(!handle.is_null());
        assert!(!llmodel_isModelLoaded(handle));
        assert_eq!(llmodel_state_get_size(handle), 0);
        llmodel_model_destroy(handle);
    }
    assert!(unsafe { llmodel_state_get_size(model.handle) } > 0);
}
