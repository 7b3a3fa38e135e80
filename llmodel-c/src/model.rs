//! The opaque model handle and its lifecycle.

use std::cell::RefCell;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use tracing::{debug, warn};

use llmodel::implementation::{self, AUTO_BACKEND};
use llmodel::{LLModel, LLModelError, Result};

use crate::error::{catch_panic, cstr_to_str, guard, llmodel_error, set_error_record};

/// Opaque handle to one engine instance.
pub type llmodel_model = *mut c_void;

/// What an `llmodel_model` points to.
pub struct LLModelWrapper {
    pub(crate) model: Box<dyn LLModel>,
    backend_name: CString,
    /// Last value handed out by `llmodel_model_gpu_device_name`.
    gpu_name: Option<CString>,
}

impl LLModelWrapper {
    fn new(model: Box<dyn LLModel>) -> Self {
        let backend_name = CString::new(model.backend_name()).unwrap_or_default();
        Self { model, backend_name, gpu_name: None }
    }
}

/// Borrow the wrapper behind `model`.
///
/// # Safety
/// `model` must be null or a live handle returned by `llmodel_model_create2`.
pub(crate) unsafe fn wrapper<'a>(model: llmodel_model) -> Result<&'a mut LLModelWrapper> {
    (model as *mut LLModelWrapper)
        .as_mut()
        .ok_or_else(|| LLModelError::invalid_argument("model handle is NULL"))
}

/// Create a model instance for the file at `model_path`.
///
/// `backend` names an implementation or is `"auto"`; null means `"auto"`.
/// On failure null is returned and `error`, when not null, receives the
/// message and an errno-style code.
///
/// # Safety
/// `model_path` and `backend` must be null or NUL-terminated strings; `error`
/// must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_create2(
    model_path: *const c_char,
    backend: *const c_char,
    error: *mut llmodel_error,
) -> llmodel_model {
    let result = catch_panic(|| -> Result<Box<dyn LLModel>> {
        let path = cstr_to_str(model_path, "model_path")?;
        let backend = if backend.is_null() {
            AUTO_BACKEND
        } else {
            cstr_to_str(backend, "backend")?
        };
        implementation::construct(Path::new(path), backend)
    });

    match result {
        Ok(model) => Box::into_raw(Box::new(LLModelWrapper::new(model))) as llmodel_model,
        Err(err) => {
            debug!(error = %err, code = err.errno(), "model construction failed");
            set_error_record(error, &err);
            ptr::null_mut()
        }
    }
}

/// Create a model instance with the `"auto"` backend.
///
/// # Safety
/// `model_path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_create(model_path: *const c_char) -> llmodel_model {
    let model = llmodel_model_create2(model_path, ptr::null(), ptr::null_mut());
    if model.is_null() {
        warn!("Invalid model file");
    }
    model
}

/// Destroy a handle. Null is ignored.
///
/// # Safety
/// `model` must be null or a handle that has not been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_destroy(model: llmodel_model) {
    if model.is_null() {
        return;
    }
    drop(Box::from_raw(model as *mut LLModelWrapper));
}

/// Estimated bytes needed to load the model at `model_path`, 0 when the file
/// cannot be inspected.
///
/// # Safety
/// `model` must be a live handle and `model_path` a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llmodel_required_mem(
    model: llmodel_model,
    model_path: *const c_char,
) -> usize {
    guard(ptr::null_mut(), 0, || {
        let wrapper = wrapper(model)?;
        let path = cstr_to_str(model_path, "model_path")?;
        let path = implementation::resolve_model_path(Path::new(path));
        wrapper.model.required_mem(&path)
    })
}

/// Load the model at `model_path` into the handle.
///
/// # Safety
/// `model` must be a live handle and `model_path` a NUL-terminated string.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn llmodel_loadModel(
    model: llmodel_model,
    model_path: *const c_char,
) -> bool {
    guard(ptr::null_mut(), false, || {
        let wrapper = wrapper(model)?;
        let path = cstr_to_str(model_path, "model_path")?;
        let path = implementation::resolve_model_path(Path::new(path));
        match wrapper.model.load_model(&path) {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to load model");
                Err(err)
            }
        }
    })
}

/// # Safety
/// `model` must be a live handle.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn llmodel_isModelLoaded(model: llmodel_model) -> bool {
    guard(ptr::null_mut(), false, || Ok(wrapper(model)?.model.is_model_loaded()))
}

/// Name of the implementation behind the handle. The string is owned by the
/// handle.
///
/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_backend_name(model: llmodel_model) -> *const c_char {
    guard(ptr::null_mut(), ptr::null(), || Ok(wrapper(model)?.backend_name.as_ptr()))
}

/// Name of the selected device, or null when none was selected. The string is
/// owned by the handle and valid until the next call of this function.
///
/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_gpu_device_name(model: llmodel_model) -> *const c_char {
    guard(ptr::null_mut(), ptr::null(), || {
        let wrapper = wrapper(model)?;
        wrapper.gpu_name = wrapper
            .model
            .gpu_device_name()
            .map(|name| CString::new(name).unwrap_or_default());
        Ok(wrapper.gpu_name.as_ref().map_or(ptr::null(), |name| name.as_ptr()))
    })
}

/// Set the number of worker threads. Zero or below restores the default of
/// one per logical CPU.
///
/// # Safety
/// `model` must be a live handle.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn llmodel_setThreadCount(model: llmodel_model, n_threads: i32) {
    guard(ptr::null_mut(), (), || {
        wrapper(model)?.model.set_thread_count(n_threads);
        Ok(())
    })
}

/// Number of worker threads, 0 for a null handle.
///
/// # Safety
/// `model` must be a live handle.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn llmodel_threadCount(model: llmodel_model) -> i32 {
    guard(ptr::null_mut(), 0, || Ok(wrapper(model)?.model.thread_count()))
}

thread_local! {
    static SEARCH_PATH: RefCell<CString> = RefCell::new(CString::default());
}

/// Set the `;`-separated directories searched for model files.
///
/// # Safety
/// `path` must be null or a NUL-terminated string. Null is ignored.
#[no_mangle]
pub unsafe extern "C" fn llmodel_set_implementation_search_path(path: *const c_char) {
    guard(ptr::null_mut(), (), || {
        implementation::set_implementations_search_path(cstr_to_str(path, "path")?);
        Ok(())
    })
}

/// The current search path. The string stays valid until the next call of
/// this function on the same thread.
#[no_mangle]
pub extern "C" fn llmodel_get_implementation_search_path() -> *const c_char {
    guard(ptr::null_mut(), ptr::null(), || {
        let current =
            CString::new(implementation::implementations_search_path()).unwrap_or_default();
        Ok(SEARCH_PATH.with(|cell| {
            let mut slot = cell.borrow_mut();
            *slot = current;
            slot.as_ptr()
        }))
    })
}
