//! Thread-local error channel shared by every entry point.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

use llmodel::{LLModelError, Result};

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

/// Structured error filled in by `llmodel_model_create2`.
#[repr(C)]
pub struct llmodel_error {
    /// Human readable message, valid until the next error on this thread.
    pub message: *const c_char,
    /// errno-style code.
    pub code: c_int,
}

/// Replace this thread's last error and return a pointer to the stored copy.
fn store(message: &str) -> *const c_char {
    let cstr = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|cell| {
        let mut slot = cell.borrow_mut();
        *slot = cstr;
        slot.as_ptr()
    })
}

/// Record `message` and point `errptr` at it when `errptr` is not null.
pub(crate) fn set_error(errptr: *mut *const c_char, message: &str) {
    let ptr = store(message);
    if !errptr.is_null() {
        unsafe { *errptr = ptr };
    }
}

/// Record `err` and fill `error` with its message and code.
pub(crate) fn set_error_record(error: *mut llmodel_error, err: &LLModelError) {
    let ptr = store(&err.to_string());
    if !error.is_null() {
        unsafe {
            (*error).message = ptr;
            (*error).code = err.errno();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, turning a panic into an invalid-argument error.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = format!("internal error: {}", panic_message(payload.as_ref()));
        error!(%message, "panic caught at the C boundary");
        Err(LLModelError::invalid_argument(message))
    })
}

/// Run `f`, reporting an error or a panic through `errptr` and returning
/// `fallback` in either case.
pub(crate) fn guard<T>(
    errptr: *mut *const c_char,
    fallback: T,
    f: impl FnOnce() -> Result<T>,
) -> T {
    match catch_panic(f) {
        Ok(value) => value,
        Err(err) => {
            set_error(errptr, &err.to_string());
            fallback
        }
    }
}

/// Borrow a C string as UTF-8, `what` names the argument in the error.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn cstr_to_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(LLModelError::invalid_argument(format!("'{}' is NULL", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| LLModelError::invalid_argument(format!("'{}' is not valid UTF-8", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn read(ptr: *const c_char) -> String {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    #[test]
    fn latest_error_wins() {
        let mut err: *const c_char = ptr::null();
        set_error(&mut err, "first");
        assert_eq!(read(err), "first");
        set_error(&mut err, "second");
        assert_eq!(read(err), "second");
    }

    #[test]
    fn interior_nul_is_replaced() {
        let mut err: *const c_char = ptr::null();
        set_error(&mut err, "bad\0byte");
        assert_eq!(read(err), "bad byte");
    }

    #[test]
    fn guard_reports_panics() {
        let mut err: *const c_char = ptr::null();
        let value = guard(&mut err, -1, || -> Result<i32> { panic!("boom") });
        assert_eq!(value, -1);
        assert!(read(err).contains("boom"));
    }

    #[test]
    fn caught_panics_keep_their_message() {
        let err = catch_panic(|| -> Result<()> { panic!("bad header {}", 7) }).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(err.to_string().contains("internal error: bad header 7"));

        let err = catch_panic(|| -> Result<()> { std::panic::panic_any(42u8) }).unwrap_err();
        assert!(err.to_string().contains("unknown panic"));
    }

    #[test]
    fn errors_are_per_thread() {
        let mut err: *const c_char = ptr::null();
        set_error(&mut err, "main thread");
        std::thread::spawn(|| {
            let mut other: *const c_char = ptr::null();
            set_error(&mut other, "worker thread");
        })
        .join()
        .unwrap();
        assert_eq!(read(err), "main thread");
    }
}
