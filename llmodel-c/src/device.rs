//! Device enumeration and selection.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use tracing::debug;

use llmodel::{GpuDevice, LLModelError};

use crate::error::{cstr_to_str, guard};
use crate::model::{llmodel_model, wrapper};

/// One candidate device. Strings are duplicated with `strdup` and released by
/// [`llmodel_free_gpu_device_list`].
#[repr(C)]
#[derive(Debug)]
pub struct llmodel_gpu_device {
    pub backend: *const c_char,
    pub index: c_int,
    /// 0 other, 1 integrated GPU, 2 discrete GPU, 3 virtual GPU, 4 CPU.
    pub r#type: c_int,
    pub heap_size: usize,
    pub name: *const c_char,
    pub vendor: *const c_char,
}

unsafe fn dup(s: &str) -> *const c_char {
    let s = CString::new(s).unwrap_or_default();
    libc::strdup(s.as_ptr())
}

unsafe fn lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

impl llmodel_gpu_device {
    unsafe fn from_device(device: &GpuDevice) -> Self {
        Self {
            backend: dup(&device.backend),
            index: device.index,
            r#type: device.kind,
            heap_size: device.heap_size,
            name: dup(&device.name),
            vendor: dup(&device.vendor),
        }
    }

    unsafe fn to_device(&self) -> GpuDevice {
        GpuDevice {
            backend: lossy(self.backend),
            index: self.index,
            kind: self.r#type,
            heap_size: self.heap_size,
            name: lossy(self.name),
            vendor: lossy(self.vendor),
        }
    }
}

/// Devices with at least `memory_required` bytes available.
///
/// Returns null with `num_devices` set to 0 when none qualify. A non-null
/// result must be released with [`llmodel_free_gpu_device_list`].
///
/// # Safety
/// `model` must be a live handle and `num_devices` writable.
#[no_mangle]
pub unsafe extern "C" fn llmodel_available_gpu_devices(
    model: llmodel_model,
    memory_required: usize,
    num_devices: *mut c_int,
) -> *mut llmodel_gpu_device {
    let Some(num_devices) = num_devices.as_mut() else {
        return ptr::null_mut();
    };
    *num_devices = 0;

    guard(ptr::null_mut(), ptr::null_mut(), || {
        let devices = wrapper(model)?.model.available_gpu_devices(memory_required);
        debug!(count = devices.len(), memory_required, "devices enumerated");
        if devices.is_empty() {
            return Ok(ptr::null_mut());
        }

        let bytes = devices.len() * std::mem::size_of::<llmodel_gpu_device>();
        let out = libc::malloc(bytes) as *mut llmodel_gpu_device;
        if out.is_null() {
            return Err(LLModelError::invalid_argument("out of memory"));
        }
        for (i, device) in devices.iter().enumerate() {
            out.add(i).write(llmodel_gpu_device::from_device(device));
        }
        *num_devices = devices.len() as c_int;
        Ok(out)
    })
}

/// Release a list from [`llmodel_available_gpu_devices`] and its strings.
///
/// # Safety
/// `devices` must be null or a list of `num_devices` entries not yet released.
#[no_mangle]
pub unsafe extern "C" fn llmodel_free_gpu_device_list(
    devices: *mut llmodel_gpu_device,
    num_devices: c_int,
) {
    if devices.is_null() {
        return;
    }
    for i in 0..num_devices.max(0) as usize {
        let device = &*devices.add(i);
        for s in [device.backend, device.name, device.vendor] {
            libc::free(s as *mut libc::c_void);
        }
    }
    libc::free(devices as *mut libc::c_void);
}

/// Select the device matching `device`: `"cpu"`, `"gpu"`, a device name or a
/// vendor name.
///
/// # Safety
/// `model` must be a live handle and `device` a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llmodel_gpu_init_gpu_device_by_string(
    model: llmodel_model,
    memory_required: usize,
    device: *const c_char,
) -> bool {
    guard(ptr::null_mut(), false, || {
        let wrapper = wrapper(model)?;
        let query = cstr_to_str(device, "device")?;
        Ok(wrapper.model.init_gpu_device_by_string(memory_required, query))
    })
}

/// Select a device previously returned by [`llmodel_available_gpu_devices`].
///
/// # Safety
/// `model` must be a live handle and `device` a valid descriptor.
#[no_mangle]
pub unsafe extern "C" fn llmodel_gpu_init_gpu_device_by_struct(
    model: llmodel_model,
    device: *const llmodel_gpu_device,
) -> bool {
    guard(ptr::null_mut(), false, || {
        let wrapper = wrapper(model)?;
        let device = device
            .as_ref()
            .ok_or_else(|| LLModelError::invalid_argument("'device' is NULL"))?
            .to_device();
        Ok(wrapper.model.init_gpu_device(&device))
    })
}

/// Select a device by index.
///
/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_gpu_init_gpu_device_by_int(
    model: llmodel_model,
    device: c_int,
) -> bool {
    guard(ptr::null_mut(), false, || {
        Ok(wrapper(model)?.model.init_gpu_device_by_index(device))
    })
}

/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_has_gpu_device(model: llmodel_model) -> bool {
    guard(ptr::null_mut(), false, || Ok(wrapper(model)?.model.has_gpu_device()))
}
