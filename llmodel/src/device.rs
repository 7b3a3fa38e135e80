//! Compute device descriptors and host detection.

use once_cell::sync::Lazy;
use sysinfo::System;
use tracing::debug;

pub const DEVICE_TYPE_OTHER: i32 = 0;
pub const DEVICE_TYPE_INTEGRATED_GPU: i32 = 1;
pub const DEVICE_TYPE_DISCRETE_GPU: i32 = 2;
pub const DEVICE_TYPE_VIRTUAL_GPU: i32 = 3;
pub const DEVICE_TYPE_CPU: i32 = 4;

/// One candidate compute device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    /// Implementation that would drive the device.
    pub backend: String,
    pub index: i32,
    /// One of the `DEVICE_TYPE_*` constants.
    pub kind: i32,
    /// Usable memory in bytes.
    pub heap_size: usize,
    pub name: String,
    pub vendor: String,
}

impl GpuDevice {
    pub fn is_gpu(&self) -> bool {
        matches!(
            self.kind,
            DEVICE_TYPE_INTEGRATED_GPU | DEVICE_TYPE_DISCRETE_GPU | DEVICE_TYPE_VIRTUAL_GPU
        )
    }

    /// Whether `query` selects this device: `"cpu"`, `"gpu"`, the exact
    /// device name or the vendor, compared case-insensitively.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim();
        match query.to_ascii_lowercase().as_str() {
            "cpu" => self.kind == DEVICE_TYPE_CPU,
            "gpu" => self.is_gpu(),
            _ => {
                self.name.eq_ignore_ascii_case(query) || self.vendor.eq_ignore_ascii_case(query)
            }
        }
    }
}

struct HostCpu {
    brand: String,
    vendor: String,
    total_memory: u64,
    threads: usize,
}

static HOST_CPU: Lazy<HostCpu> = Lazy::new(|| {
    let sys = System::new_all();
    let (brand, vendor) = sys
        .cpus()
        .first()
        .map(|cpu| (cpu.brand().trim().to_string(), cpu.vendor_id().trim().to_string()))
        .unwrap_or_default();
    let host = HostCpu {
        brand: if brand.is_empty() { "CPU".to_string() } else { brand },
        vendor: if vendor.is_empty() { "unknown".to_string() } else { vendor },
        total_memory: sys.total_memory(),
        threads: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|_| sys.cpus().len().max(1)),
    };
    debug!(
        brand = %host.brand,
        vendor = %host.vendor,
        total_memory = host.total_memory,
        threads = host.threads,
        "detected host cpu"
    );
    host
});

/// Logical CPUs of the host, the default worker count of a model.
pub fn cpu_threads() -> usize {
    HOST_CPU.threads
}

/// Devices of this host usable by `backend`.
pub fn host_devices(backend: &str) -> Vec<GpuDevice> {
    vec![GpuDevice {
        backend: backend.to_string(),
        index: 0,
        kind: DEVICE_TYPE_CPU,
        heap_size: HOST_CPU.total_memory as usize,
        name: HOST_CPU.brand.clone(),
        vendor: HOST_CPU.vendor.clone(),
    }]
}

/// Keep the devices with at least `memory_required` bytes of heap.
pub fn with_headroom(devices: Vec<GpuDevice>, memory_required: usize) -> Vec<GpuDevice> {
    devices
        .into_iter()
        .filter(|d| d.heap_size >= memory_required)
        .collect()
}
