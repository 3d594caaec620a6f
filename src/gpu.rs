//! GPU detection
//!
//! Detects available GPUs via nvidia-smi so runtime configs can be validated
//! before a server process is spawned against a device that does not exist.
//! VRAM totals are captured per device because layer offload sizing depends
//! on how much memory a card actually has.

use std::process::Command;
use std::sync::OnceLock;

/// Cached GPU information detected at startup
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

/// A single GPU as reported by nvidia-smi
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    /// Device index (what CUDA_VISIBLE_DEVICES refers to)
    pub index: u32,
    /// Total VRAM in MiB
    pub memory_total_mib: u64,
}

/// Information about GPUs visible to this process
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    /// Usable devices in nvidia-smi order
    pub devices: Vec<GpuDevice>,
    /// Comma-separated string for CUDA_VISIBLE_DEVICES
    pub cuda_visible_devices: String,
}

impl GpuInfo {
    /// Get the number of available GPUs
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// Check if a user-provided gpu_id refers to a real device
    pub fn is_valid_gpu_id(&self, gpu_id: u32) -> bool {
        (gpu_id as usize) < self.devices.len()
    }

    /// Get the CUDA_VISIBLE_DEVICES value for a specific gpu_id
    /// User provides a position (0, 1, 2...), we return the actual index
    pub fn get_cuda_device(&self, gpu_id: u32) -> Option<String> {
        self.devices
            .get(gpu_id as usize)
            .map(|d| d.index.to_string())
    }

    /// Total VRAM across all detected devices, in MiB
    pub fn total_memory_mib(&self) -> u64 {
        self.devices.iter().map(|d| d.memory_total_mib).sum()
    }
}

/// Parse one csv,noheader,nounits line of `index,memory.total` output
///
/// Expected shape: `0, 24576`. Malformed lines are skipped rather than
/// failing the whole detection pass.
fn parse_gpu_line(line: &str) -> Option<GpuDevice> {
    let mut parts = line.split(',');
    let index = parts.next()?.trim().parse::<u32>().ok()?;
    let memory_total_mib = parts.next()?.trim().parse::<u64>().ok()?;
    Some(GpuDevice {
        index,
        memory_total_mib,
    })
}

/// Detect available GPUs using nvidia-smi
///
/// Returns an empty GpuInfo if nvidia-smi is missing or fails, in which case
/// only CPU runtimes (gpu_layers = 0, no gpu_id) can be started.
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let devices: Vec<GpuDevice> = stdout.lines().filter_map(parse_gpu_line).collect();

            let cuda_visible_devices = devices
                .iter()
                .map(|d| d.index.to_string())
                .collect::<Vec<_>>()
                .join(",");

            tracing::info!(
                gpu_count = devices.len(),
                cuda_visible_devices = %cuda_visible_devices,
                total_memory_mib = devices.iter().map(|d| d.memory_total_mib).sum::<u64>(),
                "Detected available GPUs"
            );

            GpuInfo {
                devices,
                cuda_visible_devices,
            }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                stderr = %stderr,
                "nvidia-smi failed, assuming no GPUs available"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to run nvidia-smi, assuming no GPUs available"
            );
            GpuInfo::default()
        }
    }
}

/// Initialize GPU detection (call once at startup)
pub fn init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}

/// Get cached GPU info (panics if init() wasn't called)
pub fn get() -> &'static GpuInfo {
    GPU_INFO
        .get()
        .expect("GPU detection not initialized - call gpu::init() first")
}

/// Get cached GPU info, or detect if not initialized
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}
