use candle_core::Device;
use tracing::{trace, warn};

#[cfg(any(feature = "metal", feature = "cuda"))]
use tracing::info;

#[cfg(not(any(feature = "metal", feature = "cuda")))]
use tracing::debug;

use super::error::ModelError;

/// Selects the compute device based on enabled features (falls back to CPU).
pub fn select_device() -> Result<Device, ModelError> {
    #[cfg(any(feature = "metal", feature = "cuda"))]
    let mut failures: Vec<String> = Vec::new();

    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    let failures: Vec<String> = Vec::new();

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Using CUDA GPU acceleration");
                return Ok(device);
            }
            Err(e) => {
                let msg = e.to_string();
                if cfg!(feature = "metal") {
                    warn!(error = %msg, "CUDA device unavailable, trying Metal");
                } else {
                    warn!(error = %msg, "CUDA device unavailable");
                }
                failures.push(format!("cuda failed: {msg}"));
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal GPU acceleration");
                return Ok(device);
            }
            Err(e) => {
                let msg = e.to_string();
                warn!(error = %msg, "Metal device unavailable");
                failures.push(format!("metal failed: {msg}"));
            }
        }
    }

    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        debug!("No GPU features enabled");
    }

    let reason = if !cfg!(any(feature = "metal", feature = "cuda")) {
        "no GPU backend compiled".to_string()
    } else if failures.is_empty() {
        "no GPU device available".to_string()
    } else {
        failures.join("; ")
    };

    warn!(reason = %reason, "Falling back to CPU device");
    Ok(Device::Cpu)
}

/// Best-effort reclamation pass after scoring or loading work.
///
/// Waits for queued kernels so that buffers released by dropped tensors return to the
/// allocator. Failures are logged and otherwise ignored.
pub fn reclaim_device_memory(device: &Device) {
    if device.is_cpu() {
        return;
    }

    match device.synchronize() {
        Ok(()) => trace!(?device, "Device memory reclamation pass complete"),
        Err(e) => warn!(error = %e, ?device, "Device synchronization failed during reclamation"),
    }
}
