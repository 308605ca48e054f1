//! Error type shared by every layer of the crate.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::memory::MemoryTier;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VulkanError>;

/// Error type for Vulkan operations.
#[derive(Debug, Error)]
pub enum VulkanError {
    /// Vulkan API returned an error code.
    #[error("{}", describe_vk(.0))]
    Vk(#[from] vk::Result),

    /// The Vulkan loader library could not be found or opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No Vulkan-capable GPU found.
    #[error("No Vulkan-capable GPU found")]
    NoGpu,

    /// No compute queue family found.
    #[error("No compute queue family found")]
    NoComputeQueue,

    /// Explicit device index past the end of the enumerated list.
    #[error("Device index {index} out of range ({count} devices available)")]
    DeviceIndex { index: usize, count: usize },

    /// Every tier of the fallback chain failed.
    #[error("Out of device memory: no memory for tier {tier} or any fallback ({reason})")]
    OutOfDeviceMemory { tier: MemoryTier, reason: String },

    /// A host-side array landed in memory the host cannot map.
    #[error("Memory granted for tier {tier} is not host-visible")]
    NotHostVisible { tier: MemoryTier },

    /// Zero-byte buffers are not allowed by Vulkan.
    #[error("Arrays must hold at least one byte")]
    EmptyArray,

    /// Element range outside the array, or empty.
    #[error("Invalid element range [{begin}, {end}) for an array of {len} elements")]
    InvalidRange { begin: usize, end: usize, len: usize },

    /// Host destination slice cannot hold the transferred elements.
    #[error("Destination holds {actual} elements, {required} required")]
    DestinationTooSmall { required: usize, actual: usize },

    /// Buffer mapping failed.
    #[error("Failed to map device memory: {0}")]
    MapFailed(vk::Result),

    /// Kernel binary could not be read.
    #[error("Cannot open kernel `{path}`: {source}")]
    KernelLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Compute pipeline creation failed.
    #[error("Compute pipeline build failed: {0}")]
    PipelineBuild(vk::Result),

    /// Resource count differs from the count the pipeline was built for.
    #[error("Program was built for {expected} bound resources, got {actual}")]
    BindingCount { expected: usize, actual: usize },

    /// Push-constant block unusable with this device.
    #[error("Push-constant block of {size} bytes is invalid (multiple of 4, at most {max} bytes)")]
    PushConstants { size: usize, max: u32 },

    /// A copy endpoint was created without the transfer usage it needs.
    #[error("Buffer lacks {usage:?} usage; create the array with transfer usage flags")]
    MissingUsage { usage: vk::BufferUsageFlags },

    /// `submit` called before anything was recorded.
    #[error("No dispatch recorded; call bind() first")]
    NotRecorded,

    /// A configuration field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    Config { field: &'static str, reason: String },

    /// A configuration or log file could not be opened.
    #[error("Cannot open `{path}`: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VulkanError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        VulkanError::Config { field, reason: reason.into() }
    }

    /// True for errors that mean the device ran out of memory.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            VulkanError::OutOfDeviceMemory { .. }
                | VulkanError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
                | VulkanError::Vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        )
    }
}

fn describe_vk(code: &vk::Result) -> String {
    let code = *code;
    match code {
        vk::Result::ERROR_DEVICE_LOST => format!(
            "Vulkan error: {} ({}): GPU device lost, restart may be required",
            code,
            code.as_raw()
        ),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => format!(
            "Vulkan error: {} ({}): GPU out of memory, reduce allocation size",
            code,
            code.as_raw()
        ),
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            format!("Vulkan error: {} ({}): host out of memory", code, code.as_raw())
        }
        _ => format!("Vulkan error: {} ({})", code, code.as_raw()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_display_hints() {
        let lost = VulkanError::from(vk::Result::ERROR_DEVICE_LOST).to_string();
        assert!(lost.contains("device lost"), "{lost}");
        let oom = VulkanError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).to_string();
        assert!(oom.contains("out of memory"), "{oom}");
    }

    #[test]
    fn test_out_of_memory_classification() {
        let err = VulkanError::OutOfDeviceMemory {
            tier: MemoryTier::Device,
            reason: "none".into(),
        };
        assert!(err.is_out_of_memory());
        assert!(VulkanError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_out_of_memory());
        assert!(!VulkanError::NotRecorded.is_out_of_memory());
    }
}
