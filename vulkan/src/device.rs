//! Device handle shared by arrays and programs, and the read-only
//! capability record reported for each GPU.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::driver::{Driver, QueueKind};
use crate::error::{Result, VulkanError};
use crate::log::Logger;

/// Physical device category, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Other,
    Integrated,
    Discrete,
    Virtual,
    Cpu,
}

impl DeviceKind {
    pub fn from_vk(kind: vk::PhysicalDeviceType) -> Self {
        match kind {
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceKind::Integrated,
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceKind::Discrete,
            vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceKind::Virtual,
            vk::PhysicalDeviceType::CPU => DeviceKind::Cpu,
            _ => DeviceKind::Other,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Other => "other",
            DeviceKind::Integrated => "integrated",
            DeviceKind::Discrete => "discrete",
            DeviceKind::Virtual => "virtual",
            DeviceKind::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

/// Compute limits relevant to dispatch sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_work_group_size: [u32; 3],
    pub max_compute_work_group_invocations: u32,
    pub max_compute_shared_memory_size: u32,
    pub max_storage_buffer_range: u32,
    pub max_push_constants_size: u32,
}

impl Default for DeviceLimits {
    /// The minimums every Vulkan 1.0 implementation must support.
    fn default() -> Self {
        DeviceLimits {
            max_compute_work_group_count: [65535; 3],
            max_compute_work_group_size: [128, 128, 64],
            max_compute_work_group_invocations: 128,
            max_compute_shared_memory_size: 16384,
            max_storage_buffer_range: 1 << 27,
            max_push_constants_size: 128,
        }
    }
}

/// GPU device information.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub api_version_major: u32,
    pub api_version_minor: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub limits: DeviceLimits,
    /// `shaderFloat16` together with 16-bit storage-buffer access.
    pub supports_f16: bool,
    /// `shaderInt64`.
    pub supports_int64: bool,
}

impl DeviceInfo {
    pub fn from_vk(props: &vk::PhysicalDeviceProperties) -> Self {
        let name = props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let l = &props.limits;
        DeviceInfo {
            name,
            kind: DeviceKind::from_vk(props.device_type),
            api_version_major: vk::api_version_major(props.api_version),
            api_version_minor: vk::api_version_minor(props.api_version),
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            limits: DeviceLimits {
                max_compute_work_group_count: l.max_compute_work_group_count,
                max_compute_work_group_size: l.max_compute_work_group_size,
                max_compute_work_group_invocations: l.max_compute_work_group_invocations,
                max_compute_shared_memory_size: l.max_compute_shared_memory_size,
                max_storage_buffer_range: l.max_storage_buffer_range,
                max_push_constants_size: l.max_push_constants_size,
            },
            supports_f16: false,
            supports_int64: false,
        }
    }
}

/// Which physical device to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelection {
    /// First device of this kind, else the first device.
    Prefer(DeviceKind),
    /// Exact position in enumeration order.
    Index(usize),
}

impl Default for DeviceSelection {
    fn default() -> Self {
        DeviceSelection::Prefer(DeviceKind::Discrete)
    }
}

impl DeviceSelection {
    /// Position in `devices` this selection resolves to.
    pub fn choose(&self, devices: &[DeviceInfo]) -> Result<usize> {
        if devices.is_empty() {
            return Err(VulkanError::NoGpu);
        }
        match *self {
            DeviceSelection::Index(index) if index < devices.len() => Ok(index),
            DeviceSelection::Index(index) => {
                Err(VulkanError::DeviceIndex { index, count: devices.len() })
            }
            DeviceSelection::Prefer(kind) => {
                Ok(devices.iter().position(|d| d.kind == kind).unwrap_or(0))
            }
        }
    }
}

/// A logical device plus the state every array and program on it shares.
///
/// Cloning is cheap and yields another handle to the same device; the driver
/// is torn down when the last handle (including those held by arrays and
/// programs) is dropped. One thread should drive a device at a time.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    driver: Box<dyn Driver>,
    logger: Logger,
    info: DeviceInfo,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    /// Reused by every transfer; the lock is held for record + submit + wait.
    transfer_cmd: Mutex<vk::CommandBuffer>,
}

impl Device {
    pub fn new(driver: impl Driver + 'static, logger: Logger) -> Result<Self> {
        Self::from_boxed(Box::new(driver), logger)
    }

    pub fn from_boxed(driver: Box<dyn Driver>, logger: Logger) -> Result<Self> {
        let info = driver.info();
        let memory_types = driver.memory_types();
        let transfer_cmd = driver.allocate_command_buffer(QueueKind::Transfer)?;
        logger.scope(|| {
            tracing::debug!(
                device = %info.name,
                kind = %info.kind,
                memory_types = memory_types.len(),
                "device ready"
            )
        });
        Ok(Device {
            inner: Arc::new(DeviceInner {
                driver,
                logger,
                info,
                memory_types,
                transfer_cmd: Mutex::new(transfer_cmd),
            }),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Property flags of every memory type, indexed by memory-type id.
    pub fn memory_types(&self) -> &[vk::MemoryPropertyFlags] {
        &self.inner.memory_types
    }

    pub fn memory_flags(&self, memory_type: u32) -> vk::MemoryPropertyFlags {
        self.inner
            .memory_types
            .get(memory_type as usize)
            .copied()
            .unwrap_or_default()
    }

    /// True if both handles refer to the same logical device.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.inner.driver.as_ref()
    }

    pub(crate) fn transfer_command_buffer(&self) -> MutexGuard<'_, vk::CommandBuffer> {
        self.inner.transfer_cmd.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.info.name)
            .field("kind", &self.inner.info.kind)
            .finish()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let cmd = *self.transfer_cmd.get_mut().unwrap_or_else(|e| e.into_inner());
        self.driver.free_command_buffer(QueueKind::Transfer, cmd);
    }
}
