//! Vulkan instance bootstrap, physical-device enumeration and selection.

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use ash::vk;

use crate::ash_driver::AshDriver;
use crate::config::InstanceConfig;
use crate::device::{Device, DeviceInfo, DeviceSelection};
use crate::error::{Result, VulkanError};
use crate::log::Logger;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"vuml";

/// Loader entry and instance. Shared with every driver created from it, so
/// the instance outlives its devices.
pub(crate) struct InstanceInner {
    _entry: ash::Entry,
    pub(crate) instance: ash::Instance,
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
    }
}

/// A Vulkan instance and the GPUs it can see.
pub struct Instance {
    inner: Arc<InstanceInner>,
    logger: Logger,
    config: InstanceConfig,
    physical: Vec<vk::PhysicalDevice>,
    infos: Vec<DeviceInfo>,
}

impl Instance {
    pub fn new(config: &InstanceConfig, logger: Logger) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| VulkanError::Loading(e.to_string()))?;

        let available_layers: Vec<CString> = unsafe { entry.enumerate_instance_layer_properties()? }
            .iter()
            .filter_map(|l| l.layer_name_as_c_str().ok().map(CStr::to_owned))
            .collect();
        let available_exts: Vec<CString> = unsafe { entry.enumerate_instance_extension_properties(None)? }
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

        let mut layers = Vec::new();
        if config.validation {
            layers.extend(keep_available(&logger, "layer", &[VALIDATION_LAYER.to_owned()], &available_layers));
        }
        let requested = to_cstrings(&config.extensions)?;
        let mut extensions = keep_available(&logger, "instance extension", &requested, &available_exts);

        let mut flags = vk::InstanceCreateFlags::empty();
        let portability = ash::khr::portability_enumeration::NAME;
        if available_exts.iter().any(|e| e.as_c_str() == portability) {
            extensions.push(portability.to_owned());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let app_name = CString::new(config.app_name.as_str())
            .map_err(|_| VulkanError::config("instance.app_name", "contains a NUL byte"))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 1, 0));

        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|s| s.as_ptr()).collect();
        let ext_ptrs: Vec<*const c_char> = extensions.iter().map(|s| s.as_ptr()).collect();
        let create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&ext_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None)? };
        let inner = Arc::new(InstanceInner { _entry: entry, instance });

        let physical = unsafe { inner.instance.enumerate_physical_devices()? };
        if physical.is_empty() {
            return Err(VulkanError::NoGpu);
        }
        let infos: Vec<DeviceInfo> = physical.iter().map(|&pd| probe(&inner.instance, pd)).collect();

        logger.scope(|| {
            for (i, info) in infos.iter().enumerate() {
                tracing::debug!(index = i, name = %info.name, kind = %info.kind, "physical device");
            }
        });

        Ok(Instance { inner, logger, config: config.clone(), physical, infos })
    }

    /// Read-only description of every GPU, in enumeration order.
    pub fn physical_devices(&self) -> &[DeviceInfo] {
        &self.infos
    }

    /// Create a logical device for physical device `index`.
    pub fn open(&self, index: usize) -> Result<Device> {
        let physical = *self
            .physical
            .get(index)
            .ok_or(VulkanError::DeviceIndex { index, count: self.physical.len() })?;
        let driver = AshDriver::new(
            Arc::clone(&self.inner),
            physical,
            self.infos[index].clone(),
            &self.config.device_extensions,
            &self.logger,
        )?;
        Device::new(driver, self.logger.clone())
    }

    /// Logical devices for every GPU.
    pub fn devices(&self) -> Result<Vec<Device>> {
        (0..self.physical.len()).map(|i| self.open(i)).collect()
    }

    pub fn select(&self, selection: &DeviceSelection) -> Result<Device> {
        let index = selection.choose(&self.infos)?;
        self.open(index)
    }
}

/// Properties plus the optional features the compute path cares about.
fn probe(instance: &ash::Instance, pd: vk::PhysicalDevice) -> DeviceInfo {
    let props = unsafe { instance.get_physical_device_properties(pd) };
    let mut info = DeviceInfo::from_vk(&props);
    let features = unsafe { instance.get_physical_device_features(pd) };
    info.supports_int64 = features.shader_int64 == vk::TRUE;

    if props.api_version >= vk::API_VERSION_1_1 {
        let mut float16 = vk::PhysicalDeviceShaderFloat16Int8Features::default();
        let mut storage16 = vk::PhysicalDevice16BitStorageFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut float16)
            .push_next(&mut storage16);
        unsafe { instance.get_physical_device_features2(pd, &mut features2) };
        info.supports_f16 =
            float16.shader_float16 == vk::TRUE && storage16.storage_buffer16_bit_access == vk::TRUE;
    }
    info
}

pub(crate) fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|n| {
            CString::new(n.as_str())
                .map_err(|_| VulkanError::config("instance.extensions", format!("{n:?} contains a NUL byte")))
        })
        .collect()
}

/// Requested names that are available; the rest are dropped with a warning.
pub(crate) fn keep_available(
    logger: &Logger,
    what: &str,
    requested: &[CString],
    available: &[CString],
) -> Vec<CString> {
    requested
        .iter()
        .filter(|name| {
            let found = available.contains(name);
            if !found {
                logger.scope(|| tracing::warn!(name = ?name, "{what} not available, skipping"));
            }
            found
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogLevel;

    #[test]
    fn test_keep_available_warns_on_missing() {
        let (logger, log) = Logger::capture(LogLevel::Warn);
        let available = vec![c"VK_KHR_a".to_owned(), c"VK_KHR_b".to_owned()];
        let requested = vec![c"VK_KHR_b".to_owned(), c"VK_KHR_missing".to_owned()];
        let kept = keep_available(&logger, "instance extension", &requested, &available);
        assert_eq!(kept, vec![c"VK_KHR_b".to_owned()]);
        assert_eq!(log.warnings(), 1);
        assert!(log.contents().contains("VK_KHR_missing"));
    }

    #[test]
    fn test_to_cstrings_rejects_nul() {
        assert!(to_cstrings(&["VK_KHR_x".into()]).is_ok());
        assert!(to_cstrings(&["bad\0name".into()]).is_err());
    }

    #[test]
    fn test_instance_on_real_hardware() {
        // Skips quietly when no Vulkan loader or GPU is present.
        let instance = match Instance::new(&InstanceConfig::default(), Logger::disabled()) {
            Ok(i) => i,
            Err(_) => return,
        };
        assert!(!instance.physical_devices().is_empty());
        let device = match instance.select(&DeviceSelection::default()) {
            Ok(d) => d,
            Err(_) => return,
        };
        assert!(!device.memory_types().is_empty());
    }
}
