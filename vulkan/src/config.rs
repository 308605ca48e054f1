//! JSON configuration for instance creation, device selection and logging.
//!
//! Every field has a default, so `{}` is a valid file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::DeviceSelection;
use crate::error::{Result, VulkanError};
use crate::log::{LogConfig, LogSink};

/// Instance-level options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub app_name: String,
    /// Enable `VK_LAYER_KHRONOS_validation` when it is installed.
    pub validation: bool,
    /// Extra instance extensions. Missing ones are skipped with a warning.
    pub extensions: Vec<String>,
    /// Extra device extensions. Missing ones are skipped with a warning.
    pub device_extensions: Vec<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            app_name: "vuml".into(),
            validation: false,
            extensions: Vec::new(),
            device_extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VumlConfig {
    pub log: LogConfig,
    pub device: DeviceSelection,
    pub instance: InstanceConfig,
}

impl VumlConfig {
    /// Load and validate a config from a JSON file.
    pub fn from_json(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|source| VulkanError::ConfigRead { path: path.to_path_buf(), source })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: VumlConfig =
            serde_json::from_str(json).map_err(|e| VulkanError::config("json", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VulkanError::config("json", e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance.app_name.is_empty() || self.instance.app_name.contains('\0') {
            return Err(VulkanError::config(
                "instance.app_name",
                "must be non-empty and free of NUL bytes",
            ));
        }
        let mut names = self.instance.extensions.iter().chain(&self.instance.device_extensions);
        if let Some(bad) = names.find(|n| n.is_empty() || n.contains('\0')) {
            return Err(VulkanError::config("instance.extensions", format!("invalid name {bad:?}")));
        }
        if let LogSink::File(path) = &self.log.sink {
            if path.as_os_str().is_empty() {
                return Err(VulkanError::config("log.sink", "file path is empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::log::LogLevel;

    #[test]
    fn test_empty_object_is_default() {
        let cfg = VumlConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.device, DeviceSelection::Prefer(DeviceKind::Discrete));
        assert_eq!(cfg.log.level, LogLevel::Warn);
        assert_eq!(cfg.instance, InstanceConfig::default());
    }

    #[test]
    fn test_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vuml.json");
        fs::write(
            &path,
            r#"{
                "log": { "level": "debug", "sink": "stdout" },
                "device": { "index": 1 },
                "instance": { "app_name": "demo", "validation": true,
                              "device_extensions": ["VK_KHR_shader_float16_int8"] }
            }"#,
        )
        .unwrap();
        let cfg = VumlConfig::from_json(&path).unwrap();
        assert_eq!(cfg.log.level, LogLevel::Debug);
        assert_eq!(cfg.device, DeviceSelection::Index(1));
        assert!(cfg.instance.validation);
        assert_eq!(cfg.instance.app_name, "demo");
        assert_eq!(cfg.instance.device_extensions.len(), 1);
    }

    #[test]
    fn test_round_trip_through_string() {
        let mut cfg = VumlConfig::default();
        cfg.device = DeviceSelection::Prefer(DeviceKind::Integrated);
        let again = VumlConfig::from_json_str(&cfg.to_json_string().unwrap()).unwrap();
        assert_eq!(again.device, cfg.device);
    }

    #[test]
    fn test_invalid_values() {
        let err = VumlConfig::from_json_str(r#"{"instance":{"app_name":""}}"#).unwrap_err();
        assert!(matches!(err, VulkanError::Config { field: "instance.app_name", .. }));
        let err = VumlConfig::from_json_str(r#"{"instance":{"extensions":[""]}}"#).unwrap_err();
        assert!(matches!(err, VulkanError::Config { field: "instance.extensions", .. }));
        let err = VumlConfig::from_json_str(r#"{"log":{"level":"loud"}}"#).unwrap_err();
        assert!(matches!(err, VulkanError::Config { field: "json", .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = VumlConfig::from_json(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, VulkanError::ConfigRead { .. }));
    }
}
