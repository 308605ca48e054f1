//! Memory tiers and the allocator that falls back between them.
//!
//! A [`MemoryTier`] names the memory properties an array wants plus the buffer
//! usage it needs. When a device has no matching memory type, or allocation at
//! the matching type fails, [`allocate`] logs one warning and retries with the
//! tier's fallback. Chains are short and always end at a tier with no fallback.

use std::fmt;

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{Result, VulkanError};

/// Named memory class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryTier {
    Host,
    HostCoherent,
    HostCached,
    Unified,
    Device,
    DeviceOnly,
}

/// Static policy of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTierSpec {
    pub memory: vk::MemoryPropertyFlags,
    pub usage: vk::BufferUsageFlags,
    pub fallback: Option<MemoryTier>,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 6] = [
        MemoryTier::Host,
        MemoryTier::HostCoherent,
        MemoryTier::HostCached,
        MemoryTier::Unified,
        MemoryTier::Device,
        MemoryTier::DeviceOnly,
    ];

    pub fn spec(self) -> MemoryTierSpec {
        use vk::BufferUsageFlags as U;
        use vk::MemoryPropertyFlags as M;
        let (memory, usage, fallback) = match self {
            MemoryTier::Host => (M::HOST_VISIBLE, U::empty(), None),
            MemoryTier::HostCoherent => (
                M::HOST_VISIBLE | M::HOST_COHERENT,
                U::TRANSFER_SRC,
                Some(MemoryTier::Host),
            ),
            MemoryTier::HostCached => (
                M::HOST_VISIBLE | M::HOST_CACHED,
                U::TRANSFER_DST,
                Some(MemoryTier::Host),
            ),
            MemoryTier::Unified => (M::DEVICE_LOCAL | M::HOST_VISIBLE, U::empty(), None),
            MemoryTier::Device => (
                M::DEVICE_LOCAL,
                U::TRANSFER_SRC | U::TRANSFER_DST,
                Some(MemoryTier::Host),
            ),
            MemoryTier::DeviceOnly => (M::DEVICE_LOCAL, U::empty(), Some(MemoryTier::Host)),
        };
        MemoryTierSpec { memory, usage, fallback }
    }

    pub fn fallback(self) -> Option<MemoryTier> {
        self.spec().fallback
    }

    /// This tier followed by every tier it can fall back to.
    pub fn fallback_chain(self) -> Vec<MemoryTier> {
        std::iter::successors(Some(self), |t| t.fallback()).collect()
    }

    fn name(self) -> &'static str {
        match self {
            MemoryTier::Host => "host",
            MemoryTier::HostCoherent => "host-coherent",
            MemoryTier::HostCached => "host-cached",
            MemoryTier::Unified => "unified",
            MemoryTier::Device => "device",
            MemoryTier::DeviceOnly => "device-only",
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device memory granted to one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub memory_type: u32,
    /// Tier actually granted, which differs from the request after fallback.
    pub tier: MemoryTier,
    pub flags: vk::MemoryPropertyFlags,
    pub size: u64,
}

impl Allocation {
    pub fn is_host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// Lowest memory-type index allowed by `type_bits` whose flags contain `required`.
pub fn select_memory_type(
    types: &[vk::MemoryPropertyFlags],
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    types
        .iter()
        .enumerate()
        .take(32)
        .find(|(i, flags)| type_bits & (1 << i) != 0 && flags.contains(required))
        .map(|(i, _)| i as u32)
}

/// Allocate memory for `buffer` at `desired` (plus `extra` property flags),
/// walking the fallback chain on failure.
///
/// The memory is not bound; the caller binds it and owns it from here on.
pub fn allocate(
    device: &Device,
    buffer: vk::Buffer,
    desired: MemoryTier,
    extra: vk::MemoryPropertyFlags,
) -> Result<Allocation> {
    let driver = device.driver();
    let req = driver.memory_requirements(buffer);
    let mut tier = desired;

    loop {
        let required = tier.spec().memory | extra;
        let attempt = match select_memory_type(device.memory_types(), req.memory_type_bits, required) {
            None => Err(format!("no memory type with {required:?}")),
            Some(index) => driver
                .allocate_memory(req.size, index)
                .map(|memory| (memory, index))
                .map_err(|e| format!("allocating {} bytes in type {index}: {e}", req.size)),
        };

        match attempt {
            Ok((memory, memory_type)) => {
                let flags = device.memory_flags(memory_type);
                device.logger().scope(|| {
                    tracing::trace!(tier = %tier, memory_type, bytes = req.size, "allocated")
                });
                return Ok(Allocation { memory, memory_type, tier, flags, size: req.size });
            }
            Err(reason) => match tier.fallback() {
                Some(next) => {
                    device.logger().scope(|| {
                        tracing::warn!(
                            desired = %tier,
                            fallback = %next,
                            reason = %reason,
                            "memory tier unavailable, falling back"
                        )
                    });
                    tier = next;
                }
                None => return Err(VulkanError::OutOfDeviceMemory { tier: desired, reason }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogLevel, Logger};
    use crate::mock::MockDriver;
    use vk::MemoryPropertyFlags as M;

    fn device_with(mock: &MockDriver) -> (Device, crate::log::SharedBuffer) {
        let (logger, buffer) = Logger::capture(LogLevel::Warn);
        (Device::new(mock.clone(), logger).unwrap(), buffer)
    }

    fn buffer(device: &Device, size: u64) -> vk::Buffer {
        device.driver().create_buffer(size, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap()
    }

    #[test]
    fn test_chains_terminate() {
        for tier in MemoryTier::ALL {
            let chain = tier.fallback_chain();
            assert!(chain.len() <= MemoryTier::ALL.len());
            assert_eq!(chain[0], tier);
            assert!(chain.last().unwrap().fallback().is_none());
        }
        assert_eq!(MemoryTier::Device.fallback_chain(), vec![MemoryTier::Device, MemoryTier::Host]);
    }

    #[test]
    fn test_select_lowest_matching() {
        let types = [M::DEVICE_LOCAL, M::HOST_VISIBLE | M::HOST_COHERENT, M::HOST_VISIBLE];
        assert_eq!(select_memory_type(&types, 0b111, M::HOST_VISIBLE), Some(1));
        assert_eq!(select_memory_type(&types, 0b101, M::HOST_VISIBLE), Some(2));
        assert_eq!(select_memory_type(&types, 0b111, M::HOST_CACHED), None);
        assert_eq!(select_memory_type(&types, 0b111, M::empty()), Some(0));
    }

    #[test]
    fn test_preferred_tier_without_warning() {
        let mock = MockDriver::discrete();
        let (device, log) = device_with(&mock);
        let buf = buffer(&device, 256);
        let alloc = allocate(&device, buf, MemoryTier::Device, M::empty()).unwrap();
        assert_eq!(alloc.tier, MemoryTier::Device);
        assert_eq!(alloc.memory_type, 0);
        assert!(!alloc.is_host_visible());
        assert_eq!(log.warnings(), 0);
        device.driver().free_memory(alloc.memory);
        device.driver().destroy_buffer(buf);
    }

    #[test]
    fn test_fallback_logs_one_warning() {
        let mock = MockDriver::host_only();
        let (device, log) = device_with(&mock);
        let buf = buffer(&device, 64);
        let alloc = allocate(&device, buf, MemoryTier::Device, M::empty()).unwrap();
        assert_eq!(alloc.tier, MemoryTier::Host);
        assert!(alloc.is_host_visible());
        assert_eq!(log.warnings(), 1);
        let text = log.contents();
        assert!(text.contains("desired=device") && text.contains("fallback=host"), "{text}");
        device.driver().free_memory(alloc.memory);
        device.driver().destroy_buffer(buf);
    }

    #[test]
    fn test_every_fallback_tier_warns_once() {
        let mock = MockDriver::new(vec![M::HOST_VISIBLE]);
        for tier in MemoryTier::ALL.into_iter().filter(|t| t.fallback().is_some()) {
            let (device, log) = device_with(&mock);
            let buf = buffer(&device, 64);
            let alloc = allocate(&device, buf, tier, M::empty()).unwrap();
            assert_eq!(alloc.tier, MemoryTier::Host, "{tier}");
            assert_eq!(log.warnings(), 1, "{tier}");
            assert!(log.contents().contains(&format!("desired={tier}")), "{tier}");
            device.driver().free_memory(alloc.memory);
            device.driver().destroy_buffer(buf);
        }
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_allocation_failure_falls_back() {
        let mock = MockDriver::discrete();
        mock.exhaust_memory_type(0);
        let (device, log) = device_with(&mock);
        let buf = buffer(&device, 64);
        let alloc = allocate(&device, buf, MemoryTier::DeviceOnly, M::empty()).unwrap();
        assert_eq!(alloc.tier, MemoryTier::Host);
        assert_eq!(alloc.memory_type, 1);
        assert_eq!(log.warnings(), 1);
        device.driver().free_memory(alloc.memory);
        device.driver().destroy_buffer(buf);
    }

    #[test]
    fn test_terminal_tier_fails() {
        let mock = MockDriver::new(Vec::new());
        let (device, log) = device_with(&mock);
        let buf = buffer(&device, 64);
        let err = allocate(&device, buf, MemoryTier::Device, M::empty()).unwrap_err();
        assert!(matches!(err, VulkanError::OutOfDeviceMemory { tier: MemoryTier::Device, .. }));
        // Device -> Host is announced; Host has nowhere left to go.
        assert_eq!(log.warnings(), 1);
        let err = allocate(&device, buf, MemoryTier::Unified, M::empty()).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(log.warnings(), 1);
        assert_eq!(mock.live_allocations(), 0);
        device.driver().destroy_buffer(buf);
    }

    #[test]
    fn test_extra_flags_narrow_selection() {
        let mock = MockDriver::discrete();
        let (device, _log) = device_with(&mock);
        let buf = buffer(&device, 64);
        let alloc = allocate(&device, buf, MemoryTier::Host, M::HOST_CACHED).unwrap();
        assert_eq!(alloc.memory_type, 2);
        assert!(alloc.flags.contains(M::HOST_CACHED));
        device.driver().free_memory(alloc.memory);
        device.driver().destroy_buffer(buf);
    }

    #[test]
    fn test_tier_display_matches_serde() {
        for tier in MemoryTier::ALL {
            let json = serde_json::to_string(&tier).unwrap();
            assert_eq!(json, format!("\"{tier}\""));
        }
    }
}
