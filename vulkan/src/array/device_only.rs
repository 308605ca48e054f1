use std::marker::PhantomData;

use bytemuck::Pod;

use crate::array::{impl_buffer_array, ArrayFlags, RawBuffer};
use crate::device::Device;
use crate::error::Result;
use crate::memory::MemoryTier;

/// Device-local scratch memory. The library never transfers its contents;
/// kernels fill and consume it.
pub struct DeviceOnlyArray<T: Pod> {
    raw: RawBuffer,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Pod> DeviceOnlyArray<T> {
    pub fn new(device: &Device, len: usize) -> Result<Self> {
        Self::with_tier(device, len, MemoryTier::DeviceOnly)
    }

    pub fn with_tier(device: &Device, len: usize, tier: MemoryTier) -> Result<Self> {
        Self::with_flags(device, len, tier, ArrayFlags::default())
    }

    /// Pass transfer usage in `flags` to use the array with [`crate::transfer::copy`].
    pub fn with_flags(device: &Device, len: usize, tier: MemoryTier, flags: ArrayFlags) -> Result<Self> {
        let raw = RawBuffer::new(device, RawBuffer::bytes_for::<T>(len)?, tier, flags)?;
        Ok(DeviceOnlyArray { raw, len, _elem: PhantomData })
    }
}

impl_buffer_array!(DeviceOnlyArray);

impl<T: Pod> std::fmt::Debug for DeviceOnlyArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceOnlyArray")
            .field("len", &self.len)
            .field("tier", &self.raw.tier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::BufferArray;
    use crate::log::Logger;
    use crate::mock::MockDriver;

    #[test]
    fn test_device_only_defaults() {
        let mock = MockDriver::discrete();
        let device = Device::new(mock.clone(), Logger::disabled()).unwrap();
        let a = DeviceOnlyArray::<[f32; 4]>::new(&device, 320 * 240).unwrap();
        assert_eq!(a.len(), 76800);
        assert_eq!(a.size_bytes(), 1_228_800);
        assert_eq!(a.tier(), MemoryTier::DeviceOnly);
        assert!(!a.is_host_visible());
        assert_eq!(a.end().offset(), a.len());
        drop(a);
        assert_eq!(mock.live_buffers(), 0);
    }
}
