use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use bytemuck::Pod;

use crate::array::{impl_buffer_array, ArrayFlags, RawBuffer};
use crate::device::Device;
use crate::error::{Result, VulkanError};
use crate::memory::MemoryTier;

/// Array in host-visible memory, mapped from construction until drop.
///
/// Derefs to `[T]`. Host access and device work on the same array are not
/// fenced against each other; finish the dispatch before reading.
pub struct HostArray<T: Pod> {
    raw: RawBuffer,
    len: usize,
    ptr: NonNull<T>,
    _elem: PhantomData<T>,
}

impl<T: Pod> HostArray<T> {
    /// Zero-initialised array of `len` elements.
    pub fn new(device: &Device, len: usize, tier: MemoryTier) -> Result<Self> {
        Self::with_flags(device, len, tier, ArrayFlags::default())
    }

    pub fn with_flags(device: &Device, len: usize, tier: MemoryTier, flags: ArrayFlags) -> Result<Self> {
        let mut raw = RawBuffer::new(device, RawBuffer::bytes_for::<T>(len)?, tier, flags)?;
        if !raw.is_host_visible() {
            return Err(VulkanError::NotHostVisible { tier: raw.tier() });
        }
        let ptr = raw.map_persistent()?.cast::<T>();
        let mut array = HostArray { raw, len, ptr, _elem: PhantomData };
        array.fill(T::zeroed());
        Ok(array)
    }

    pub fn filled(device: &Device, len: usize, tier: MemoryTier, value: T) -> Result<Self> {
        let mut array = Self::new(device, len, tier)?;
        array.fill(value);
        array.flush()?;
        Ok(array)
    }

    pub fn from_slice(device: &Device, data: &[T], tier: MemoryTier) -> Result<Self> {
        let mut array = Self::new(device, data.len(), tier)?;
        array.copy_from_slice(data);
        array.flush()?;
        Ok(array)
    }

    /// Make host writes visible to the device. No-op on coherent memory.
    pub fn flush(&self) -> Result<()> {
        self.raw.flush()
    }

    /// Make device writes visible to the host. No-op on coherent memory.
    pub fn invalidate(&self) -> Result<()> {
        self.raw.invalidate()
    }
}

impl_buffer_array!(HostArray);

impl<T: Pod> Deref for HostArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `ptr` maps `len` elements for as long as `raw` is alive, and
        // the memory was zero-initialised at construction.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Pod> DerefMut for HostArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as for `deref`; `&mut self` makes this the only host view.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

// SAFETY: the mapping is owned by this array and only reached through it.
unsafe impl<T: Pod + Send> Send for HostArray<T> {}
unsafe impl<T: Pod + Sync> Sync for HostArray<T> {}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for HostArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostArray")
            .field("tier", &self.raw.tier())
            .field("data", &&self[..])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::BufferArray;
    use crate::log::Logger;
    use crate::mock::MockDriver;

    fn device(mock: &MockDriver) -> Device {
        Device::new(mock.clone(), Logger::disabled()).unwrap()
    }

    #[test]
    fn test_host_array_is_slice() {
        let mock = MockDriver::discrete();
        let device = device(&mock);
        let mut a = HostArray::<u32>::new(&device, 8, MemoryTier::HostCoherent).unwrap();
        assert_eq!(&a[..], &[0; 8]);
        for (i, x) in a.iter_mut().enumerate() {
            *x = i as u32 * 3;
        }
        assert_eq!(a[7], 21);
        assert_eq!(a.iter().sum::<u32>(), 84);
        assert_eq!(a.size_bytes(), 32);
        assert!(a.is_host_visible());
        assert_eq!(a.tier(), MemoryTier::HostCoherent);
    }

    #[test]
    fn test_filled_and_from_slice() {
        let mock = MockDriver::integrated();
        let device = device(&mock);
        let a = HostArray::filled(&device, 4, MemoryTier::Host, 1.5f32).unwrap();
        assert_eq!(&a[..], &[1.5; 4]);
        let b = HostArray::from_slice(&device, &[[1.0f32, 2.0, 3.0, 4.0]], MemoryTier::Unified).unwrap();
        assert_eq!(b[0][3], 4.0);
        assert_eq!(b.tier(), MemoryTier::Unified);
    }

    #[test]
    fn test_device_local_rejected() {
        let mock = MockDriver::discrete();
        let device = device(&mock);
        let baseline = mock.live_objects();
        let err = HostArray::<f32>::new(&device, 16, MemoryTier::Device).unwrap_err();
        assert!(matches!(err, VulkanError::NotHostVisible { tier: MemoryTier::Device }));
        assert_eq!(mock.live_objects(), baseline);
    }

    #[test]
    fn test_mapping_released_on_drop() {
        let mock = MockDriver::discrete();
        let device = device(&mock);
        let baseline = mock.live_objects();
        {
            let a = HostArray::<u8>::new(&device, 100, MemoryTier::HostCached).unwrap();
            assert_eq!(a.len(), 100);
            assert_eq!(mock.live_objects(), baseline + 2);
        }
        assert_eq!(mock.live_objects(), baseline);
    }
}
