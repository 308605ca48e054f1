use std::marker::PhantomData;
use std::mem::size_of;

use ash::vk;
use bytemuck::Pod;

use crate::array::{impl_buffer_array, ArrayFlags, BufferArray, HostArray, RawBuffer};
use crate::device::Device;
use crate::error::{Result, VulkanError};
use crate::memory::MemoryTier;
use crate::transfer::{copy_buffer, CopyRegion};

/// Array that prefers device-local memory and mirrors data to and from the host.
///
/// Whether a transfer maps the memory directly or bounces through a staging
/// array is decided by the memory actually granted, so the same code runs on
/// discrete GPUs and on unified-memory devices.
pub struct DeviceArray<T: Pod> {
    raw: RawBuffer,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Pod> DeviceArray<T> {
    pub fn new(device: &Device, len: usize) -> Result<Self> {
        Self::with_tier(device, len, MemoryTier::Device)
    }

    pub fn with_tier(device: &Device, len: usize, tier: MemoryTier) -> Result<Self> {
        Self::with_flags(device, len, tier, ArrayFlags::default())
    }

    pub fn with_flags(device: &Device, len: usize, tier: MemoryTier, flags: ArrayFlags) -> Result<Self> {
        let flags = ArrayFlags {
            usage: flags.usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            ..flags
        };
        let raw = RawBuffer::new(device, RawBuffer::bytes_for::<T>(len)?, tier, flags)?;
        Ok(DeviceArray { raw, len, _elem: PhantomData })
    }

    pub fn from_slice(device: &Device, data: &[T]) -> Result<Self> {
        let mut array = Self::new(device, data.len())?;
        array.from_host(data)?;
        Ok(array)
    }

    /// Array whose element `i` is `f(i)`, filled through a staging array.
    pub fn from_fn(device: &Device, len: usize, mut f: impl FnMut(usize) -> T) -> Result<Self> {
        let array = Self::new(device, len)?;
        let mut staging = HostArray::<T>::new(device, len, MemoryTier::HostCoherent)?;
        for (i, slot) in staging.iter_mut().enumerate() {
            *slot = f(i);
        }
        staging.flush()?;
        let region = CopyRegion { size: array.raw.size(), ..Default::default() };
        copy_buffer(device, staging.buffer(), array.raw.buffer(), region)?;
        Ok(array)
    }

    /// Overwrite the first `src.len()` elements.
    #[allow(clippy::wrong_self_convention)]
    pub fn from_host(&mut self, src: &[T]) -> Result<()> {
        self.from_host_at(src, 0)
    }

    /// Overwrite elements `[offset, offset + src.len())`.
    #[allow(clippy::wrong_self_convention)]
    pub fn from_host_at(&mut self, src: &[T], offset: usize) -> Result<()> {
        let end = offset.checked_add(src.len()).filter(|&end| end <= self.len).ok_or(
            VulkanError::InvalidRange { begin: offset, end: offset.saturating_add(src.len()), len: self.len },
        )?;
        if src.is_empty() {
            return Ok(());
        }
        let bytes: &[u8] = bytemuck::cast_slice(src);
        let start = offset * size_of::<T>();

        if self.raw.is_host_visible() {
            return self.raw.write_mapped(|mapped| {
                mapped[start..start + bytes.len()].copy_from_slice(bytes);
            });
        }

        let staging = HostArray::from_slice(self.raw.device(), src, MemoryTier::HostCoherent)?;
        let region = CopyRegion { src_offset: 0, dst_offset: start as u64, size: bytes.len() as u64 };
        copy_buffer(self.raw.device(), staging.buffer(), self.raw.buffer(), region)
    }

    /// Copy the whole array into `dst`, which must hold at least `len` elements.
    pub fn to_host(&self, dst: &mut [T]) -> Result<()> {
        self.range_to_host(0, self.len, dst)
    }

    /// Like [`to_host`](Self::to_host), converting each element with `f` on the way out.
    pub fn to_host_with<U>(&self, dst: &mut [U], mut f: impl FnMut(T) -> U) -> Result<()> {
        if dst.len() < self.len {
            return Err(VulkanError::DestinationTooSmall { required: self.len, actual: dst.len() });
        }
        self.with_host_bytes(0, self.len, |bytes| {
            for (out, chunk) in dst.iter_mut().zip(bytes.chunks_exact(size_of::<T>())) {
                *out = f(bytemuck::pod_read_unaligned(chunk));
            }
        })
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.range_to_vec(0, self.len)
    }

    /// Copy elements `[begin, end)` into the front of `dst`.
    pub fn range_to_host(&self, begin: usize, end: usize, dst: &mut [T]) -> Result<()> {
        self.check_range(begin, end)?;
        let count = end - begin;
        if dst.len() < count {
            return Err(VulkanError::DestinationTooSmall { required: count, actual: dst.len() });
        }
        self.with_host_bytes(begin, end, |bytes| {
            bytemuck::cast_slice_mut::<T, u8>(&mut dst[..count]).copy_from_slice(bytes);
        })
    }

    pub fn range_to_vec(&self, begin: usize, end: usize) -> Result<Vec<T>> {
        self.check_range(begin, end)?;
        let mut out = vec![T::zeroed(); end - begin];
        self.range_to_host(begin, end, &mut out)?;
        Ok(out)
    }

    fn check_range(&self, begin: usize, end: usize) -> Result<()> {
        if begin < end && end <= self.len {
            Ok(())
        } else {
            Err(VulkanError::InvalidRange { begin, end, len: self.len })
        }
    }

    /// Run `f` over the bytes of `[begin, end)` as the host sees them, mapping
    /// directly when possible and reading back through host-cached staging
    /// otherwise.
    fn with_host_bytes<R>(&self, begin: usize, end: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let (start, stop) = (begin * size_of::<T>(), end * size_of::<T>());
        if self.raw.is_host_visible() {
            return self.raw.read_mapped(|mapped| f(&mapped[start..stop]));
        }

        let device = self.raw.device();
        let staging = HostArray::<T>::new(device, end - begin, MemoryTier::HostCached)?;
        let region = CopyRegion { src_offset: start as u64, dst_offset: 0, size: (stop - start) as u64 };
        copy_buffer(device, self.raw.buffer(), staging.buffer(), region)?;
        staging.invalidate()?;
        Ok(f(bytemuck::cast_slice(&staging[..])))
    }
}

impl_buffer_array!(DeviceArray);

impl<T: Pod> std::fmt::Debug for DeviceArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceArray")
            .field("len", &self.len)
            .field("tier", &self.raw.tier())
            .field("host_visible", &self.raw.is_host_visible())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::QueueKind;
    use crate::log::{LogLevel, Logger};
    use crate::mock::MockDriver;

    fn device(mock: &MockDriver) -> Device {
        Device::new(mock.clone(), Logger::disabled()).unwrap()
    }

    fn round_trip(mock: MockDriver) {
        let device = device(&mock);
        let mut a = DeviceArray::<f32>::new(&device, 64).unwrap();
        a.from_host(&[1.0; 64]).unwrap();
        let doubled: Vec<f32> = a.to_vec().unwrap().iter().map(|x| x * 2.0).collect();
        a.from_host(&doubled).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![2.0; 64]);
    }

    #[test]
    fn test_round_trip_through_staging() {
        let mock = MockDriver::discrete();
        round_trip(mock.clone());
        assert!(mock.submissions(QueueKind::Transfer) >= 4);
    }

    #[test]
    fn test_round_trip_mapped() {
        let mock = MockDriver::integrated();
        round_trip(mock.clone());
        assert_eq!(mock.submissions(QueueKind::Transfer), 0);
    }

    #[test]
    fn test_from_host_at_offset() {
        for mock in [MockDriver::discrete(), MockDriver::integrated()] {
            let device = device(&mock);
            let mut a = DeviceArray::<u32>::new(&device, 6).unwrap();
            a.from_host(&[0; 6]).unwrap();
            a.from_host_at(&[7, 8], 3).unwrap();
            assert_eq!(a.to_vec().unwrap(), vec![0, 0, 0, 7, 8, 0]);
            let err = a.from_host_at(&[1, 2], 5).unwrap_err();
            assert!(matches!(err, VulkanError::InvalidRange { begin: 5, end: 7, len: 6 }));
            let err = a.from_host_at(&[1, 2], usize::MAX).unwrap_err();
            assert!(matches!(err, VulkanError::InvalidRange { begin: usize::MAX, end: usize::MAX, len: 6 }));
        }
    }

    #[test]
    fn test_range_readback() {
        let mock = MockDriver::discrete();
        let device = device(&mock);
        let a = DeviceArray::from_fn(&device, 32, |i| i as i32).unwrap();
        let mut dst = [0i32; 10];
        assert!(matches!(
            a.range_to_host(5, 5, &mut dst),
            Err(VulkanError::InvalidRange { begin: 5, end: 5, len: 32 })
        ));
        a.range_to_host(10, 20, &mut dst).unwrap();
        assert_eq!(dst.to_vec(), (10..20).collect::<Vec<_>>());
        assert!(a.range_to_vec(30, 33).is_err());
        let mut small = [0i32; 3];
        assert!(matches!(
            a.range_to_host(0, 4, &mut small),
            Err(VulkanError::DestinationTooSmall { required: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_from_fn_generator() {
        let mock = MockDriver::discrete();
        let device = device(&mock);
        let a = DeviceArray::from_fn(&device, 100, |i| i as u32).unwrap();
        assert_eq!(a.to_vec().unwrap(), (0..100).collect::<Vec<u32>>());
    }

    #[test]
    fn test_to_host_with_converts() {
        let mock = MockDriver::discrete();
        let device = device(&mock);
        let a = DeviceArray::from_slice(&device, &[0.25f32, 0.5, 1.0]).unwrap();
        let mut bytes = [0u8; 3];
        a.to_host_with(&mut bytes, |x| (x * 255.0) as u8).unwrap();
        assert_eq!(bytes, [63, 127, 255]);
        let mut short = [0u8; 2];
        assert!(a.to_host_with(&mut short, |x| x as u8).is_err());
    }

    #[test]
    fn test_fallback_to_host_memory() {
        let mock = MockDriver::host_only();
        let (logger, log) = Logger::capture(LogLevel::Warn);
        let device = Device::new(mock.clone(), logger).unwrap();
        let mut a = DeviceArray::<f32>::new(&device, 8).unwrap();
        assert_eq!(log.warnings(), 1);
        assert_eq!(a.tier(), MemoryTier::Host);
        assert!(a.is_host_visible());
        a.from_host(&[3.0; 8]).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![3.0; 8]);
    }

    #[test]
    fn test_no_memory_at_all() {
        let mock = MockDriver::new(Vec::new());
        let device = device(&mock);
        let err = DeviceArray::<f32>::new(&device, 8).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(mock.live_buffers(), 0);
    }

    #[test]
    fn test_staging_arrays_are_released() {
        let mock = MockDriver::discrete();
        let device = device(&mock);
        let mut a = DeviceArray::<u64>::new(&device, 16).unwrap();
        let baseline = mock.live_objects();
        a.from_host(&[1; 16]).unwrap();
        let _ = a.to_vec().unwrap();
        assert_eq!(mock.live_objects(), baseline);
        drop(a);
        assert_eq!(mock.live_objects(), 1);
    }
}
