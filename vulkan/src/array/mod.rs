//! Buffer-backed arrays.
//!
//! Every array owns exactly one buffer and the memory bound to it. The three
//! flavours differ only in how the host reaches the contents:
//!
//! - [`HostArray`]: host-visible memory, mapped for the array's whole life.
//! - [`DeviceArray`]: prefers device-local memory; transfers map directly when
//!   the granted memory is host-visible and go through a staging array otherwise.
//! - [`DeviceOnlyArray`]: device-local scratch the library never transfers.

mod cursor;
mod device_only;
mod host;
mod mirrored;

use std::mem::size_of;
use std::ptr::NonNull;

use ash::vk;
use bytemuck::Pod;

use crate::device::Device;
use crate::driver::DescriptorKind;
use crate::error::{Result, VulkanError};
use crate::memory::{self, Allocation, MemoryTier};

pub use cursor::{ArrayCursor, CursorRange};
pub use device_only::DeviceOnlyArray;
pub use host::HostArray;
pub use mirrored::DeviceArray;

/// Extra memory-property and buffer-usage flags requested on top of a tier's own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayFlags {
    pub memory: vk::MemoryPropertyFlags,
    pub usage: vk::BufferUsageFlags,
}

impl ArrayFlags {
    pub fn memory(memory: vk::MemoryPropertyFlags) -> Self {
        ArrayFlags { memory, ..Default::default() }
    }

    pub fn usage(usage: vk::BufferUsageFlags) -> Self {
        ArrayFlags { usage, ..Default::default() }
    }
}

/// Buffer plus its memory. Released exactly once, through [`RawBuffer::release`].
pub(crate) struct RawBuffer {
    device: Device,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    mapped: Option<NonNull<u8>>,
    size: u64,
    usage: vk::BufferUsageFlags,
}

impl RawBuffer {
    /// Create a `size`-byte storage buffer at `tier`, allocate and bind its memory.
    pub(crate) fn new(device: &Device, size: u64, tier: MemoryTier, flags: ArrayFlags) -> Result<Self> {
        if size == 0 {
            return Err(VulkanError::EmptyArray);
        }
        let driver = device.driver();
        let usage = tier.spec().usage | vk::BufferUsageFlags::STORAGE_BUFFER | flags.usage;
        let buffer = driver.create_buffer(size, usage)?;
        // From here on, dropping `raw` on an early return undoes whatever exists.
        let mut raw = RawBuffer { device: device.clone(), buffer, allocation: None, mapped: None, size, usage };
        let allocation = memory::allocate(device, buffer, tier, flags.memory)?;
        raw.allocation = Some(allocation);
        driver.bind_buffer_memory(buffer, allocation.memory)?;
        Ok(raw)
    }

    /// Byte size for `len` elements of `T`.
    pub(crate) fn bytes_for<T>(len: usize) -> Result<u64> {
        len.checked_mul(size_of::<T>())
            .map(|n| n as u64)
            .ok_or(VulkanError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    fn memory(&self) -> vk::DeviceMemory {
        self.allocation.map_or(vk::DeviceMemory::null(), |a| a.memory)
    }

    pub(crate) fn tier(&self) -> MemoryTier {
        self.allocation.map_or(MemoryTier::Host, |a| a.tier)
    }

    pub(crate) fn flags(&self) -> vk::MemoryPropertyFlags {
        self.allocation.map_or(vk::MemoryPropertyFlags::empty(), |a| a.flags)
    }

    pub(crate) fn is_host_visible(&self) -> bool {
        self.flags().contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn is_coherent(&self) -> bool {
        self.flags().contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Map the whole buffer until release. Repeated calls return the same pointer.
    pub(crate) fn map_persistent(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }
        let ptr = self
            .device
            .driver()
            .map_memory(self.memory(), 0, self.size)
            .map_err(VulkanError::MapFailed)?;
        let ptr = NonNull::new(ptr).ok_or(VulkanError::MapFailed(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    /// Map, hand the contents to `f`, unmap. Device writes are made visible first.
    pub(crate) fn read_mapped<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let driver = self.device.driver();
        let ptr = driver.map_memory(self.memory(), 0, self.size).map_err(VulkanError::MapFailed)?;
        let result = (|| -> Result<R> {
            if !self.is_coherent() {
                driver.invalidate_memory(self.memory())?;
            }
            // SAFETY: the driver mapped `size` bytes at `ptr`; the mapping lives
            // until the unmap below.
            let bytes = unsafe { std::slice::from_raw_parts(ptr, self.size as usize) };
            Ok(f(bytes))
        })();
        driver.unmap_memory(self.memory());
        result
    }

    /// Map, let `f` write, flush if needed, unmap.
    pub(crate) fn write_mapped<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let driver = self.device.driver();
        let ptr = driver.map_memory(self.memory(), 0, self.size).map_err(VulkanError::MapFailed)?;
        // SAFETY: as in `read_mapped`; `&mut self` rules out other host views.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, self.size as usize) };
        let result = f(bytes);
        let flushed = if self.is_coherent() { Ok(()) } else { driver.flush_memory(self.memory()) };
        driver.unmap_memory(self.memory());
        flushed?;
        Ok(result)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        if self.is_coherent() {
            return Ok(());
        }
        Ok(self.device.driver().flush_memory(self.memory())?)
    }

    pub(crate) fn invalidate(&self) -> Result<()> {
        if self.is_coherent() {
            return Ok(());
        }
        Ok(self.device.driver().invalidate_memory(self.memory())?)
    }

    /// Unmap, free the memory, destroy the buffer. Safe on partial state.
    fn release(&mut self) {
        let driver = self.device.driver();
        if let Some(allocation) = self.allocation.take() {
            if self.mapped.take().is_some() {
                driver.unmap_memory(allocation.memory);
            }
            driver.free_memory(allocation.memory);
        }
        if self.buffer != vk::Buffer::null() {
            driver.destroy_buffer(self.buffer);
            self.buffer = vk::Buffer::null();
        }
    }
}

// SAFETY: the mapped pointer is only dereferenced through the owning array,
// whose borrow rules already serialise host access.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Common surface of the three array flavours.
pub trait BufferArray {
    type Elem: Pod;

    fn device(&self) -> &Device;
    fn buffer(&self) -> vk::Buffer;
    /// Logical element count.
    fn len(&self) -> usize;
    /// Tier actually granted.
    fn tier(&self) -> MemoryTier;
    fn memory_flags(&self) -> vk::MemoryPropertyFlags;
    /// Usage flags the buffer was created with.
    fn usage(&self) -> vk::BufferUsageFlags;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn size_bytes(&self) -> u64 {
        (self.len() * size_of::<Self::Elem>()) as u64
    }

    fn is_host_visible(&self) -> bool {
        self.memory_flags().contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn begin(&self) -> ArrayCursor<'_, Self>
    where
        Self: Sized,
    {
        ArrayCursor::new(self, 0)
    }

    fn end(&self) -> ArrayCursor<'_, Self>
    where
        Self: Sized,
    {
        ArrayCursor::new(self, self.len())
    }

    fn cursor(&self, offset: usize) -> ArrayCursor<'_, Self>
    where
        Self: Sized,
    {
        ArrayCursor::new(self, offset)
    }
}

macro_rules! impl_buffer_array {
    ($ty:ident) => {
        impl<T: bytemuck::Pod> $crate::array::BufferArray for $ty<T> {
            type Elem = T;

            fn device(&self) -> &$crate::device::Device {
                self.raw.device()
            }

            fn buffer(&self) -> ash::vk::Buffer {
                self.raw.buffer()
            }

            fn len(&self) -> usize {
                self.len
            }

            fn tier(&self) -> $crate::memory::MemoryTier {
                self.raw.tier()
            }

            fn memory_flags(&self) -> ash::vk::MemoryPropertyFlags {
                self.raw.flags()
            }

            fn usage(&self) -> ash::vk::BufferUsageFlags {
                self.raw.usage()
            }
        }
    };
}
pub(crate) use impl_buffer_array;

/// One storage-buffer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
    pub kind: DescriptorKind,
}

/// Anything a program can bind: a whole array or a cursor range of one.
pub trait AsBinding {
    fn binding(&self) -> Result<Binding>;
}

impl<A: BufferArray> AsBinding for A {
    fn binding(&self) -> Result<Binding> {
        Ok(Binding {
            buffer: self.buffer(),
            offset: 0,
            range: self.size_bytes(),
            kind: DescriptorKind::StorageBuffer,
        })
    }
}
