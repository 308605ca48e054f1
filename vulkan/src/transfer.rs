//! Synchronous buffer-to-buffer copies on the transfer queue.

use std::mem::size_of;

use ash::vk;

use crate::array::{ArrayCursor, BufferArray, CursorRange};
use crate::device::Device;
use crate::driver::QueueKind;
use crate::error::{Result, VulkanError};

/// Byte region of one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

impl From<CopyRegion> for vk::BufferCopy {
    fn from(r: CopyRegion) -> Self {
        vk::BufferCopy { src_offset: r.src_offset, dst_offset: r.dst_offset, size: r.size }
    }
}

/// Copy `region` from `src` to `dst` and wait for the transfer queue to go idle.
///
/// The device's transfer command buffer is held for the whole call, so at most
/// one copy per device is in flight.
pub fn copy_buffer(device: &Device, src: vk::Buffer, dst: vk::Buffer, region: CopyRegion) -> Result<()> {
    let driver = device.driver();
    let cmd = device.transfer_command_buffer();
    driver.begin_command_buffer(*cmd, true)?;
    driver.cmd_copy_buffer(*cmd, src, dst, region.into());
    driver.end_command_buffer(*cmd)?;
    driver.submit(QueueKind::Transfer, *cmd)?;
    driver.queue_wait_idle(QueueKind::Transfer)?;
    device.logger().scope(|| {
        tracing::trace!(bytes = region.size, src = region.src_offset, dst = region.dst_offset, "buffer copy")
    });
    Ok(())
}

/// Copy the elements of `src` into the array behind `dst`, starting at `dst`.
///
/// The source buffer needs TRANSFER_SRC usage and the destination
/// TRANSFER_DST. `DeviceArray` always has both; host and device-only arrays
/// only get them from their tier or from [`crate::ArrayFlags::usage`].
pub fn copy<S, D>(src: CursorRange<'_, S>, dst: ArrayCursor<'_, D>) -> Result<()>
where
    S: BufferArray,
    D: BufferArray<Elem = S::Elem>,
{
    src.validate()?;
    let dst_end = dst.offset() + src.len();
    let dst_len = dst.array().len();
    if dst_end > dst_len {
        return Err(VulkanError::InvalidRange { begin: dst.offset(), end: dst_end, len: dst_len });
    }
    require_usage(src.array().usage(), vk::BufferUsageFlags::TRANSFER_SRC)?;
    require_usage(dst.array().usage(), vk::BufferUsageFlags::TRANSFER_DST)?;
    let region = CopyRegion {
        src_offset: src.begin().byte_offset(),
        dst_offset: dst.byte_offset(),
        size: (src.len() * size_of::<S::Elem>()) as u64,
    };
    copy_buffer(src.array().device(), src.array().buffer(), dst.array().buffer(), region)
}

fn require_usage(have: vk::BufferUsageFlags, usage: vk::BufferUsageFlags) -> Result<()> {
    if have.contains(usage) {
        Ok(())
    } else {
        Err(VulkanError::MissingUsage { usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayFlags, DeviceArray, DeviceOnlyArray, HostArray};
    use crate::log::Logger;
    use crate::memory::MemoryTier;
    use crate::mock::MockDriver;

    #[test]
    fn test_copy_between_arrays() {
        let mock = MockDriver::discrete();
        let device = Device::new(mock.clone(), Logger::disabled()).unwrap();
        let src = DeviceArray::from_fn(&device, 16, |i| i as u32).unwrap();
        let mut dst = DeviceArray::<u32>::new(&device, 8).unwrap();
        dst.from_host(&[99; 8]).unwrap();
        let before = mock.submissions(QueueKind::Transfer);

        copy((src.begin() + 4).until(src.begin() + 8), dst.cursor(2)).unwrap();
        assert_eq!(mock.submissions(QueueKind::Transfer), before + 1);
        assert_eq!(dst.to_vec().unwrap(), vec![99, 99, 4, 5, 6, 7, 99, 99]);
    }

    #[test]
    fn test_copy_bounds() {
        let mock = MockDriver::discrete();
        let device = Device::new(mock.clone(), Logger::disabled()).unwrap();
        let src = DeviceArray::<f32>::new(&device, 16).unwrap();
        let dst = DeviceOnlyArray::<f32>::with_tier(&device, 4, MemoryTier::Device).unwrap();
        let err = copy(src.begin().until(src.begin() + 5), dst.begin()).unwrap_err();
        assert!(matches!(err, VulkanError::InvalidRange { begin: 0, end: 5, len: 4 }));
        let err = copy(src.begin().until(src.begin()), dst.begin()).unwrap_err();
        assert!(matches!(err, VulkanError::InvalidRange { .. }));
        assert_eq!(mock.submissions(QueueKind::Transfer), 0);
    }

    #[test]
    fn test_copy_needs_transfer_usage() {
        let mock = MockDriver::discrete();
        let device = Device::new(mock.clone(), Logger::disabled()).unwrap();
        let src = DeviceArray::from_fn(&device, 4, |i| i as u32).unwrap();
        let scratch = DeviceOnlyArray::<u32>::new(&device, 4).unwrap();
        let before = mock.submissions(QueueKind::Transfer);
        let err = copy(src.begin().until(src.end()), scratch.begin()).unwrap_err();
        assert!(matches!(err, VulkanError::MissingUsage { usage } if usage == vk::BufferUsageFlags::TRANSFER_DST));

        let host = HostArray::<u32>::new(&device, 4, MemoryTier::Host).unwrap();
        let err = copy(host.begin().until(host.end()), src.begin()).unwrap_err();
        assert!(matches!(err, VulkanError::MissingUsage { usage } if usage == vk::BufferUsageFlags::TRANSFER_SRC));
        assert_eq!(mock.submissions(QueueKind::Transfer), before);

        let flags = ArrayFlags::usage(vk::BufferUsageFlags::TRANSFER_DST);
        let scratch = DeviceOnlyArray::<u32>::with_flags(&device, 4, MemoryTier::DeviceOnly, flags).unwrap();
        copy(src.begin().until(src.end()), scratch.begin()).unwrap();
        assert_eq!(mock.submissions(QueueKind::Transfer), before + 1);
    }

    #[test]
    fn test_transfer_buffer_is_reused() {
        let mock = MockDriver::discrete();
        let device = Device::new(mock.clone(), Logger::disabled()).unwrap();
        let a = DeviceArray::<u8>::new(&device, 4).unwrap();
        let b = DeviceArray::<u8>::new(&device, 4).unwrap();
        let region = CopyRegion { size: 4, ..Default::default() };
        for _ in 0..3 {
            copy_buffer(&device, a.buffer(), b.buffer(), region).unwrap();
        }
        assert_eq!(mock.submissions(QueueKind::Transfer), 3);
        assert_eq!(mock.live_command_buffers(), 1);
    }
}
