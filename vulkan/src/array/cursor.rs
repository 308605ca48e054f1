use std::cmp::Ordering;
use std::fmt;
use std::mem::size_of;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::ptr;

use crate::array::{AsBinding, Binding, BufferArray};
use crate::driver::DescriptorKind;
use crate::error::{Result, VulkanError};

/// Element position inside one array.
///
/// Cursors on different arrays never compare equal and have no ordering;
/// subtracting them is a logic error and panics.
pub struct ArrayCursor<'a, A: BufferArray> {
    array: &'a A,
    offset: usize,
}

impl<'a, A: BufferArray> ArrayCursor<'a, A> {
    pub fn new(array: &'a A, offset: usize) -> Self {
        ArrayCursor { array, offset }
    }

    pub fn array(&self) -> &'a A {
        self.array
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn byte_offset(&self) -> u64 {
        (self.offset * size_of::<A::Elem>()) as u64
    }

    pub fn same_array(&self, other: &Self) -> bool {
        ptr::eq(self.array, other.array)
    }

    /// Half-open range from this cursor up to `end`.
    ///
    /// # Panics
    /// If `end` points into another array or before `self`.
    pub fn until(self, end: ArrayCursor<'a, A>) -> CursorRange<'a, A> {
        let _ = end - self;
        CursorRange { begin: self, end }
    }
}

impl<A: BufferArray> Clone for ArrayCursor<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: BufferArray> Copy for ArrayCursor<'_, A> {}

impl<A: BufferArray> fmt::Debug for ArrayCursor<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayCursor")
            .field("array", &(self.array as *const A))
            .field("offset", &self.offset)
            .finish()
    }
}

impl<A: BufferArray> PartialEq for ArrayCursor<'_, A> {
    fn eq(&self, other: &Self) -> bool {
        self.same_array(other) && self.offset == other.offset
    }
}

impl<A: BufferArray> PartialOrd for ArrayCursor<'_, A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.same_array(other) {
            Some(self.offset.cmp(&other.offset))
        } else {
            None
        }
    }
}

impl<A: BufferArray> Add<usize> for ArrayCursor<'_, A> {
    type Output = Self;

    fn add(self, n: usize) -> Self {
        ArrayCursor { array: self.array, offset: self.offset + n }
    }
}

impl<A: BufferArray> Sub<usize> for ArrayCursor<'_, A> {
    type Output = Self;

    fn sub(self, n: usize) -> Self {
        ArrayCursor { array: self.array, offset: self.offset - n }
    }
}

impl<A: BufferArray> AddAssign<usize> for ArrayCursor<'_, A> {
    fn add_assign(&mut self, n: usize) {
        self.offset += n;
    }
}

impl<A: BufferArray> SubAssign<usize> for ArrayCursor<'_, A> {
    fn sub_assign(&mut self, n: usize) {
        self.offset -= n;
    }
}

/// Element distance between two cursors on the same array.
impl<A: BufferArray> Sub for ArrayCursor<'_, A> {
    type Output = usize;

    fn sub(self, rhs: Self) -> usize {
        assert!(self.same_array(&rhs), "cursor difference across different arrays");
        self.offset
            .checked_sub(rhs.offset)
            .unwrap_or_else(|| panic!("cursor at {} is before cursor at {}", self.offset, rhs.offset))
    }
}

/// `[begin, end)` on one array; bindable as a sub-range and usable as a copy source.
pub struct CursorRange<'a, A: BufferArray> {
    begin: ArrayCursor<'a, A>,
    end: ArrayCursor<'a, A>,
}

impl<'a, A: BufferArray> CursorRange<'a, A> {
    pub fn begin(&self) -> ArrayCursor<'a, A> {
        self.begin
    }

    pub fn end(&self) -> ArrayCursor<'a, A> {
        self.end
    }

    pub fn array(&self) -> &'a A {
        self.begin.array
    }

    pub fn len(&self) -> usize {
        self.end.offset - self.begin.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        (self.len() * size_of::<A::Elem>()) as u64
    }

    /// Checks the range is non-empty and inside the array.
    pub fn validate(&self) -> Result<()> {
        let (begin, end, len) = (self.begin.offset, self.end.offset, self.array().len());
        if begin < end && end <= len {
            Ok(())
        } else {
            Err(VulkanError::InvalidRange { begin, end, len })
        }
    }
}

impl<A: BufferArray> Clone for CursorRange<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: BufferArray> Copy for CursorRange<'_, A> {}

impl<A: BufferArray> fmt::Debug for CursorRange<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CursorRange({}..{})", self.begin.offset, self.end.offset)
    }
}

impl<A: BufferArray> AsBinding for CursorRange<'_, A> {
    fn binding(&self) -> Result<Binding> {
        self.validate()?;
        Ok(Binding {
            buffer: self.array().buffer(),
            offset: self.begin.byte_offset(),
            range: self.size_bytes(),
            kind: DescriptorKind::StorageBuffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DeviceOnlyArray;
    use crate::device::Device;
    use crate::log::Logger;
    use crate::mock::MockDriver;

    fn device() -> Device {
        Device::new(MockDriver::discrete(), Logger::disabled()).unwrap()
    }

    #[test]
    fn test_cursor_arithmetic() {
        let device = device();
        let a = DeviceOnlyArray::<f32>::new(&device, 32).unwrap();
        let mut c = a.begin() + 4;
        assert_eq!(c.offset(), 4);
        assert_eq!(c.byte_offset(), 16);
        c += 6;
        c -= 2;
        assert_eq!(c, a.cursor(8));
        assert_eq!(a.end() - c, 24);
        assert_eq!((a.end() - 1).offset(), 31);
        assert!(a.begin() < c && c < a.end());
    }

    #[test]
    fn test_cursors_on_different_arrays() {
        let device = device();
        let a = DeviceOnlyArray::<u32>::new(&device, 8).unwrap();
        let b = DeviceOnlyArray::<u32>::new(&device, 8).unwrap();
        assert_ne!(a.begin(), b.begin());
        assert_eq!(a.begin().partial_cmp(&b.begin()), None);
        assert!(!(a.begin() < b.end()));
    }

    #[test]
    #[should_panic(expected = "different arrays")]
    fn test_difference_across_arrays_panics() {
        let device = device();
        let a = DeviceOnlyArray::<u32>::new(&device, 8).unwrap();
        let b = DeviceOnlyArray::<u32>::new(&device, 8).unwrap();
        let _ = a.end() - b.begin();
    }

    #[test]
    #[should_panic(expected = "before")]
    fn test_negative_difference_panics() {
        let device = device();
        let a = DeviceOnlyArray::<u32>::new(&device, 8).unwrap();
        let _ = a.begin() - a.end();
    }

    #[test]
    fn test_range_binding() {
        let device = device();
        let a = DeviceOnlyArray::<[f32; 4]>::new(&device, 10).unwrap();
        let range = (a.begin() + 2).until(a.begin() + 5);
        assert_eq!(range.len(), 3);
        let binding = range.binding().unwrap();
        assert_eq!(binding.buffer, a.buffer());
        assert_eq!((binding.offset, binding.range), (32, 48));

        let whole = a.binding().unwrap();
        assert_eq!((whole.offset, whole.range), (0, 160));

        let past_end = (a.begin() + 8).until(a.begin() + 12);
        assert!(matches!(
            past_end.binding(),
            Err(VulkanError::InvalidRange { begin: 8, end: 12, len: 10 })
        ));
        let empty = a.begin().until(a.begin());
        assert!(empty.validate().is_err());
    }
}
