//! vuml: Vulkan compute arrays and programs.
//!
//! An [`Instance`] enumerates GPUs and opens a [`Device`]. Arrays
//! ([`HostArray`], [`DeviceArray`], [`DeviceOnlyArray`]) allocate through a
//! tiered memory allocator that falls back to slower memory with a warning,
//! and a [`Program`] wraps one SPIR-V kernel whose pipeline is built on the
//! first [`Program::bind`] and replayed on every [`Program::run`].

pub mod array;
pub mod ash_driver;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod instance;
pub mod log;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod program;
pub mod transfer;

pub use array::{
    ArrayCursor, ArrayFlags, AsBinding, Binding, BufferArray, CursorRange, DeviceArray,
    DeviceOnlyArray, HostArray,
};
pub use config::{InstanceConfig, VumlConfig};
pub use device::{Device, DeviceInfo, DeviceKind, DeviceLimits, DeviceSelection};
pub use error::{Result, VulkanError};
pub use instance::Instance;
pub use log::{LogConfig, LogLevel, LogSink, Logger};
pub use memory::MemoryTier;
pub use program::{div_up, read_spirv, Program, SpecConstant, Specialization};
pub use transfer::{copy, copy_buffer, CopyRegion};
