//! The seam between the compute core and the Vulkan API.
//!
//! Arrays, transfers and programs never touch `ash` directly; they go through
//! [`Driver`]. The production implementation is [`crate::ash_driver::AshDriver`];
//! tests run against the in-process mock.
//!
//! Every method mirrors one Vulkan entry point (or a fixed, tiny sequence of
//! them) and returns the raw `vk::Result` on failure. Callers own the
//! sequencing: nothing here waits, fences or retries on its own.

use std::ffi::CStr;

use ash::vk;

use crate::device::DeviceInfo;

pub type VkResult<T> = Result<T, vk::Result>;

/// Queue a command buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Compute,
    Transfer,
}

/// Descriptor flavour of a bound resource. Storage buffers are the only
/// resources bound today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DescriptorKind {
    #[default]
    StorageBuffer,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// One descriptor update: `binding` of the set points at `range` bytes of
/// `buffer` starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// Position of one specialization constant inside [`SpecializationData::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecEntry {
    pub constant_id: u32,
    pub offset: u32,
    pub size: usize,
}

/// Packed specialization constants plus their map entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecializationData {
    pub entries: Vec<SpecEntry>,
    pub data: Vec<u8>,
}

impl SpecializationData {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of constant `id`, if present.
    pub fn constant(&self, id: u32) -> Option<&[u8]> {
        let entry = self.entries.iter().find(|e| e.constant_id == id)?;
        let start = entry.offset as usize;
        self.data.get(start..start + entry.size)
    }
}

/// Everything needed to create one compute pipeline.
pub struct ComputePipelineDesc<'a> {
    pub layout: vk::PipelineLayout,
    pub cache: vk::PipelineCache,
    pub module: vk::ShaderModule,
    pub entry_point: &'a CStr,
    pub specialization: &'a SpecializationData,
}

/// GPU API surface used by the compute core.
///
/// Implementations must be usable from any thread, but a single device is
/// driven by one thread at a time; the only internal synchronisation expected
/// is around queue submission and command-pool access.
pub trait Driver: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Property flags of every memory type, indexed by memory-type id.
    fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags>;

    // ── Buffers & memory ────────────────────────────────────────────────────
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(&self, size: u64, memory_type: u32) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<*mut u8>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Make host writes to non-coherent memory visible to the device.
    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Make device writes to non-coherent memory visible to the host.
    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;

    // ── Pipeline objects ────────────────────────────────────────────────────
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    /// One binding per slot, binding index = slot index, compute stage only.
    fn create_descriptor_set_layout(
        &self,
        slots: &[DescriptorKind],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// Pool for exactly one set holding `count` descriptors of `kind`.
    fn create_descriptor_pool(
        &self,
        kind: DescriptorKind,
        count: u32,
    ) -> VkResult<vk::DescriptorPool>;
    /// Also frees every set allocated from the pool.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);
    fn create_pipeline_cache(&self) -> VkResult<vk::PipelineCache>;
    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);
    /// `push_constant_size == 0` omits the push-constant range.
    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // ── Commands & queues ───────────────────────────────────────────────────
    fn allocate_command_buffer(&self, queue: QueueKind) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, queue: QueueKind, cmd: vk::CommandBuffer);
    /// Resets and begins recording. `one_time` marks the buffer single-submit.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]);
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, grid: [u32; 3]);
    fn submit(&self, queue: QueueKind, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: QueueKind) -> VkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_constant_lookup() {
        let spec = SpecializationData {
            entries: vec![
                SpecEntry { constant_id: 0, offset: 0, size: 4 },
                SpecEntry { constant_id: 1, offset: 4, size: 4 },
            ],
            data: [32u32.to_ne_bytes(), 16u32.to_ne_bytes()].concat(),
        };
        assert_eq!(spec.constant(1), Some(&16u32.to_ne_bytes()[..]));
        assert_eq!(spec.constant(2), None);
        assert!(!spec.is_empty());
    }
}
