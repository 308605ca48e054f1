//! [`Driver`] on top of `ash`.

use std::ffi::{c_char, CStr, CString};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;

use crate::device::DeviceInfo;
use crate::driver::{
    ComputePipelineDesc, DescriptorKind, DescriptorWrite, Driver, QueueKind, VkResult,
};
use crate::error::{Result, VulkanError};
use crate::instance::{keep_available, to_cstrings, InstanceInner};
use crate::log::Logger;

const FLOAT16_INT8: &CStr = c"VK_KHR_shader_float16_int8";

/// Compute family: fewest capability bits among families that can run
/// compute, so dedicated async-compute families win over the universal one.
pub(crate) fn pick_compute_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, f)| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .min_by_key(|(_, f)| f.queue_flags.as_raw().count_ones())
        .map(|(i, _)| i as u32)
}

/// Transfer family: a DMA-only family if there is one, else `compute`.
pub(crate) fn pick_transfer_family(families: &[vk::QueueFamilyProperties], compute: u32) -> u32 {
    families
        .iter()
        .position(|f| {
            f.queue_count > 0
                && f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f.queue_flags.intersects(vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS)
        })
        .map_or(compute, |i| i as u32)
}

struct QueueSlot {
    family: u32,
    flags: vk::QueueFlags,
    queue: vk::Queue,
    pool: vk::CommandPool,
}

/// A logical device with one compute queue and, when the hardware has a
/// separate DMA family, one transfer queue.
pub struct AshDriver {
    /// Keeps the instance alive until the device is gone.
    _instance: Arc<InstanceInner>,
    physical: vk::PhysicalDevice,
    device: ash::Device,
    info: DeviceInfo,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    compute: QueueSlot,
    transfer: Option<QueueSlot>,
    /// Guards queue submission and command-pool allocation.
    lock: Mutex<()>,
}

impl AshDriver {
    pub(crate) fn new(
        instance: Arc<InstanceInner>,
        physical: vk::PhysicalDevice,
        info: DeviceInfo,
        extra_extensions: &[String],
        logger: &Logger,
    ) -> Result<Self> {
        let vki = &instance.instance;
        let families = unsafe { vki.get_physical_device_queue_family_properties(physical) };
        let compute_family = pick_compute_family(&families).ok_or(VulkanError::NoComputeQueue)?;
        let transfer_family = pick_transfer_family(&families, compute_family);

        let available: Vec<CString> = unsafe { vki.enumerate_device_extension_properties(physical)? }
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok().map(|s| s.to_owned()))
            .collect();
        let requested = to_cstrings(extra_extensions)?;
        let mut extensions = keep_available(logger, "device extension", &requested, &available);
        let mut enable = |name: &CStr| {
            if available.iter().any(|e| e.as_c_str() == name) && !extensions.iter().any(|e| e.as_c_str() == name) {
                extensions.push(name.to_owned());
            }
        };
        enable(ash::khr::portability_subset::NAME);
        if info.supports_f16 && info.api_version_minor < 2 {
            enable(FLOAT16_INT8);
        }
        let ext_ptrs: Vec<*const c_char> = extensions.iter().map(|s| s.as_ptr()).collect();

        let priority = [1.0f32];
        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_family)
            .queue_priorities(&priority)];
        if transfer_family != compute_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(transfer_family)
                    .queue_priorities(&priority),
            );
        }

        let features = vk::PhysicalDeviceFeatures::default().shader_int64(info.supports_int64);
        let mut float16 = vk::PhysicalDeviceShaderFloat16Int8Features::default().shader_float16(true);
        let mut storage16 =
            vk::PhysicalDevice16BitStorageFeatures::default().storage_buffer16_bit_access(true);
        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&ext_ptrs)
            .enabled_features(&features);
        if info.supports_f16 {
            create_info = create_info.push_next(&mut float16).push_next(&mut storage16);
        }

        let device = unsafe { vki.create_device(physical, &create_info, None)? };

        let mem_props = unsafe { vki.get_physical_device_memory_properties(physical) };
        let memory_types = mem_props.memory_types[..mem_props.memory_type_count as usize]
            .iter()
            .map(|t| t.property_flags)
            .collect();

        let compute = match create_slot(&device, compute_family, families[compute_family as usize].queue_flags) {
            Ok(slot) => slot,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };
        let transfer = if transfer_family != compute_family {
            match create_slot(&device, transfer_family, families[transfer_family as usize].queue_flags) {
                Ok(slot) => Some(slot),
                Err(e) => {
                    unsafe {
                        device.destroy_command_pool(compute.pool, None);
                        device.destroy_device(None);
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        logger.scope(|| {
            tracing::debug!(
                device = %info.name,
                compute_family,
                transfer_family,
                extensions = extensions.len(),
                f16 = info.supports_f16,
                int64 = info.supports_int64,
                "logical device created"
            )
        });

        Ok(AshDriver {
            _instance: instance,
            physical,
            device,
            info,
            memory_types,
            compute,
            transfer,
            lock: Mutex::new(()),
        })
    }

    fn slot(&self, queue: QueueKind) -> &QueueSlot {
        match queue {
            QueueKind::Transfer => self.transfer.as_ref().unwrap_or(&self.compute),
            QueueKind::Compute => &self.compute,
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Both families when they differ, so buffers need no ownership transfer.
    fn sharing_families(&self) -> Option<[u32; 2]> {
        self.transfer.as_ref().map(|t| [self.compute.family, t.family])
    }

    fn whole_range(memory: vk::DeviceMemory) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default().memory(memory).offset(0).size(vk::WHOLE_SIZE)
    }

    fn barrier(
        &self,
        queue: QueueKind,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        src: vk::AccessFlags,
    ) {
        let (dst_stage, dst) = barrier_destination(self.slot(queue).flags);
        let barrier = vk::MemoryBarrier::default().src_access_mask(src).dst_access_mask(dst);
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
    }
}

/// Stages and accesses a barrier on a queue of family `flags` may wait in.
/// The compute-shader stage is only legal on compute-capable families.
pub(crate) fn barrier_destination(flags: vk::QueueFlags) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stages = vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::TRANSFER;
    let mut access = vk::AccessFlags::HOST_READ | vk::AccessFlags::TRANSFER_READ;
    if flags.contains(vk::QueueFlags::COMPUTE) {
        stages |= vk::PipelineStageFlags::COMPUTE_SHADER;
        access |= vk::AccessFlags::SHADER_READ;
    }
    (stages, access)
}

fn create_slot(device: &ash::Device, family: u32, flags: vk::QueueFlags) -> VkResult<QueueSlot> {
    let queue = unsafe { device.get_device_queue(family, 0) };
    let info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
    let pool = unsafe { device.create_command_pool(&info, None)? };
    Ok(QueueSlot { family, flags, queue, pool })
}

impl Driver for AshDriver {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags> {
        self.memory_types.clone()
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let families = self.sharing_families();
        let mut info = vk::BufferCreateInfo::default().size(size).usage(usage);
        info = match &families {
            Some(f) => info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(f),
            None => info.sharing_mode(vk::SharingMode::EXCLUSIVE),
        };
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, size: u64, memory_type: u32) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<*mut u8> {
        let ptr = unsafe {
            self.device.map_memory(memory, offset, size, vk::MemoryMapFlags::empty())?
        };
        Ok(ptr.cast())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.flush_mapped_memory_ranges(&[Self::whole_range(memory)]) }
    }

    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.invalidate_mapped_memory_ranges(&[Self::whole_range(memory)]) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        slots: &[DescriptorKind],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = slots
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(kind.to_vk())
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        kind: DescriptorKind,
        count: u32,
    ) -> VkResult<vk::DescriptorPool> {
        let sizes = [vk::DescriptorPoolSize { ty: kind.to_vk(), descriptor_count: count }];
        let info = vk::DescriptorPoolCreateInfo::default().max_sets(1).pool_sizes(&sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.into_iter().next().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
            .iter()
            .map(|w| [vk::DescriptorBufferInfo { buffer: w.buffer, offset: w.offset, range: w.range }])
            .collect();
        let vk_writes: Vec<_> = writes
            .iter()
            .zip(&infos)
            .map(|(w, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .descriptor_type(w.kind.to_vk())
                    .buffer_info(info)
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_pipeline_cache(&self) -> VkResult<vk::PipelineCache> {
        let info = vk::PipelineCacheCreateInfo::default();
        unsafe { self.device.create_pipeline_cache(&info, None) }
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: push_constant_size,
        }];
        let mut info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if push_constant_size > 0 {
            info = info.push_constant_ranges(&ranges);
        }
        unsafe { self.device.create_pipeline_layout(&info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> VkResult<vk::Pipeline> {
        let entries: Vec<vk::SpecializationMapEntry> = desc
            .specialization
            .entries
            .iter()
            .map(|e| vk::SpecializationMapEntry {
                constant_id: e.constant_id,
                offset: e.offset,
                size: e.size,
            })
            .collect();
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(&desc.specialization.data);
        let mut stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(desc.module)
            .name(desc.entry_point);
        if !desc.specialization.is_empty() {
            stage = stage.specialization_info(&spec_info);
        }
        let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(desc.layout);
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(desc.cache, &[info], None)
                .map_err(|(_, e)| e)?
        };
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn allocate_command_buffer(&self, queue: QueueKind) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.slot(queue).pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let _guard = self.guard();
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers.into_iter().next().ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, queue: QueueKind, cmd: vk::CommandBuffer) {
        let _guard = self.guard();
        unsafe { self.device.free_command_buffers(self.slot(queue).pool, &[cmd]) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> VkResult<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe {
            self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd, &info)
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    /// Records the copy followed by a barrier making its writes visible to
    /// the host and to later reads on the transfer queue. Copies are only
    /// ever recorded on transfer command buffers.
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
        self.barrier(QueueKind::Transfer, cmd, vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE);
    }

    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]) {
        unsafe {
            self.device.cmd_push_constants(cmd, layout, vk::ShaderStageFlags::COMPUTE, 0, data)
        };
    }

    /// Records the dispatch followed by a shader-write barrier.
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, grid: [u32; 3]) {
        unsafe { self.device.cmd_dispatch(cmd, grid[0], grid[1], grid[2]) };
        self.barrier(QueueKind::Compute, cmd, vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_WRITE);
    }

    fn submit(&self, queue: QueueKind, cmd: vk::CommandBuffer) -> VkResult<()> {
        let cmds = [cmd];
        let info = vk::SubmitInfo::default().command_buffers(&cmds);
        let _guard = self.guard();
        unsafe { self.device.queue_submit(self.slot(queue).queue, &[info], vk::Fence::null()) }
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> VkResult<()> {
        let _guard = self.guard();
        unsafe { self.device.queue_wait_idle(self.slot(queue).queue) }
    }
}

impl std::fmt::Debug for AshDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AshDriver")
            .field("device", &self.info.name)
            .field("physical", &self.physical)
            .field("compute_family", &self.compute.family)
            .field("transfer_family", &self.transfer.as_ref().map(|t| t.family))
            .finish()
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            if let Some(transfer) = self.transfer.take() {
                self.device.destroy_command_pool(transfer.pool, None);
            }
            self.device.destroy_command_pool(self.compute.pool, None);
            self.device.destroy_device(None);
        }
    }
}
