//! In-process [`Driver`] for tests and GPU-less development.
//!
//! Memory is plain host RAM, command buffers record a command list that runs
//! at submit time, and "kernels" are Rust closures registered against the
//! SPIR-V words they stand in for. Every created object is tracked so tests can
//! assert that nothing leaks.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk::{self, Handle};
use bytemuck::Pod;

use crate::device::{DeviceInfo, DeviceKind};
use crate::driver::{
    ComputePipelineDesc, DescriptorKind, DescriptorWrite, Driver, QueueKind, SpecializationData,
    VkResult,
};

type KernelFn = Arc<dyn Fn(&mut KernelInvocation) + Send + Sync>;

/// What a registered kernel sees for one dispatch.
#[derive(Debug, Clone)]
pub struct KernelInvocation {
    pub grid: [u32; 3],
    pub specialization: SpecializationData,
    pub push_constants: Vec<u8>,
    bindings: Vec<Vec<u8>>,
}

impl KernelInvocation {
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn binding(&self, slot: usize) -> &[u8] {
        &self.bindings[slot]
    }

    pub fn binding_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.bindings[slot]
    }

    /// Copy of the bound range of `slot` as `T` elements.
    pub fn read<T: Pod>(&self, slot: usize) -> Vec<T> {
        self.bindings[slot].chunks_exact(std::mem::size_of::<T>()).map(bytemuck::pod_read_unaligned).collect()
    }

    /// Overwrite the start of `slot` with `data`.
    pub fn write<T: Pod>(&mut self, slot: usize, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.bindings[slot][..bytes.len()].copy_from_slice(bytes);
    }

    pub fn spec_u32(&self, constant_id: u32) -> Option<u32> {
        let bytes = self.specialization.constant(constant_id)?;
        Some(bytemuck::pod_read_unaligned(bytes.get(..4)?))
    }

    /// Push-constant block reinterpreted as `T`.
    pub fn push<T: Pod>(&self) -> T {
        bytemuck::pod_read_unaligned(&self.push_constants[..std::mem::size_of::<T>()])
    }
}

/// One executed dispatch, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub grid: [u32; 3],
    pub specialization: SpecializationData,
    pub push_constants: Vec<u8>,
    pub bindings: Vec<(u32, u64, u64)>,
}

#[derive(Debug, Clone)]
enum Command {
    Copy { src: u64, dst: u64, region: vk::BufferCopy },
    Bind { pipeline: u64, set: u64 },
    Push(Vec<u8>),
    Dispatch([u32; 3]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
    Invalid,
}

struct MockCommandBuffer {
    queue: QueueKind,
    state: RecordState,
    one_time: bool,
    commands: Vec<Command>,
}

struct MockBuffer {
    size: u64,
    memory: Option<u64>,
}

struct MockMemory {
    // u128 keeps the backing 16-byte aligned for any Pod element type.
    words: Box<[u128]>,
    size: usize,
    memory_type: u32,
    mapped: bool,
}

impl MockMemory {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u128, u8>(&self.words[..])[..self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u128, u8>(&mut self.words[..])[..self.size]
    }
}

struct MockPipeline {
    code: Vec<u32>,
    specialization: SpecializationData,
}

#[derive(Default)]
struct MockState {
    info: DeviceInfo,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    exhausted: Vec<u32>,
    fail_pipelines: bool,
    next_handle: u64,

    buffers: HashMap<u64, MockBuffer>,
    memories: HashMap<u64, MockMemory>,
    modules: HashMap<u64, Vec<u32>>,
    set_layouts: HashMap<u64, usize>,
    pools: HashMap<u64, (u32, Vec<u64>)>,
    sets: HashMap<u64, Vec<DescriptorWrite>>,
    caches: HashMap<u64, ()>,
    pipeline_layouts: HashMap<u64, u32>,
    pipelines: HashMap<u64, MockPipeline>,
    command_buffers: HashMap<u64, MockCommandBuffer>,

    kernels: Vec<(Vec<u32>, KernelFn)>,
    dispatches: Vec<DispatchRecord>,
    submissions: HashMap<QueueKind, usize>,
    pipelines_built: usize,
    flushes: usize,
    invalidations: usize,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn buffer_memory(&self, buffer: u64) -> VkResult<(u64, u64)> {
        let buf = self.buffers.get(&buffer).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let mem = buf.memory.ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        Ok((mem, buf.size))
    }

    fn read_range(&self, buffer: u64, offset: u64, size: u64) -> VkResult<Vec<u8>> {
        let (mem, buf_size) = self.buffer_memory(buffer)?;
        if offset + size > buf_size {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let bytes = self.memories[&mem].bytes();
        Ok(bytes[offset as usize..(offset + size) as usize].to_vec())
    }

    fn write_range(&mut self, buffer: u64, offset: u64, data: &[u8]) -> VkResult<()> {
        let (mem, buf_size) = self.buffer_memory(buffer)?;
        if offset + data.len() as u64 > buf_size {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let bytes = self.memories.get_mut(&mem).ok_or(vk::Result::ERROR_DEVICE_LOST)?.bytes_mut();
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn execute(&mut self, commands: &[Command]) -> VkResult<()> {
        let mut bound: Option<(u64, u64)> = None;
        let mut push = Vec::new();
        for command in commands {
            match command {
                Command::Copy { src, dst, region } => {
                    let data = self.read_range(*src, region.src_offset, region.size)?;
                    self.write_range(*dst, region.dst_offset, &data)?;
                }
                Command::Bind { pipeline, set } => bound = Some((*pipeline, *set)),
                Command::Push(data) => push = data.clone(),
                Command::Dispatch(grid) => {
                    let (pipeline, set) = bound.ok_or(vk::Result::ERROR_DEVICE_LOST)?;
                    self.dispatch(pipeline, set, *grid, &push)?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, pipeline: u64, set: u64, grid: [u32; 3], push: &[u8]) -> VkResult<()> {
        let pipe = self.pipelines.get(&pipeline).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let code = pipe.code.clone();
        let specialization = pipe.specialization.clone();
        let mut writes = self.sets.get(&set).cloned().ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        writes.sort_by_key(|w| w.binding);

        let mut bindings = Vec::with_capacity(writes.len());
        for w in &writes {
            bindings.push(self.read_range(w.buffer.as_raw(), w.offset, w.range)?);
        }
        let mut invocation = KernelInvocation {
            grid,
            specialization: specialization.clone(),
            push_constants: push.to_vec(),
            bindings,
        };
        if let Some((_, kernel)) = self.kernels.iter().find(|(c, _)| *c == code) {
            kernel(&mut invocation);
        }
        for (w, data) in writes.iter().zip(&invocation.bindings) {
            self.write_range(w.buffer.as_raw(), w.offset, data)?;
        }
        self.dispatches.push(DispatchRecord {
            grid,
            specialization,
            push_constants: push.to_vec(),
            bindings: writes.iter().map(|w| (w.binding, w.offset, w.range)).collect(),
        });
        Ok(())
    }
}

/// Mock device. Clones share state, so a test keeps one clone for inspection
/// and hands the other to [`crate::Device::new`].
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MockDriver")
            .field("name", &state.info.name)
            .field("memory_types", &state.memory_types)
            .finish()
    }
}

impl MockDriver {
    pub fn new(memory_types: Vec<vk::MemoryPropertyFlags>) -> Self {
        Self::with_info(
            DeviceInfo { name: "mock".into(), kind: DeviceKind::Other, ..Default::default() },
            memory_types,
        )
    }

    pub fn with_info(info: DeviceInfo, memory_types: Vec<vk::MemoryPropertyFlags>) -> Self {
        let state = MockState { info, memory_types, ..Default::default() };
        MockDriver { state: Arc::new(Mutex::new(state)) }
    }

    /// Separate device-local and host memory; transfers go through staging.
    pub fn discrete() -> Self {
        use vk::MemoryPropertyFlags as M;
        Self::with_info(
            DeviceInfo { name: "mock discrete".into(), kind: DeviceKind::Discrete, ..Default::default() },
            vec![
                M::DEVICE_LOCAL,
                M::HOST_VISIBLE | M::HOST_COHERENT,
                M::HOST_VISIBLE | M::HOST_COHERENT | M::HOST_CACHED,
            ],
        )
    }

    /// All memory is device-local and host-visible; transfers map directly.
    pub fn integrated() -> Self {
        use vk::MemoryPropertyFlags as M;
        Self::with_info(
            DeviceInfo {
                name: "mock integrated".into(),
                kind: DeviceKind::Integrated,
                ..Default::default()
            },
            vec![
                M::DEVICE_LOCAL | M::HOST_VISIBLE | M::HOST_COHERENT,
                M::DEVICE_LOCAL | M::HOST_VISIBLE | M::HOST_COHERENT | M::HOST_CACHED,
            ],
        )
    }

    /// No device-local memory at all.
    pub fn host_only() -> Self {
        use vk::MemoryPropertyFlags as M;
        Self::new(vec![
            M::HOST_VISIBLE | M::HOST_COHERENT,
            M::HOST_VISIBLE | M::HOST_COHERENT | M::HOST_CACHED,
        ])
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every later allocation from `memory_type` fails with out-of-device-memory.
    pub fn exhaust_memory_type(&self, memory_type: u32) {
        self.lock().exhausted.push(memory_type);
    }

    /// Every later pipeline creation fails.
    pub fn fail_pipeline_builds(&self) {
        self.lock().fail_pipelines = true;
    }

    /// Run `kernel` whenever a pipeline built from `code` is dispatched.
    pub fn register_kernel(
        &self,
        code: &[u32],
        kernel: impl Fn(&mut KernelInvocation) + Send + Sync + 'static,
    ) {
        self.lock().kernels.push((code.to_vec(), Arc::new(kernel)));
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.lock().dispatches.clone()
    }

    pub fn submissions(&self, queue: QueueKind) -> usize {
        self.lock().submissions.get(&queue).copied().unwrap_or(0)
    }

    pub fn pipelines_built(&self) -> usize {
        self.lock().pipelines_built
    }

    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    pub fn invalidations(&self) -> usize {
        self.lock().invalidations
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().memories.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.lock().command_buffers.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.lock().pipelines.len()
    }

    /// Count of every driver object still alive.
    pub fn live_objects(&self) -> usize {
        let s = self.lock();
        s.buffers.len()
            + s.memories.len()
            + s.modules.len()
            + s.set_layouts.len()
            + s.pools.len()
            + s.caches.len()
            + s.pipeline_layouts.len()
            + s.pipelines.len()
            + s.command_buffers.len()
    }
}

impl Driver for MockDriver {
    fn info(&self) -> DeviceInfo {
        self.lock().info.clone()
    }

    fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags> {
        self.lock().memory_types.clone()
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        if size == 0 {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let mut s = self.lock();
        let h = s.handle();
        s.buffers.insert(h, MockBuffer { size, memory: None });
        Ok(vk::Buffer::from_raw(h))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.lock().buffers.remove(&buffer.as_raw());
    }

    fn memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let s = self.lock();
        let size = s.buffers.get(&buffer.as_raw()).map_or(0, |b| b.size);
        let count = s.memory_types.len().min(32) as u32;
        let memory_type_bits = if count == 32 { u32::MAX } else { (1u32 << count) - 1 };
        vk::MemoryRequirements { size, alignment: 16, memory_type_bits }
    }

    fn allocate_memory(&self, size: u64, memory_type: u32) -> VkResult<vk::DeviceMemory> {
        let mut s = self.lock();
        if memory_type as usize >= s.memory_types.len() || s.exhausted.contains(&memory_type) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let words = vec![0u128; (size as usize).div_ceil(16)].into_boxed_slice();
        let h = s.handle();
        s.memories.insert(h, MockMemory { words, size: size as usize, memory_type, mapped: false });
        Ok(vk::DeviceMemory::from_raw(h))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.lock().memories.remove(&memory.as_raw());
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut s = self.lock();
        let size = s.memories.get(&memory.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?.size;
        let buf = s.buffers.get_mut(&buffer.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if (size as u64) < buf.size {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        buf.memory = Some(memory.as_raw());
        Ok(())
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<*mut u8> {
        let mut s = self.lock();
        let types = s.memory_types.clone();
        let mem = s.memories.get_mut(&memory.as_raw()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let visible = types
            .get(mem.memory_type as usize)
            .is_some_and(|f| f.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        if !visible || mem.mapped || offset + size > mem.size as u64 {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        mem.mapped = true;
        let base = mem.words.as_mut_ptr().cast::<u8>();
        // SAFETY: offset is within the allocation, checked above.
        Ok(unsafe { base.add(offset as usize) })
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(mem) = self.lock().memories.get_mut(&memory.as_raw()) {
            mem.mapped = false;
        }
    }

    fn flush_memory(&self, _memory: vk::DeviceMemory) -> VkResult<()> {
        self.lock().flushes += 1;
        Ok(())
    }

    fn invalidate_memory(&self, _memory: vk::DeviceMemory) -> VkResult<()> {
        self.lock().invalidations += 1;
        Ok(())
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut s = self.lock();
        let h = s.handle();
        s.modules.insert(h, code.to_vec());
        Ok(vk::ShaderModule::from_raw(h))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.lock().modules.remove(&module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        slots: &[DescriptorKind],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut s = self.lock();
        let h = s.handle();
        s.set_layouts.insert(h, slots.len());
        Ok(vk::DescriptorSetLayout::from_raw(h))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.lock().set_layouts.remove(&layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        _kind: DescriptorKind,
        count: u32,
    ) -> VkResult<vk::DescriptorPool> {
        let mut s = self.lock();
        let h = s.handle();
        s.pools.insert(h, (count, Vec::new()));
        Ok(vk::DescriptorPool::from_raw(h))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut s = self.lock();
        if let Some((_, sets)) = s.pools.remove(&pool.as_raw()) {
            for set in sets {
                s.sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut s = self.lock();
        let slots = *s.set_layouts.get(&layout.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        let (capacity, sets) = s.pools.get(&pool.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !sets.is_empty() || (*capacity as usize) < slots {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let h = s.handle();
        s.sets.insert(h, Vec::new());
        if let Some((_, sets)) = s.pools.get_mut(&pool.as_raw()) {
            sets.push(h);
        }
        Ok(vk::DescriptorSet::from_raw(h))
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        if let Some(current) = self.lock().sets.get_mut(&set.as_raw()) {
            for w in writes {
                current.retain(|old| old.binding != w.binding);
                current.push(*w);
            }
        }
    }

    fn create_pipeline_cache(&self) -> VkResult<vk::PipelineCache> {
        let mut s = self.lock();
        let h = s.handle();
        s.caches.insert(h, ());
        Ok(vk::PipelineCache::from_raw(h))
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.lock().caches.remove(&cache.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        _set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> VkResult<vk::PipelineLayout> {
        let mut s = self.lock();
        let h = s.handle();
        s.pipeline_layouts.insert(h, push_constant_size);
        Ok(vk::PipelineLayout::from_raw(h))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.lock().pipeline_layouts.remove(&layout.as_raw());
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<'_>) -> VkResult<vk::Pipeline> {
        let mut s = self.lock();
        if s.fail_pipelines {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let entry: &CStr = desc.entry_point;
        if entry.to_bytes().is_empty() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let code = s.modules.get(&desc.module.as_raw()).cloned().ok_or(vk::Result::ERROR_UNKNOWN)?;
        let h = s.handle();
        s.pipelines
            .insert(h, MockPipeline { code, specialization: desc.specialization.clone() });
        s.pipelines_built += 1;
        Ok(vk::Pipeline::from_raw(h))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.lock().pipelines.remove(&pipeline.as_raw());
    }

    fn allocate_command_buffer(&self, queue: QueueKind) -> VkResult<vk::CommandBuffer> {
        let mut s = self.lock();
        let h = s.handle();
        s.command_buffers.insert(
            h,
            MockCommandBuffer {
                queue,
                state: RecordState::Initial,
                one_time: false,
                commands: Vec::new(),
            },
        );
        Ok(vk::CommandBuffer::from_raw(h))
    }

    fn free_command_buffer(&self, _queue: QueueKind, cmd: vk::CommandBuffer) {
        self.lock().command_buffers.remove(&cmd.as_raw());
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> VkResult<()> {
        let mut s = self.lock();
        let cb = s.command_buffers.get_mut(&cmd.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        cb.state = RecordState::Recording;
        cb.one_time = one_time;
        cb.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.lock();
        let cb = s.command_buffers.get_mut(&cmd.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if cb.state != RecordState::Recording {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        cb.state = RecordState::Executable;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        record(&mut self.lock(), cmd, Command::Copy { src: src.as_raw(), dst: dst.as_raw(), region });
    }

    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        record(&mut self.lock(), cmd, Command::Bind { pipeline: pipeline.as_raw(), set: set.as_raw() });
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, data: &[u8]) {
        record(&mut self.lock(), cmd, Command::Push(data.to_vec()));
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, grid: [u32; 3]) {
        record(&mut self.lock(), cmd, Command::Dispatch(grid));
    }

    fn submit(&self, queue: QueueKind, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut s = self.lock();
        let cb = s.command_buffers.get_mut(&cmd.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if cb.queue != queue || cb.state != RecordState::Executable {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if cb.one_time {
            cb.state = RecordState::Invalid;
        }
        let commands = cb.commands.clone();
        *s.submissions.entry(queue).or_default() += 1;
        s.execute(&commands)
    }

    fn queue_wait_idle(&self, _queue: QueueKind) -> VkResult<()> {
        Ok(())
    }
}

fn record(state: &mut MockState, cmd: vk::CommandBuffer, command: Command) {
    if let Some(cb) = state.command_buffers.get_mut(&cmd.as_raw()) {
        if cb.state == RecordState::Recording {
            cb.commands.push(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_executes_at_submit() {
        let mock = MockDriver::discrete();
        let usage = vk::BufferUsageFlags::TRANSFER_SRC;
        let a = mock.create_buffer(16, usage).unwrap();
        let b = mock.create_buffer(16, usage).unwrap();
        let ma = mock.allocate_memory(16, 1).unwrap();
        let mb = mock.allocate_memory(16, 1).unwrap();
        mock.bind_buffer_memory(a, ma).unwrap();
        mock.bind_buffer_memory(b, mb).unwrap();

        let ptr = mock.map_memory(ma, 0, 16).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([7u8; 16].as_ptr(), ptr, 16) };
        mock.unmap_memory(ma);

        let cmd = mock.allocate_command_buffer(QueueKind::Transfer).unwrap();
        mock.begin_command_buffer(cmd, true).unwrap();
        let region = vk::BufferCopy { src_offset: 4, dst_offset: 0, size: 8 };
        mock.cmd_copy_buffer(cmd, a, b, region);
        mock.end_command_buffer(cmd).unwrap();
        mock.submit(QueueKind::Transfer, cmd).unwrap();
        assert_eq!(mock.submissions(QueueKind::Transfer), 1);
        // One-time buffers cannot be replayed.
        assert!(mock.submit(QueueKind::Transfer, cmd).is_err());

        let ptr = mock.map_memory(mb, 0, 16).unwrap();
        let mut out = [0u8; 16];
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), 16) };
        mock.unmap_memory(mb);
        assert_eq!(&out[..8], &[7u8; 8]);
        assert_eq!(&out[8..], &[0u8; 8]);

        mock.free_command_buffer(QueueKind::Transfer, cmd);
        for buf in [a, b] {
            mock.destroy_buffer(buf);
        }
        for mem in [ma, mb] {
            mock.free_memory(mem);
        }
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    fn test_device_local_memory_is_not_mappable() {
        let mock = MockDriver::discrete();
        let mem = mock.allocate_memory(64, 0).unwrap();
        assert_eq!(mock.map_memory(mem, 0, 64), Err(vk::Result::ERROR_MEMORY_MAP_FAILED));
        mock.free_memory(mem);
    }

    #[test]
    fn test_exhausted_type() {
        let mock = MockDriver::integrated();
        mock.exhaust_memory_type(0);
        assert_eq!(mock.allocate_memory(8, 0), Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(mock.allocate_memory(8, 1).is_ok());
        assert_eq!(mock.allocate_memory(8, 9), Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
    }

    #[test]
    fn test_invocation_helpers() {
        let mut inv = KernelInvocation {
            grid: [1, 1, 1],
            specialization: SpecializationData::default(),
            push_constants: [3u32, 4u32].iter().flat_map(|v| v.to_ne_bytes()).collect(),
            bindings: vec![vec![0u8; 16]],
        };
        inv.write(0, &[1.5f32, 2.5]);
        assert_eq!(inv.read::<f32>(0), vec![1.5, 2.5, 0.0, 0.0]);
        assert_eq!(inv.push::<[u32; 2]>(), [3, 4]);
        assert_eq!(inv.spec_u32(0), None);
    }
}
