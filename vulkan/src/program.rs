//! Compute programs: one SPIR-V kernel, its pipeline, and the recorded dispatch.
//!
//! A [`Program`] loads its shader module up front but builds the rest of the
//! pipeline (descriptor layout, pool and set, pipeline cache, pipeline layout,
//! pipeline) on the first [`Program::bind`], when the number of bound resources
//! is known. Later binds only rewrite descriptors and re-record the command
//! buffer, and [`Program::submit`] replays the last recording.

use std::ffi::CStr;
use std::fs;
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;

use ash::vk;
use bytemuck::Pod;

use crate::array::AsBinding;
use crate::device::Device;
use crate::driver::{
    ComputePipelineDesc, DescriptorKind, DescriptorWrite, QueueKind, SpecEntry, SpecializationData,
    VkResult,
};
use crate::error::{Result, VulkanError};

const ENTRY_POINT: &CStr = c"main";

/// Read a SPIR-V binary, zero-padding it to whole 32-bit little-endian words.
pub fn read_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let mut bytes = fs::read(path)
        .map_err(|source| VulkanError::KernelLoad { path: path.to_path_buf(), source })?;
    bytes.resize(bytes.len().next_multiple_of(4), 0);
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Work groups needed to cover `n` items with groups of `group` items.
pub fn div_up(n: u32, group: u32) -> u32 {
    n.div_ceil(group)
}

/// Scalar usable as a specialization constant.
pub trait SpecConstant: Copy + Default {
    const SIZE: usize;
    fn write_ne(self, out: &mut [u8]);
}

macro_rules! spec_constant {
    ($($t:ty),*) => {$(
        impl SpecConstant for $t {
            const SIZE: usize = size_of::<$t>();
            fn write_ne(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

spec_constant!(u32, i32, f32, u64, i64, f64);

/// Written as a 32-bit `VkBool32`.
impl SpecConstant for bool {
    const SIZE: usize = 4;
    fn write_ne(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&(self as u32).to_ne_bytes());
    }
}

/// Constant ids are tuple positions; values are packed in order at natural alignment.
pub trait Specialization {
    fn specialization(&self) -> SpecializationData;
}

impl Specialization for () {
    fn specialization(&self) -> SpecializationData {
        SpecializationData::default()
    }
}

fn pack_constant<C: SpecConstant>(data: &mut SpecializationData, constant_id: u32, value: C) {
    let offset = data.data.len().next_multiple_of(C::SIZE);
    data.data.resize(offset + C::SIZE, 0);
    value.write_ne(&mut data.data[offset..]);
    data.entries.push(SpecEntry { constant_id, offset: offset as u32, size: C::SIZE });
}

macro_rules! tuple_specialization {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: SpecConstant),+> Specialization for ($($name,)+) {
            fn specialization(&self) -> SpecializationData {
                let mut data = SpecializationData::default();
                $(pack_constant(&mut data, $idx, self.$idx);)+
                data
            }
        }
    };
}

tuple_specialization!(A: 0);
tuple_specialization!(A: 0, B: 1);
tuple_specialization!(A: 0, B: 1, C: 2);
tuple_specialization!(A: 0, B: 1, C: 2, D: 3);
tuple_specialization!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_specialization!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
tuple_specialization!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
tuple_specialization!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// Objects created by the first bind.
#[derive(Default)]
struct Pipeline {
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    cmd: vk::CommandBuffer,
    slots: usize,
    specialization: SpecializationData,
    recorded: bool,
}

impl Pipeline {
    /// Destroy whatever exists; handles still null are skipped.
    fn release(&mut self, device: &Device) {
        let driver = device.driver();
        if self.cmd != vk::CommandBuffer::null() {
            driver.free_command_buffer(QueueKind::Compute, self.cmd);
        }
        if self.pipeline != vk::Pipeline::null() {
            driver.destroy_pipeline(self.pipeline);
        }
        if self.layout != vk::PipelineLayout::null() {
            driver.destroy_pipeline_layout(self.layout);
        }
        if self.cache != vk::PipelineCache::null() {
            driver.destroy_pipeline_cache(self.cache);
        }
        if self.pool != vk::DescriptorPool::null() {
            driver.destroy_descriptor_pool(self.pool);
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            driver.destroy_descriptor_set_layout(self.set_layout);
        }
        *self = Pipeline::default();
    }
}

enum PipelineState {
    Unbuilt,
    Built(Box<Pipeline>),
}

/// A compute kernel plus everything needed to dispatch it.
///
/// `S` is the specialization tuple baked in at build time, `P` the push-constant
/// block sent with every dispatch (`()` for none).
pub struct Program<S: Specialization = (), P: Pod = ()> {
    device: Device,
    module: vk::ShaderModule,
    grid: [u32; 3],
    spec: S,
    state: PipelineState,
    _params: PhantomData<P>,
}

impl<S: Specialization + Default, P: Pod> Program<S, P> {
    pub fn new(device: &Device, code: &[u32]) -> Result<Self> {
        let push_size = size_of::<P>();
        let max = device.info().limits.max_push_constants_size;
        if push_size % 4 != 0 || push_size > max as usize {
            return Err(VulkanError::PushConstants { size: push_size, max });
        }
        let module = device.driver().create_shader_module(code)?;
        Ok(Program {
            device: device.clone(),
            module,
            grid: [0, 0, 0],
            spec: S::default(),
            state: PipelineState::Unbuilt,
            _params: PhantomData,
        })
    }

    /// Load the kernel from a SPIR-V file; see [`read_spirv`].
    pub fn from_file(device: &Device, path: impl AsRef<Path>) -> Result<Self> {
        let code = read_spirv(path)?;
        Self::new(device, &code)
    }
}

impl<S: Specialization, P: Pod> Program<S, P> {
    /// Work-group counts for the next recording.
    pub fn grid(&mut self, x: u32, y: u32, z: u32) -> &mut Self {
        self.grid = [x, y, z];
        self
    }

    /// Specialization constants. Only honoured before the first bind.
    pub fn spec(&mut self, spec: S) -> &mut Self {
        if let PipelineState::Built(_) = self.state {
            self.device.logger().scope(|| {
                tracing::warn!("specialization changed after the pipeline was built; ignored")
            });
        }
        self.spec = spec;
        self
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, PipelineState::Built(_))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Bind `resources` to slots `0..n` in order and record a dispatch with
    /// `params` as push constants. Builds the pipeline on first use.
    pub fn bind(&mut self, params: &P, resources: &[&dyn AsBinding]) -> Result<&mut Self> {
        let bindings = resources.iter().map(|r| r.binding()).collect::<Result<Vec<_>>>()?;

        if let PipelineState::Unbuilt = self.state {
            let pipeline = self.build(bindings.len())?;
            self.state = PipelineState::Built(Box::new(pipeline));
        }
        let PipelineState::Built(pipeline) = &mut self.state else {
            unreachable!("pipeline built above");
        };
        if bindings.len() != pipeline.slots {
            return Err(VulkanError::BindingCount { expected: pipeline.slots, actual: bindings.len() });
        }

        let driver = self.device.driver();
        let writes: Vec<DescriptorWrite> = bindings
            .iter()
            .enumerate()
            .map(|(slot, b)| DescriptorWrite {
                binding: slot as u32,
                kind: b.kind,
                buffer: b.buffer,
                offset: b.offset,
                range: b.range,
            })
            .collect();
        driver.update_descriptor_set(pipeline.set, &writes);

        pipeline.recorded = false;
        driver.begin_command_buffer(pipeline.cmd, false)?;
        driver.cmd_bind_compute(pipeline.cmd, pipeline.pipeline, pipeline.layout, pipeline.set);
        if size_of::<P>() > 0 {
            driver.cmd_push_constants(pipeline.cmd, pipeline.layout, bytemuck::bytes_of(params));
        }
        driver.cmd_dispatch(pipeline.cmd, self.grid);
        driver.end_command_buffer(pipeline.cmd)?;
        pipeline.recorded = true;
        Ok(self)
    }

    /// Submit the last recorded dispatch and wait for it. Can be repeated.
    pub fn submit(&mut self) -> Result<()> {
        let cmd = match &self.state {
            PipelineState::Built(p) if p.recorded => p.cmd,
            _ => return Err(VulkanError::NotRecorded),
        };
        let driver = self.device.driver();
        driver.submit(QueueKind::Compute, cmd)?;
        driver.queue_wait_idle(QueueKind::Compute)?;
        Ok(())
    }

    /// [`bind`](Self::bind) then [`submit`](Self::submit).
    pub fn run(&mut self, params: &P, resources: &[&dyn AsBinding]) -> Result<()> {
        self.bind(params, resources)?;
        self.submit()
    }

    fn build(&self, slots: usize) -> Result<Pipeline> {
        let specialization = self.spec.specialization();
        let push_size = size_of::<P>() as u32;
        let mut pipeline = Pipeline { slots, specialization, ..Default::default() };

        let built = self.create_objects(&mut pipeline, push_size);
        if let Err(code) = built {
            pipeline.release(&self.device);
            self.device.logger().scope(|| {
                tracing::error!(error = %code, slots, push_size, "compute pipeline build failed")
            });
            return Err(VulkanError::PipelineBuild(code));
        }

        self.device.logger().scope(|| {
            tracing::debug!(
                slots,
                push_size,
                spec_constants = pipeline.specialization.entries.len(),
                "compute pipeline built"
            )
        });
        Ok(pipeline)
    }

    fn create_objects(&self, p: &mut Pipeline, push_size: u32) -> VkResult<()> {
        let driver = self.device.driver();
        let kinds = vec![DescriptorKind::StorageBuffer; p.slots];
        p.set_layout = driver.create_descriptor_set_layout(&kinds)?;
        // A zero-sized pool is invalid, so keep one slot even without resources.
        p.pool = driver.create_descriptor_pool(DescriptorKind::StorageBuffer, p.slots.max(1) as u32)?;
        p.set = driver.allocate_descriptor_set(p.pool, p.set_layout)?;
        p.cache = driver.create_pipeline_cache()?;
        p.layout = driver.create_pipeline_layout(p.set_layout, push_size)?;
        p.pipeline = driver.create_compute_pipeline(&ComputePipelineDesc {
            layout: p.layout,
            cache: p.cache,
            module: self.module,
            entry_point: ENTRY_POINT,
            specialization: &p.specialization,
        })?;
        p.cmd = driver.allocate_command_buffer(QueueKind::Compute)?;
        Ok(())
    }
}

impl<S: Specialization, P: Pod> Drop for Program<S, P> {
    fn drop(&mut self) {
        if let PipelineState::Built(pipeline) = &mut self.state {
            pipeline.release(&self.device);
        }
        self.device.driver().destroy_shader_module(self.module);
    }
}
