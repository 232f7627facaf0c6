//! An in-memory device.
//!
//! Buffers are plain byte vectors addressed by a fake device address space, and submissions are
//! recorded instead of executed. Submissions are checked for references to destroyed buffers so
//! that a missed retirement shows up as `ERROR_DEVICE_LOST`.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
use parking_lot::Mutex;

use crate::{
    accel_struct::InstanceDesc,
    backend::{
        BufferCreateInfo, BuildInputs, Descriptor, GraphicsPipelineDesc, ImageCreateInfo,
        RaytracingDevice,
    },
    command::Command,
    descriptor::sampler::SamplerDescription,
    physical_device::{DeviceCapabilities, DeviceProperties, FeatureLevel},
    ray_tracing::sbt::SbtLayout,
    util::align_up,
};

const ADDRESS_BASE: u64 = 0x1_0000_0000;
const INSTANCE_DESC_SIZE: usize = std::mem::size_of::<InstanceDesc>();

struct HeadlessBuffer {
    address: vk::DeviceAddress,
    size: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_address: u64,
    buffers: HashMap<vk::Buffer, HeadlessBuffer>,
    addresses: BTreeMap<vk::DeviceAddress, vk::Buffer>,
    destroyed_buffers: Vec<vk::Buffer>,
    images: HashMap<vk::Image, ImageCreateInfo>,
    destroyed_images: Vec<vk::Image>,
    descriptors: HashMap<u32, Descriptor>,
    samplers: HashMap<u32, SamplerDescription>,
    pipelines: Vec<vk::Pipeline>,
    submissions: Vec<Vec<Command>>,
    waited_frames: Vec<usize>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn buffer_at(&self, address: vk::DeviceAddress) -> Option<(&vk::Buffer, &HeadlessBuffer)> {
        let (_, buffer) = self.addresses.range(..=address).next_back()?;
        let record = self.buffers.get(buffer)?;
        (address < record.address + record.size.max(1)).then_some((buffer, record))
    }

    fn read(&self, address: vk::DeviceAddress, len: usize) -> Option<Vec<u8>> {
        let (_, record) = self.buffer_at(address)?;
        let offset = (address - record.address) as usize;
        let mut out = vec![0; len];
        if offset < record.data.len() {
            let available = (record.data.len() - offset).min(len);
            out[..available].copy_from_slice(&record.data[offset..offset + available]);
        }
        Some(out)
    }

    fn validate(&self, command: &Command) -> Result<(), String> {
        let Command::BuildAccelerationStructure(build) = command else {
            return Ok(());
        };
        if !self.buffers.contains_key(&build.dst) {
            return Err(format!("build into destroyed buffer {:?}", build.dst));
        }
        if self.buffer_at(build.scratch_address).is_none() {
            return Err(format!("unbacked scratch address {:#x}", build.scratch_address));
        }
        if build.src_address != 0 && self.buffer_at(build.src_address).is_none() {
            return Err(format!("update from freed structure {:#x}", build.src_address));
        }
        if build.instance_count > 0 {
            let bytes = self
                .read(
                    build.instances,
                    build.instance_count as usize * INSTANCE_DESC_SIZE,
                )
                .ok_or_else(|| format!("unbacked instance address {:#x}", build.instances))?;
            for instance in bytes.chunks_exact(INSTANCE_DESC_SIZE) {
                let reference = bytemuck::pod_read_unaligned::<InstanceDesc>(instance).reference;
                if reference != 0 && self.buffer_at(reference).is_none() {
                    return Err(format!("instance references freed structure {:#x}", reference));
                }
            }
        }
        Ok(())
    }
}

/// Cheap to clone; clones observe the same device.
#[derive(Clone)]
pub struct HeadlessDevice {
    capabilities: DeviceCapabilities,
    properties: DeviceProperties,
    state: Arc<Mutex<State>>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities {
            raytracing_tier: FeatureLevel::new(1, 1),
            shader_model: FeatureLevel::new(6, 6),
            resource_binding_tier: 3,
            root_signature_version: FeatureLevel::new(1, 1),
            gpu_upload_heap: true,
        })
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            properties: DeviceProperties::default(),
            state: Arc::new(Mutex::new(State {
                next_address: ADDRESS_BASE,
                ..Default::default()
            })),
        }
    }

    pub fn is_buffer_alive(&self, buffer: vk::Buffer) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }

    pub fn was_buffer_destroyed(&self, buffer: vk::Buffer) -> bool {
        self.state.lock().destroyed_buffers.contains(&buffer)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// The live buffer whose address range contains `address`.
    pub fn buffer_at_address(&self, address: vk::DeviceAddress) -> Option<vk::Buffer> {
        self.state.lock().buffer_at(address).map(|(buffer, _)| *buffer)
    }

    /// Reads `len` bytes at a device address. Unwritten bytes read as zero.
    pub fn read_address(&self, address: vk::DeviceAddress, len: usize) -> Vec<u8> {
        self.state
            .lock()
            .read(address, len)
            .unwrap_or_else(|| panic!("address {:#x} is not backed by a live buffer", address))
    }

    pub fn is_image_alive(&self, image: vk::Image) -> bool {
        self.state.lock().images.contains_key(&image)
    }

    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn descriptor(&self, slot: u32) -> Option<Descriptor> {
        self.state.lock().descriptors.get(&slot).copied()
    }

    pub fn sampler(&self, slot: u32) -> Option<SamplerDescription> {
        self.state.lock().samplers.get(&slot).copied()
    }

    pub fn sampler_count(&self) -> usize {
        self.state.lock().samplers.len()
    }

    /// Every submission so far, oldest first.
    pub fn submissions(&self) -> Vec<Vec<Command>> {
        self.state.lock().submissions.clone()
    }

    pub fn last_submission(&self) -> Vec<Command> {
        self.state
            .lock()
            .submissions
            .last()
            .cloned()
            .unwrap_or_default()
    }

    pub fn waited_frames(&self) -> Vec<usize> {
        self.state.lock().waited_frames.clone()
    }
}

impl RaytracingDevice for HeadlessDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> VkResult<(vk::Buffer, vk::DeviceAddress)> {
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.handle());
        let address = state.next_address;
        state.next_address = align_up(address + info.size.max(1), 256) + 256;
        state.buffers.insert(
            buffer,
            HeadlessBuffer {
                address,
                size: info.size,
                data: Vec::new(),
            },
        );
        state.addresses.insert(address, buffer);
        Ok((buffer, address))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if let Some(record) = state.buffers.remove(&buffer) {
            state.addresses.remove(&record.address);
            state.destroyed_buffers.push(buffer);
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> VkResult<()> {
        let mut state = self.state.lock();
        let record = state
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let end = offset as usize + data.len();
        if end as u64 > record.size {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        if record.data.len() < end {
            record.data.resize(end, 0);
        }
        record.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, info: &ImageCreateInfo) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        let image = vk::Image::from_raw(state.handle());
        state.images.insert(image, *info);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        if state.images.remove(&image).is_some() {
            state.destroyed_images.push(image);
        }
    }

    fn write_image(&self, image: vk::Image, mip_level: u32, _data: &[u8]) -> VkResult<()> {
        let state = self.state.lock();
        let info = state.images.get(&image).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        if mip_level >= info.mip_levels {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        Ok(())
    }

    fn write_descriptor(&self, slot: u32, descriptor: &Descriptor) {
        self.state.lock().descriptors.insert(slot, *descriptor);
    }

    fn create_sampler(&self, slot: u32, desc: &SamplerDescription) -> VkResult<()> {
        self.state.lock().samplers.insert(slot, *desc);
        Ok(())
    }

    fn acceleration_structure_build_sizes(
        &self,
        inputs: &BuildInputs,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        let primitives = if inputs.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            inputs.instance_count as u64
        } else {
            inputs
                .geometries
                .iter()
                .map(|geometry| geometry.primitive_count() as u64)
                .sum()
        };
        vk::AccelerationStructureBuildSizesInfoKHR {
            acceleration_structure_size: 1024 + 64 * primitives,
            build_scratch_size: 512 + 32 * primitives,
            update_scratch_size: 256 + 16 * primitives,
            ..Default::default()
        }
    }

    fn create_ray_tracing_pipeline(&self, layout: &SbtLayout) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        let pipeline = vk::Pipeline::from_raw(state.handle());
        state.pipelines.push(pipeline);
        tracing::trace!(?pipeline, groups = layout.group_count(), "headless ray tracing pipeline");
        Ok(pipeline)
    }

    fn get_ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> VkResult<Vec<u8>> {
        if !self.state.lock().pipelines.contains(&pipeline) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let handle_size = self.properties.shader_group_handle_size as usize;
        Ok((first_group..first_group + group_count)
            .flat_map(|group| std::iter::repeat(group as u8 + 1).take(handle_size))
            .collect())
    }

    fn create_compute_pipeline(&self, _entry: &str) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        let pipeline = vk::Pipeline::from_raw(state.handle());
        state.pipelines.push(pipeline);
        Ok(pipeline)
    }

    fn create_graphics_pipeline(&self, _desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        let pipeline = vk::Pipeline::from_raw(state.handle());
        state.pipelines.push(pipeline);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().pipelines.retain(|p| *p != pipeline);
    }

    fn submit(&self, commands: Vec<Command>) -> VkResult<()> {
        let mut state = self.state.lock();
        for command in &commands {
            if let Err(message) = state.validate(command) {
                tracing::error!(%message, "invalid submission");
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
        }
        state.submissions.push(commands);
        Ok(())
    }

    fn wait_for_frame(&self, frame_index: usize) -> VkResult<()> {
        self.state.lock().waited_frames.push(frame_index);
        Ok(())
    }
}
