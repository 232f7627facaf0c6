//! The render device the bridge drives.
//!
//! Everything above this trait is device-agnostic and can run against
//! [`crate::headless::HeadlessDevice`].
use ash::{prelude::VkResult, vk};

use crate::{
    accel_struct::BvhGeometry,
    command::Command,
    descriptor::sampler::SamplerDescription,
    physical_device::{DeviceCapabilities, DeviceProperties},
    ray_tracing::sbt::SbtLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device local memory, written through the copy queue.
    DeviceLocal,
    /// Memory visible to both host and device. Backed by the GPU upload heap when available.
    Upload,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageCreateInfo {
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

/// A view written into a slot of the resource descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Null,
    SampledImage {
        image: vk::Image,
        format: vk::Format,
        mip_levels: u32,
    },
    StorageImage {
        image: vk::Image,
        format: vk::Format,
    },
    /// Byte-address view over a whole buffer.
    RawBuffer { buffer: vk::Buffer, size: u64 },
}

/// Inputs for an acceleration structure prebuild query.
#[derive(Debug, Clone, Copy)]
pub struct BuildInputs<'a> {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Bottom level only.
    pub geometries: &'a [BvhGeometry],
    /// Top level only.
    pub instance_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex_entry: &'a str,
    pub pixel_entry: &'a str,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

pub trait RaytracingDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;
    fn properties(&self) -> DeviceProperties;

    fn create_buffer(&self, info: &BufferCreateInfo) -> VkResult<(vk::Buffer, vk::DeviceAddress)>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Writes `data` at `offset`. Upload buffers are written in place, device local buffers through a staging copy
    /// ordered before the next submission.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> VkResult<()>;

    fn create_image(&self, info: &ImageCreateInfo) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn write_image(&self, image: vk::Image, mip_level: u32, data: &[u8]) -> VkResult<()>;

    fn write_descriptor(&self, slot: u32, descriptor: &Descriptor);
    fn create_sampler(&self, slot: u32, desc: &SamplerDescription) -> VkResult<()>;

    fn acceleration_structure_build_sizes(
        &self,
        inputs: &BuildInputs,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR;

    fn create_ray_tracing_pipeline(&self, layout: &SbtLayout) -> VkResult<vk::Pipeline>;
    /// Returns `group_count * shader_group_handle_size` bytes.
    fn get_ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> VkResult<Vec<u8>>;
    fn create_compute_pipeline(&self, entry: &str) -> VkResult<vk::Pipeline>;
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn submit(&self, commands: Vec<Command>) -> VkResult<()>;
    /// Blocks until the work last submitted for `frame_index` has completed on the device.
    fn wait_for_frame(&self, frame_index: usize) -> VkResult<()>;
}
