use ash::vk;
use smallvec::SmallVec;

use crate::accel_struct::BvhGeometry;

pub mod recorder;
pub use recorder::CommandRecorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Orders unordered-access writes to the resource before any later access.
    Uav(ResourceRef),
    Transition {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
}

/// One acceleration structure build, bottom or top level.
#[derive(Debug, Clone)]
pub struct AccelerationStructureBuild {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub dst: vk::Buffer,
    pub dst_address: vk::DeviceAddress,
    /// Source structure for updates, null otherwise.
    pub src_address: vk::DeviceAddress,
    pub scratch_address: vk::DeviceAddress,
    pub geometries: Vec<BvhGeometry>,
    pub instances: vk::DeviceAddress,
    pub instance_count: u32,
}

/// Root arguments shared by every raygen pass of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaytracingRoot {
    pub globals_vs: vk::DeviceAddress,
    pub globals_ps: vk::DeviceAddress,
    pub globals_rt: vk::DeviceAddress,
    pub top_level: vk::DeviceAddress,
    /// First slot of the output UAV table.
    pub output_table: u32,
    pub geometry_descs: vk::DeviceAddress,
    pub materials: vk::DeviceAddress,
}

#[derive(Debug, Clone)]
pub enum Command {
    PipelineBarrier(SmallVec<[Barrier; 8]>),
    BuildAccelerationStructure(Box<AccelerationStructureBuild>),
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindRaytracingRoot(RaytracingRoot),
    BindComputeRoot {
        addresses: SmallVec<[vk::DeviceAddress; 4]>,
        descriptor_table: u32,
    },
    TraceRays {
        raygen: vk::StridedDeviceAddressRegionKHR,
        miss: vk::StridedDeviceAddressRegionKHR,
        hit: vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BlitImage {
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
        filter: vk::Filter,
    },
    SetRenderTargets {
        color: vk::Image,
        depth_stencil: vk::Image,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    SetPrimitiveTopology(vk::PrimitiveTopology),
    BindGraphicsPipeline {
        vertex_shader: u32,
        pixel_shader: u32,
        render_state_hash: u64,
    },
    BindGraphicsRoot {
        globals_vs: vk::DeviceAddress,
        globals_ps: vk::DeviceAddress,
    },
    BindTextures(SmallVec<[u32; 16]>),
    BindVertexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        stride: u32,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    Present,
}
