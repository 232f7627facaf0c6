use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::resources::alloc::MemBuffer;

pub mod build;
pub mod manager;

pub use build::AccelerationStructureBuilder;
pub use manager::AccelStructManager;

/// Triangle geometry as consumed by a bottom level build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BvhGeometry {
    pub flags: vk::GeometryFlagsKHR,
    pub index_type: vk::IndexType,
    pub index_data: vk::DeviceAddress,
    pub index_count: u32,
    pub vertex_format: vk::Format,
    /// Address of the first vertex position.
    pub vertex_data: vk::DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
}

impl BvhGeometry {
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Per-geometry record read by the hit shaders, indexed by an instance's custom index plus the
/// geometry index.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GeometryDesc {
    pub flags: u32,
    /// Raw view slot of the index buffer.
    pub index_buffer: u32,
    pub index_offset: u32,
    /// Raw view slot of the vertex buffer.
    pub vertex_buffer: u32,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub position_offset: u32,
    pub normal_offset: u32,
    pub tangent_offset: u32,
    pub binormal_offset: u32,
    pub color_offset: u32,
    pub tex_coord_offsets: [u32; 4],
    pub material_id: u32,
}

/// Lifecycle of a bottom level acceleration structure id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlasState {
    /// Never created.
    Unbuilt,
    /// Created, first build queued for the next TLAS pass.
    PendingBuild,
    /// Built at least once. Updates and rebuilds keep this state.
    Built,
    Released,
}

pub struct BottomLevelAccelStruct {
    pub(crate) state: BlasState,
    /// First slot of the geometry descriptor range.
    pub(crate) geometry_id: u32,
    pub(crate) geometry_count: u32,
    pub(crate) geometries: Vec<BvhGeometry>,
    pub(crate) flags: vk::BuildAccelerationStructureFlagsKHR,
    pub(crate) sizes: vk::AccelerationStructureBuildSizesInfoKHR,
    pub(crate) buffer: Option<MemBuffer>,
}

impl BottomLevelAccelStruct {
    pub fn state(&self) -> BlasState {
        self.state
    }

    pub fn geometry_range(&self) -> (u32, u32) {
        (self.geometry_id, self.geometry_count)
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.buffer.as_ref().map_or(0, MemBuffer::get_device_address)
    }

    pub fn raw_buffer(&self) -> Option<vk::Buffer> {
        self.buffer.as_ref().map(|buffer| buffer.buffer)
    }

    pub fn allows_update(&self) -> bool {
        self.flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }
}

/// A placed BLAS. Inactive while `reference` is 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Instance {
    pub transform: [f32; 12],
    pub prev_transform: [f32; 12],
    pub blas_id: u32,
    pub custom_index: u32,
    pub mask: u8,
    pub mirrored: bool,
    pub instance_type: u8,
    pub reference: vk::DeviceAddress,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.reference != 0
    }

    fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        let mut flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;
        if self.mirrored {
            flags |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FLIP_FACING;
        }
        flags
    }

    pub fn to_desc(&self) -> InstanceDesc {
        let (mask, flags) = if self.is_active() {
            (self.mask, self.flags().as_raw() as u8)
        } else {
            (0, 0)
        };
        InstanceDesc {
            transform: self.transform,
            custom_index_and_mask: (self.custom_index & 0xff_ffff) | (mask as u32) << 24,
            sbt_offset_and_flags: (flags as u32) << 24,
            reference: self.reference,
        }
    }
}

/// Instance descriptor in the layout the top level build reads.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    /// Row-major 3x4 object to world transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    pub reference: vk::DeviceAddress,
}

pub fn instance_bytes(instances: &[InstanceDesc]) -> &[u8] {
    bytemuck::cast_slice(instances)
}
