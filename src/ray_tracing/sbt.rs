use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{
    backend::MemoryLocation,
    pipeline::Pipeline,
    resources::alloc::{Allocator, BufferRequest, MemBuffer},
    util::align_up,
    HasDevice,
};

/// One hit group: closest hit plus an optional any hit export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitGroup {
    pub closest_hit: &'static str,
    pub any_hit: Option<&'static str>,
}

/// Shader groups of the ray tracing pipeline in group index order: raygen, miss, then hit groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtLayout {
    pub raygen_shaders: Vec<&'static str>,
    pub miss_shaders: Vec<&'static str>,
    pub hitgroups: Vec<HitGroup>,
}

/// The four ray generation passes of a traced frame, in dispatch order.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaygenPass {
    Primary,
    Shadow,
    GlobalIllumination,
    Reflection,
}

impl RaygenPass {
    pub const ALL: [RaygenPass; 4] = [
        RaygenPass::Primary,
        RaygenPass::Shadow,
        RaygenPass::GlobalIllumination,
        RaygenPass::Reflection,
    ];
}

impl SbtLayout {
    pub fn new() -> Self {
        Self {
            raygen_shaders: vec![
                "PrimaryRayGeneration",
                "ShadowRayGeneration",
                "GIRayGeneration",
                "ReflectionRayGeneration",
            ],
            miss_shaders: vec!["PrimaryMiss", "SecondaryMiss"],
            hitgroups: vec![
                HitGroup {
                    closest_hit: "PrimaryClosestHit",
                    any_hit: Some("PrimaryAnyHit"),
                },
                HitGroup {
                    closest_hit: "SecondaryClosestHit",
                    any_hit: Some("SecondaryAnyHit"),
                },
            ],
        }
    }

    pub fn group_count(&self) -> u32 {
        (self.raygen_shaders.len() + self.miss_shaders.len() + self.hitgroups.len()) as u32
    }
}

impl Default for SbtLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offsets of the table regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegions {
    pub raygen_stride: u64,
    pub record_stride: u64,
    pub miss_offset: u64,
    pub hit_offset: u64,
    pub size: u64,
}

impl SbtRegions {
    pub fn new(
        layout: &SbtLayout,
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
    ) -> Self {
        let base_alignment = base_alignment as u64;
        // Every raygen record starts a region of its own.
        let raygen_stride = align_up(handle_size as u64, base_alignment);
        let record_stride = align_up(handle_size as u64, handle_alignment as u64);
        let miss_offset = raygen_stride * layout.raygen_shaders.len() as u64;
        let hit_offset = miss_offset
            + align_up(record_stride * layout.miss_shaders.len() as u64, base_alignment);
        let size =
            hit_offset + align_up(record_stride * layout.hitgroups.len() as u64, base_alignment);
        Self {
            raygen_stride,
            record_stride,
            miss_offset,
            hit_offset,
            size,
        }
    }
}

/// Shader binding table in host visible memory.
pub struct Sbt {
    buffer: MemBuffer,
    regions: SbtRegions,
    miss_count: u64,
    hit_count: u64,
}

impl Sbt {
    pub fn new(
        allocator: &Arc<Allocator>,
        pipeline: &Pipeline,
        layout: &SbtLayout,
    ) -> VkResult<Self> {
        let properties = *allocator.device().physical_device().properties();
        let handle_size = properties.shader_group_handle_size as usize;
        let regions = SbtRegions::new(
            layout,
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
        );
        let handles = allocator.device().get_ray_tracing_shader_group_handles(
            pipeline.raw(),
            0,
            layout.group_count(),
        )?;

        let mut data = vec![0u8; regions.size as usize];
        let mut groups = handles.chunks_exact(handle_size);
        let mut copy = |offset: u64, groups: &mut std::slice::ChunksExact<u8>| {
            if let Some(handle) = groups.next() {
                data[offset as usize..offset as usize + handle_size].copy_from_slice(handle);
            }
        };
        for i in 0..layout.raygen_shaders.len() as u64 {
            copy(i * regions.raygen_stride, &mut groups);
        }
        for i in 0..layout.miss_shaders.len() as u64 {
            copy(regions.miss_offset + i * regions.record_stride, &mut groups);
        }
        for i in 0..layout.hitgroups.len() as u64 {
            copy(regions.hit_offset + i * regions.record_stride, &mut groups);
        }

        let buffer = allocator.allocate_buffer(&BufferRequest {
            size: regions.size,
            alignment: properties.shader_group_base_alignment as u64,
            usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::Upload,
        })?;
        buffer.write_bytes(0, &data)?;
        Ok(Self {
            buffer,
            regions,
            miss_count: layout.miss_shaders.len() as u64,
            hit_count: layout.hitgroups.len() as u64,
        })
    }

    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    pub fn buffer(&self) -> &MemBuffer {
        &self.buffer
    }

    /// The single raygen record of `pass`.
    pub fn raygen(&self, pass: RaygenPass) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: self.buffer.get_device_address()
                + pass as u64 * self.regions.raygen_stride,
            stride: self.regions.raygen_stride,
            size: self.regions.raygen_stride,
        }
    }

    pub fn miss(&self) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: self.buffer.get_device_address() + self.regions.miss_offset,
            stride: self.regions.record_stride,
            size: self.regions.record_stride * self.miss_count,
        }
    }

    pub fn hit(&self) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: self.buffer.get_device_address() + self.regions.hit_offset,
            stride: self.regions.record_stride,
            size: self.regions.record_stride * self.hit_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{headless::HeadlessDevice, Device};

    #[test]
    fn region_layout() {
        let regions = SbtRegions::new(&SbtLayout::new(), 32, 32, 64);
        assert_eq!(regions.raygen_stride, 64);
        assert_eq!(regions.record_stride, 32);
        assert_eq!(regions.miss_offset, 256);
        assert_eq!(regions.hit_offset, 320);
        assert_eq!(regions.size, 384);
    }

    #[test]
    fn handles_land_in_their_records() {
        let headless = HeadlessDevice::new();
        let device = Device::new(headless.clone());
        let allocator = Arc::new(Allocator::new(device.clone()));
        let layout = SbtLayout::new();
        assert_eq!(layout.group_count(), 8);
        let pipeline = Pipeline::ray_tracing(device, &layout).unwrap();
        let sbt = Sbt::new(&allocator, &pipeline, &layout).unwrap();

        let base = sbt.buffer().get_device_address();
        let table = headless.read_address(base, 384);
        // The headless device fills handle `g` with the byte `g + 1`.
        assert_eq!(table[64], 2);
        assert_eq!(table[96], 0);
        assert_eq!(table[256], 5);
        assert_eq!(table[288], 6);
        assert_eq!(table[320], 7);
        assert_eq!(table[352], 8);

        let shadow = sbt.raygen(RaygenPass::Shadow);
        assert_eq!(shadow.device_address, base + 64);
        assert_eq!(shadow.size, 64);
        assert_eq!(sbt.miss().size, 64);
        assert_eq!(sbt.hit().device_address, base + 320);
    }
}
