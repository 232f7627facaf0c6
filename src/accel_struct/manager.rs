use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use super::{
    build::{blas_build_flags, bvh_geometry_flags, validate_geometry},
    instance_bytes, AccelerationStructureBuilder, BlasState, BottomLevelAccelStruct, BvhGeometry,
    GeometryDesc, Instance, InstanceDesc,
};
use crate::{
    backend::{BuildInputs, MemoryLocation},
    command::{AccelerationStructureBuild, CommandRecorder, ResourceRef},
    frames::FrameManager,
    material::MaterialTable,
    message::{GeometryDescription, MsgCreateBottomLevelAccelStruct, MsgCreateInstance},
    resources::{
        alloc::{Allocator, BufferRequest, MemBuffer},
        free_list::FreeListAllocator,
        table::ResourceTable,
    },
    Device, HasDevice,
};

/// An instance whose BLAS was not built yet when it was created.
#[derive(Debug, Clone)]
struct DelayedInstance {
    instance_id: u32,
    overrides: Vec<(u32, u32)>,
}

/// Owns every bottom level structure, the instances placing them and the single top level
/// structure built from those instances once per traced frame.
pub struct AccelStructManager {
    allocator: Arc<Allocator>,
    blases: Vec<Option<BottomLevelAccelStruct>>,
    /// Indexed by instance id. Released ids stay as inactive entries.
    instances: Vec<Instance>,
    /// Private geometry ranges of instances with material overrides.
    instance_geometries: Vec<Option<(u32, u32)>>,
    delayed_instances: Vec<DelayedInstance>,
    builder: AccelerationStructureBuilder,
    geometry_slots: FreeListAllocator,
    geometry_descs: Vec<GeometryDesc>,
    tlas: Option<MemBuffer>,
}

impl HasDevice for AccelStructManager {
    fn device(&self) -> &Arc<Device> {
        self.allocator.device()
    }
}

fn grow<T: Default>(table: &mut Vec<T>, id: u32) -> &mut T {
    let index = id as usize;
    if table.len() <= index {
        table.resize_with(index + 1, T::default);
    }
    &mut table[index]
}

impl AccelStructManager {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            blases: Vec::new(),
            instances: Vec::new(),
            instance_geometries: Vec::new(),
            delayed_instances: Vec::new(),
            builder: AccelerationStructureBuilder::new(),
            geometry_slots: FreeListAllocator::new(),
            geometry_descs: Vec::new(),
            tlas: None,
        }
    }

    pub fn blas(&self, id: u32) -> Option<&BottomLevelAccelStruct> {
        self.blases.get(id as usize).and_then(Option::as_ref)
    }

    pub fn blas_state(&self, id: u32) -> BlasState {
        self.blas(id).map_or(BlasState::Unbuilt, |blas| blas.state)
    }

    pub fn instance(&self, id: u32) -> Option<&Instance> {
        self.instances.get(id as usize)
    }

    pub fn delayed_instance_count(&self) -> usize {
        self.delayed_instances.len()
    }

    pub fn pending_builds(&self) -> usize {
        self.builder.pending().len()
    }

    pub fn geometry_slots(&self) -> &FreeListAllocator {
        &self.geometry_slots
    }

    pub fn geometry_desc(&self, slot: u32) -> Option<&GeometryDesc> {
        if slot >= self.geometry_slots.len() {
            return None;
        }
        self.geometry_descs.get(slot as usize)
    }

    /// Null until the first top level build.
    pub fn tlas_address(&self) -> vk::DeviceAddress {
        self.tlas.as_ref().map_or(0, MemBuffer::get_device_address)
    }

    fn allocate_geometry_range(&mut self, count: u32) -> u32 {
        let start = self.geometry_slots.allocate(count);
        let len = self.geometry_slots.len() as usize;
        if self.geometry_descs.len() < len {
            self.geometry_descs.resize(len, GeometryDesc::default());
        }
        start
    }

    fn free_geometry_range(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        let range = start as usize..(start + count) as usize;
        self.geometry_descs[range].fill(GeometryDesc::default());
        self.geometry_slots.free(start, count);
    }

    /// Creates bottom level structure `message.blas_id` over `geometries` and queues its first
    /// build. An existing structure with the same id is released first, and its buffer is kept
    /// when it is large enough for the new one.
    pub fn create_blas(
        &mut self,
        message: &MsgCreateBottomLevelAccelStruct,
        geometries: &[GeometryDescription],
        resources: &ResourceTable,
        frames: &mut FrameManager,
    ) -> VkResult<()> {
        let id = message.blas_id;
        let mut old_buffer = self.detach_blas(id);

        let mut bvh = Vec::with_capacity(geometries.len());
        let mut descs = Vec::with_capacity(geometries.len());
        for geometry in geometries {
            let index_buffer = resources.index_buffer(geometry.index_buffer_id);
            let vertex_buffer = resources.vertex_buffer(geometry.vertex_buffer_id);
            validate_geometry(
                geometry,
                index_buffer.map(|b| b.buffer().size()),
                vertex_buffer.map(|b| b.buffer().size()),
            );
            let index_offset = geometry.index_offset as u64;
            let position_offset = geometry.position_offset as u64;
            bvh.push(BvhGeometry {
                flags: bvh_geometry_flags(geometry.flags),
                index_type: vk::IndexType::UINT16,
                index_data: index_buffer.map_or(0, |b| {
                    b.buffer().get_device_address() + index_offset
                }),
                index_count: geometry.index_count,
                vertex_format: vk::Format::R32G32B32_SFLOAT,
                vertex_data: vertex_buffer.map_or(0, |b| {
                    b.buffer().get_device_address() + position_offset
                }),
                vertex_stride: geometry.vertex_stride as u64,
                vertex_count: geometry.vertex_count,
            });
            descs.push(GeometryDesc {
                flags: geometry.flags,
                index_buffer: index_buffer.map_or(0, |b| b.srv()),
                index_offset: geometry.index_offset,
                vertex_buffer: vertex_buffer.map_or(0, |b| b.srv()),
                vertex_stride: geometry.vertex_stride,
                vertex_count: geometry.vertex_count,
                position_offset: geometry.position_offset,
                normal_offset: geometry.normal_offset,
                tangent_offset: geometry.tangent_offset,
                binormal_offset: geometry.binormal_offset,
                color_offset: geometry.color_offset,
                tex_coord_offsets: geometry.tex_coord_offsets,
                material_id: geometry.material_id,
            });
        }

        let geometry_count = descs.len() as u32;
        let geometry_id = if geometry_count > 0 {
            let start = self.allocate_geometry_range(geometry_count);
            self.geometry_descs[start as usize..(start + geometry_count) as usize]
                .copy_from_slice(&descs);
            start
        } else {
            0
        };

        let flags = blas_build_flags(
            message.allow_update != 0,
            message.allow_compaction != 0,
            message.prefer_fast_build != 0,
        );
        let sizes = self
            .device()
            .acceleration_structure_build_sizes(&BuildInputs {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags,
                geometries: &bvh,
                instance_count: 0,
            });
        let buffer = match old_buffer.take() {
            Some(buffer) if buffer.size() >= sizes.acceleration_structure_size => buffer,
            old => {
                if let Some(old) = old {
                    frames.retire(old);
                }
                self.allocate_structure_buffer(sizes.acceleration_structure_size)?
            }
        };

        tracing::debug!(
            blas_id = id,
            geometry_id,
            geometry_count,
            size = sizes.acceleration_structure_size,
            "create blas"
        );
        *grow(&mut self.blases, id) = Some(BottomLevelAccelStruct {
            state: BlasState::PendingBuild,
            geometry_id,
            geometry_count,
            geometries: bvh,
            flags,
            sizes,
            buffer: Some(buffer),
        });
        self.builder
            .queue(id, vk::BuildAccelerationStructureModeKHR::BUILD);
        Ok(())
    }

    fn allocate_structure_buffer(&self, size: u64) -> VkResult<MemBuffer> {
        let alignment = self
            .device()
            .physical_device()
            .properties()
            .acceleration_structure_alignment as u64;
        self.allocator.allocate_buffer(&BufferRequest {
            size,
            alignment,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::DeviceLocal,
        })
    }

    /// Queues a rebuild or refit of a created structure. Unknown and released ids are ignored.
    pub fn build_blas(&mut self, id: u32, perform_update: bool) -> bool {
        let Some(blas) = self.blas(id) else {
            tracing::warn!(blas_id = id, "build of unknown blas");
            return false;
        };
        let mode = match blas.state {
            BlasState::Built if perform_update && blas.allows_update() => {
                vk::BuildAccelerationStructureModeKHR::UPDATE
            }
            BlasState::Built | BlasState::PendingBuild => {
                vk::BuildAccelerationStructureModeKHR::BUILD
            }
            BlasState::Unbuilt | BlasState::Released => {
                tracing::warn!(blas_id = id, state = ?blas.state, "build of released blas");
                return false;
            }
        };
        self.builder.queue(id, mode);
        true
    }

    /// Releases everything a structure owns except its buffer, which is handed back.
    fn detach_blas(&mut self, id: u32) -> Option<MemBuffer> {
        let blas = self.blases.get_mut(id as usize).and_then(Option::as_mut)?;
        if blas.state == BlasState::Released {
            return None;
        }
        blas.state = BlasState::Released;
        blas.geometries.clear();
        let buffer = blas.buffer.take();
        let (geometry_id, geometry_count) = (blas.geometry_id, blas.geometry_count);
        blas.geometry_count = 0;

        self.free_geometry_range(geometry_id, geometry_count);
        self.builder.cancel(id);
        let mut deactivated = 0;
        for instance in self.instances.iter_mut() {
            if instance.blas_id == id && instance.is_active() {
                instance.reference = 0;
                deactivated += 1;
            }
        }
        if deactivated > 0 {
            tracing::debug!(blas_id = id, deactivated, "released blas still instanced");
        }
        buffer
    }

    /// Releases a structure. Its buffer lives on until the device is done with the current frame.
    pub fn release_blas(&mut self, id: u32, frames: &mut FrameManager) -> bool {
        if self.blas_state(id) != BlasState::PendingBuild && self.blas_state(id) != BlasState::Built
        {
            return false;
        }
        if let Some(buffer) = self.detach_blas(id) {
            frames.retire(buffer);
        }
        tracing::debug!(blas_id = id, "release blas");
        true
    }

    /// Places a structure. Links right away when the structure is built, otherwise the instance
    /// waits for a later top level pass.
    pub fn create_instance(&mut self, message: &MsgCreateInstance, overrides: &[(u32, u32)]) {
        let id = message.instance_id;
        self.release_instance(id);

        let mask = message.instance_mask;
        let mask = if mask == 0 { 1 } else { mask };
        *grow(&mut self.instances, id) = Instance {
            transform: message.transform,
            prev_transform: message.prev_transform,
            blas_id: message.blas_id,
            custom_index: 0,
            mask,
            mirrored: message.is_mirrored != 0,
            instance_type: message.instance_type,
            reference: 0,
        };
        if !self.link_instance(id, overrides) {
            let blas_id = message.blas_id;
            tracing::trace!(instance_id = id, blas_id, "delay instance");
            self.delayed_instances.push(DelayedInstance {
                instance_id: id,
                overrides: overrides.to_vec(),
            });
        }
    }

    fn link_instance(&mut self, id: u32, overrides: &[(u32, u32)]) -> bool {
        let blas_id = self.instances[id as usize].blas_id;
        let Some(blas) = self.blas(blas_id).filter(|b| b.state == BlasState::Built) else {
            return false;
        };
        let (geometry_id, geometry_count) = blas.geometry_range();
        let reference = blas.device_address();

        let custom_index = if overrides.is_empty() || geometry_count == 0 {
            geometry_id
        } else {
            let start = self.allocate_geometry_range(geometry_count);
            let mut matched = vec![false; overrides.len()];
            for i in 0..geometry_count {
                let mut desc = self.geometry_descs[(geometry_id + i) as usize];
                let source = desc.material_id;
                if let Some(index) = overrides.iter().position(|&(src, _)| src == source) {
                    desc.material_id = overrides[index].1;
                    matched[index] = true;
                }
                self.geometry_descs[(start + i) as usize] = desc;
            }
            let unmatched = matched.iter().filter(|&&m| !m).count();
            if unmatched > 0 {
                tracing::debug!(
                    instance_id = id,
                    blas_id,
                    unmatched,
                    "material overrides without a match"
                );
            }
            *grow(&mut self.instance_geometries, id) = Some((start, geometry_count));
            start
        };

        let instance = &mut self.instances[id as usize];
        instance.custom_index = custom_index;
        instance.reference = reference;
        true
    }

    /// Clears an instance's descriptor and frees its private geometry range.
    pub fn release_instance(&mut self, id: u32) -> bool {
        self.delayed_instances.retain(|d| d.instance_id != id);
        if let Some((start, count)) = self
            .instance_geometries
            .get_mut(id as usize)
            .and_then(Option::take)
        {
            self.free_geometry_range(start, count);
        }
        match self.instances.get_mut(id as usize) {
            Some(instance) => {
                *instance = Instance::default();
                true
            }
            None => false,
        }
    }

    /// Marks a vertex buffer written by a pose pass, so builds of this frame wait for it.
    pub fn queue_pose(&mut self, vertex_buffer: vk::Buffer) {
        self.builder.queue_pose(vertex_buffer);
    }

    fn resolve_delayed_instances(&mut self) -> usize {
        if self.delayed_instances.is_empty() {
            return 0;
        }
        let delayed = std::mem::take(&mut self.delayed_instances);
        let before = delayed.len();
        for instance in delayed {
            if !self.link_instance(instance.instance_id, &instance.overrides) {
                self.delayed_instances.push(instance);
            }
        }
        let resolved = before - self.delayed_instances.len();
        tracing::trace!(
            resolved,
            remaining = self.delayed_instances.len(),
            "resolve delayed instances"
        );
        resolved
    }

    /// The per-frame acceleration structure pass.
    ///
    /// Records the queued bottom level builds, binds whatever delayed textures and instances
    /// became available, then rebuilds the top level structure over every instance.
    pub fn build_top_level(
        &mut self,
        materials: &mut MaterialTable,
        resources: &ResourceTable,
        frames: &mut FrameManager,
        recorder: &mut CommandRecorder,
    ) -> VkResult<()> {
        self.builder.flush(&mut self.blases, frames, recorder)?;
        materials.resolve_delayed(resources);
        self.resolve_delayed_instances();

        if self.instances.is_empty() {
            return Ok(());
        }
        let descs: Vec<InstanceDesc> = self.instances.iter().map(Instance::to_desc).collect();
        let instance_count = descs.len() as u32;
        let instances = frames.upload(instance_bytes(&descs), 16)?;

        let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        let sizes = self
            .device()
            .acceleration_structure_build_sizes(&BuildInputs {
                ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                flags,
                geometries: &[],
                instance_count,
            });
        let tlas = match self.tlas.take() {
            Some(tlas) if tlas.size() >= sizes.acceleration_structure_size => tlas,
            old => {
                if let Some(old) = old {
                    frames.retire(old);
                }
                self.allocate_structure_buffer(sizes.acceleration_structure_size)?
            }
        };
        let scratch_address = frames.allocate_scratch(sizes.build_scratch_size)?;
        recorder.build_acceleration_structure(AccelerationStructureBuild {
            ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            flags,
            dst: tlas.buffer,
            dst_address: tlas.get_device_address(),
            src_address: 0,
            scratch_address,
            geometries: Vec::new(),
            instances,
            instance_count,
        });
        recorder.uav_barrier(ResourceRef::Buffer(tlas.buffer));
        tracing::debug!(instance_count, size = tlas.size(), "build tlas");
        self.tlas = Some(tlas);
        Ok(())
    }

    /// Uploads the geometry descriptor array for this frame. Never empty, so the shaders always
    /// get a valid address.
    pub fn upload_geometry_descs(
        &mut self,
        frames: &mut FrameManager,
    ) -> VkResult<vk::DeviceAddress> {
        let len = (self.geometry_slots.len() as usize).max(1);
        if self.geometry_descs.len() < len {
            self.geometry_descs.resize(len, GeometryDesc::default());
        }
        frames.upload(bytemuck::cast_slice(&self.geometry_descs[..len]), 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::Command, descriptor::DescriptorHeap, frames::Options, headless::HeadlessDevice,
    };
    use bytemuck::Zeroable;

    struct Fixture {
        headless: HeadlessDevice,
        heap: DescriptorHeap,
        frames: FrameManager,
        resources: ResourceTable,
        materials: MaterialTable,
        manager: AccelStructManager,
        recorder: CommandRecorder,
    }

    impl Fixture {
        fn new() -> Self {
            let headless = HeadlessDevice::new();
            let device = Device::new(headless.clone());
            let allocator = Arc::new(Allocator::new(device.clone()));
            let mut fixture = Self {
                headless,
                heap: DescriptorHeap::new(device),
                frames: FrameManager::new(
                    allocator.clone(),
                    Options {
                        frames_in_flight: 2,
                        scratch_buffer_size: 64 * 1024,
                        upload_chunk_size: 64 * 1024,
                    },
                ),
                resources: ResourceTable::new(),
                materials: MaterialTable::new(),
                manager: AccelStructManager::new(allocator),
                recorder: CommandRecorder::new(),
            };
            fixture
                .resources
                .create_vertex_buffer(&mut fixture.heap, &mut fixture.frames, 1, 48)
                .unwrap();
            fixture
                .resources
                .create_index_buffer(&mut fixture.heap, &mut fixture.frames, 2, 12)
                .unwrap();
            fixture
        }

        fn create_blas(&mut self, blas_id: u32, materials: &[u32]) {
            let geometries: Vec<GeometryDescription> = materials
                .iter()
                .map(|&material_id| GeometryDescription {
                    index_buffer_id: 2,
                    index_count: 6,
                    vertex_buffer_id: 1,
                    vertex_stride: 12,
                    vertex_count: 4,
                    material_id,
                    ..Zeroable::zeroed()
                })
                .collect();
            let message = MsgCreateBottomLevelAccelStruct {
                allow_update: 1,
                blas_id,
                ..Zeroable::zeroed()
            };
            self.manager
                .create_blas(&message, &geometries, &self.resources, &mut self.frames)
                .unwrap();
        }

        fn create_instance(&mut self, instance_id: u32, blas_id: u32, overrides: &[(u32, u32)]) {
            let message = MsgCreateInstance {
                instance_id,
                blas_id,
                ..Zeroable::zeroed()
            };
            self.manager.create_instance(&message, overrides);
        }

        fn frame(&mut self) {
            self.manager
                .build_top_level(
                    &mut self.materials,
                    &self.resources,
                    &mut self.frames,
                    &mut self.recorder,
                )
                .unwrap();
            self.frames.end_frame(&mut self.recorder).unwrap();
        }
    }

    type BuildKind = (
        vk::AccelerationStructureTypeKHR,
        vk::BuildAccelerationStructureModeKHR,
    );

    fn builds(commands: &[Command]) -> Vec<BuildKind> {
        commands
            .iter()
            .filter_map(|command| match command {
                Command::BuildAccelerationStructure(build) => Some((build.ty, build.mode)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn instance_waits_for_its_blas() {
        let mut f = Fixture::new();
        f.create_instance(0, 5, &[]);
        assert_eq!(f.manager.delayed_instance_count(), 1);
        assert!(!f.manager.instance(0).unwrap().is_active());

        f.create_blas(5, &[3]);
        assert_eq!(f.manager.blas_state(5), BlasState::PendingBuild);
        f.frame();

        assert_eq!(f.manager.blas_state(5), BlasState::Built);
        assert_eq!(f.manager.delayed_instance_count(), 0);
        let instance = f.manager.instance(0).unwrap();
        assert_eq!(instance.reference, f.manager.blas(5).unwrap().device_address());
        assert_eq!(instance.mask, 1);
        assert_ne!(f.manager.tlas_address(), 0);
        assert_eq!(
            builds(&f.headless.last_submission()),
            vec![
                (
                    vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    vk::BuildAccelerationStructureModeKHR::BUILD
                ),
                (
                    vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    vk::BuildAccelerationStructureModeKHR::BUILD
                ),
            ]
        );
    }

    #[test]
    fn delayed_instances_keep_their_order() {
        let mut f = Fixture::new();
        f.create_instance(0, 7, &[]);
        f.create_instance(1, 8, &[]);
        f.create_instance(2, 7, &[]);
        f.create_blas(8, &[0]);
        f.frame();
        assert_eq!(f.manager.delayed_instance_count(), 2);
        let remaining: Vec<u32> = f
            .manager
            .delayed_instances
            .iter()
            .map(|d| d.instance_id)
            .collect();
        assert_eq!(remaining, vec![0, 2]);
        assert!(f.manager.instance(1).unwrap().is_active());
    }

    #[test]
    fn overrides_get_a_private_range() {
        let mut f = Fixture::new();
        f.create_blas(1, &[10, 11]);
        f.frame();
        f.create_instance(0, 1, &[(11, 40), (99, 41)]);
        f.create_instance(1, 1, &[]);

        let (shared, count) = f.manager.blas(1).unwrap().geometry_range();
        assert_eq!(f.manager.instance(1).unwrap().custom_index, shared);
        let private = f.manager.instance(0).unwrap().custom_index;
        assert_ne!(private, shared);
        assert_eq!(count, 2);
        assert_eq!(f.manager.geometry_desc(private).unwrap().material_id, 10);
        assert_eq!(f.manager.geometry_desc(private + 1).unwrap().material_id, 40);
        assert_eq!(f.manager.geometry_desc(shared + 1).unwrap().material_id, 11);

        f.manager.release_instance(0);
        assert_eq!(f.manager.geometry_slots().len(), 4);
        assert_eq!(
            f.manager.geometry_slots().free_runs().collect::<Vec<_>>(),
            vec![(private, 2)]
        );
    }

    #[test]
    fn overrides_match_the_original_material_once() {
        let mut f = Fixture::new();
        f.create_blas(1, &[10, 11]);
        f.frame();
        f.create_instance(0, 1, &[(10, 11), (11, 12)]);
        f.create_instance(1, 1, &[(10, 11), (11, 10)]);
        f.create_instance(2, 1, &[(10, 20), (10, 30), (55, 56)]);

        let materials = |f: &Fixture, instance: u32| -> Vec<u32> {
            let start = f.manager.instance(instance).unwrap().custom_index;
            (start..start + 2)
                .map(|slot| f.manager.geometry_desc(slot).unwrap().material_id)
                .collect()
        };
        assert_eq!(materials(&f, 0), vec![11, 12]);
        assert_eq!(materials(&f, 1), vec![11, 10]);
        assert_eq!(materials(&f, 2), vec![20, 11]);
        let (shared, _) = f.manager.blas(1).unwrap().geometry_range();
        assert_eq!(f.manager.geometry_desc(shared).unwrap().material_id, 10);
    }

    #[test]
    fn update_requires_a_built_updatable_blas() {
        let mut f = Fixture::new();
        f.create_blas(3, &[0]);
        assert!(f.manager.build_blas(3, true));
        assert_eq!(f.manager.pending_builds(), 1);
        f.frame();

        assert!(f.manager.build_blas(3, true));
        f.frame();
        assert_eq!(
            builds(&f.headless.last_submission())[0].1,
            vk::BuildAccelerationStructureModeKHR::UPDATE
        );
        assert!(!f.manager.build_blas(9, false));
    }

    #[test]
    fn released_blas_outlives_the_frame() {
        let mut f = Fixture::new();
        f.create_blas(2, &[0]);
        f.create_instance(4, 2, &[]);
        f.frame();
        let buffer = f.manager.blas(2).unwrap().raw_buffer().unwrap();

        assert!(f.manager.release_blas(2, &mut f.frames));
        assert_eq!(f.manager.blas_state(2), BlasState::Released);
        assert!(!f.manager.instance(4).unwrap().is_active());
        assert_eq!(f.manager.geometry_slots().len(), 1);
        assert_eq!(f.manager.geometry_slots().free_count(), 1);
        f.frame();
        assert!(f.headless.is_buffer_alive(buffer));
        f.frame();
        assert!(!f.headless.is_buffer_alive(buffer));
        assert!(!f.manager.release_blas(2, &mut f.frames));
    }

    #[test]
    fn recreate_reuses_a_large_enough_buffer() {
        let mut f = Fixture::new();
        f.create_blas(6, &[0, 1]);
        f.frame();
        let buffer = f.manager.blas(6).unwrap().raw_buffer();
        f.create_blas(6, &[2]);
        assert_eq!(f.manager.blas(6).unwrap().raw_buffer(), buffer);
        assert_eq!(f.manager.blas_state(6), BlasState::PendingBuild);
        assert_eq!(f.manager.blas(6).unwrap().geometry_range().1, 1);
    }
}
