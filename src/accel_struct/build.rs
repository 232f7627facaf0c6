use ash::{prelude::VkResult, vk};

use super::{BlasState, BottomLevelAccelStruct};
use crate::{
    command::{AccelerationStructureBuild, CommandRecorder, ResourceRef},
    frames::FrameManager,
    message::{geometry_flags, GeometryDescription},
};

/// Build flags for a bottom level structure.
pub fn blas_build_flags(
    allow_update: bool,
    allow_compaction: bool,
    prefer_fast_build: bool,
) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut flags = if prefer_fast_build {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
    } else {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
    };
    if allow_update {
        flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if allow_compaction {
        flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    flags
}

/// Alpha tested geometry has to run its any-hit shader, so only the rest is opaque.
pub fn bvh_geometry_flags(flags: u32) -> vk::GeometryFlagsKHR {
    if flags & (geometry_flags::TRANSPARENT | geometry_flags::PUNCH_THROUGH) != 0 {
        vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION
    } else {
        vk::GeometryFlagsKHR::OPAQUE
    }
}

/// Checks a geometry against the buffers it points into. `None` sizes stand for missing buffers.
///
/// Violations are fatal in debug builds and tolerated in release.
pub fn validate_geometry(
    desc: &GeometryDescription,
    index_buffer_size: Option<u64>,
    vertex_buffer_size: Option<u64>,
) -> bool {
    let index_count = desc.index_count as u64;
    let index_offset = desc.index_offset as u64;
    let vertex_bytes = desc.vertex_count as u64 * desc.vertex_stride as u64;
    let position_offset = desc.position_offset as u64;

    let mut problems = Vec::new();
    if index_count % 3 != 0 {
        problems.push("index count is not a multiple of 3");
    }
    if position_offset % 4 != 0 {
        problems.push("position offset is not 4 byte aligned");
    }
    match index_buffer_size {
        Some(size) if size >= index_offset + index_count * 2 => {}
        Some(_) => problems.push("index buffer is too small"),
        None => problems.push("index buffer does not exist"),
    }
    match vertex_buffer_size {
        Some(size) if size.saturating_sub(position_offset) >= vertex_bytes => {}
        Some(_) => problems.push("vertex buffer is too small"),
        None => problems.push("vertex buffer does not exist"),
    }
    let (index_buffer, vertex_buffer) = (desc.index_buffer_id, desc.vertex_buffer_id);
    for problem in &problems {
        tracing::warn!(
            index_buffer,
            vertex_buffer,
            "malformed geometry: {}",
            problem
        );
    }
    debug_assert!(problems.is_empty(), "malformed geometry: {:?}", problems);
    problems.is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBuild {
    pub blas_id: u32,
    pub mode: vk::BuildAccelerationStructureModeKHR,
}

/// Batches the bottom level builds of a frame.
///
/// Builds are recorded in queue order right before the top level build, each one with its own
/// scratch range and followed by a UAV barrier on its result.
#[derive(Default)]
pub struct AccelerationStructureBuilder {
    pending: Vec<PendingBuild>,
    /// Vertex buffers written by a pose pass this frame.
    pending_poses: Vec<vk::Buffer>,
}

impl AccelerationStructureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a build. A structure queued twice is built once; a full build wins over an update.
    pub fn queue(&mut self, blas_id: u32, mode: vk::BuildAccelerationStructureModeKHR) {
        if let Some(existing) = self.pending.iter_mut().find(|p| p.blas_id == blas_id) {
            if mode == vk::BuildAccelerationStructureModeKHR::BUILD {
                existing.mode = mode;
            }
            return;
        }
        self.pending.push(PendingBuild { blas_id, mode });
    }

    pub fn queue_pose(&mut self, vertex_buffer: vk::Buffer) {
        if !self.pending_poses.contains(&vertex_buffer) {
            self.pending_poses.push(vertex_buffer);
        }
    }

    /// Drops a queued build of a released structure.
    pub fn cancel(&mut self, blas_id: u32) {
        self.pending.retain(|p| p.blas_id != blas_id);
    }

    pub fn pending(&self) -> &[PendingBuild] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.pending_poses.is_empty()
    }

    /// Records every queued build. Returns the number of structures built.
    pub fn flush(
        &mut self,
        blases: &mut [Option<BottomLevelAccelStruct>],
        frames: &mut FrameManager,
        recorder: &mut CommandRecorder,
    ) -> VkResult<usize> {
        for buffer in self.pending_poses.drain(..) {
            recorder.uav_barrier(ResourceRef::Buffer(buffer));
        }
        recorder.commit_barriers();

        let mut built = 0;
        for PendingBuild { blas_id, mode } in std::mem::take(&mut self.pending) {
            let Some(blas) = blases.get_mut(blas_id as usize).and_then(Option::as_mut) else {
                continue;
            };
            let Some(buffer) = blas.buffer.as_ref() else {
                continue;
            };
            let update = mode == vk::BuildAccelerationStructureModeKHR::UPDATE
                && blas.state == BlasState::Built
                && blas.allows_update();
            let (mode, scratch_size, src_address) = if update {
                (mode, blas.sizes.update_scratch_size, buffer.get_device_address())
            } else {
                (
                    vk::BuildAccelerationStructureModeKHR::BUILD,
                    blas.sizes.build_scratch_size,
                    0,
                )
            };
            let scratch_address = frames.allocate_scratch(scratch_size)?;
            let dst = buffer.buffer;
            recorder.build_acceleration_structure(AccelerationStructureBuild {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                mode,
                flags: blas.flags,
                dst,
                dst_address: buffer.get_device_address(),
                src_address,
                scratch_address,
                geometries: blas.geometries.clone(),
                instances: 0,
                instance_count: 0,
            });
            recorder.uav_barrier(ResourceRef::Buffer(dst));
            blas.state = BlasState::Built;
            built += 1;
            tracing::debug!(blas_id, ?mode, geometries = blas.geometries.len(), "build blas");
        }
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[test]
    fn queue_deduplicates() {
        let mut builder = AccelerationStructureBuilder::new();
        builder.queue(4, vk::BuildAccelerationStructureModeKHR::UPDATE);
        builder.queue(2, vk::BuildAccelerationStructureModeKHR::BUILD);
        builder.queue(4, vk::BuildAccelerationStructureModeKHR::BUILD);
        builder.queue(2, vk::BuildAccelerationStructureModeKHR::UPDATE);
        assert_eq!(
            builder.pending(),
            &[
                PendingBuild {
                    blas_id: 4,
                    mode: vk::BuildAccelerationStructureModeKHR::BUILD
                },
                PendingBuild {
                    blas_id: 2,
                    mode: vk::BuildAccelerationStructureModeKHR::BUILD
                },
            ]
        );
        builder.cancel(4);
        assert_eq!(builder.pending().len(), 1);
    }

    #[test]
    fn flags() {
        assert_eq!(
            blas_build_flags(true, false, true),
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
        );
        assert_eq!(
            bvh_geometry_flags(geometry_flags::PUNCH_THROUGH),
            vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION
        );
        assert_eq!(bvh_geometry_flags(0), vk::GeometryFlagsKHR::OPAQUE);
    }

    #[test]
    fn well_formed_geometry_passes() {
        let desc = GeometryDescription {
            index_count: 6,
            vertex_count: 4,
            vertex_stride: 12,
            ..Zeroable::zeroed()
        };
        assert!(validate_geometry(&desc, Some(12), Some(48)));
    }
}
