use std::sync::Arc;

use ash::{prelude::VkResult, vk};
use smallvec::smallvec;

use super::{
    globals::{pixel_jitter, BlueNoise, GlobalsRT},
    render_targets::{RenderTarget, RenderTargets},
    sbt::{RaygenPass, Sbt, SbtLayout},
    upscaler::{Upscaler, UpscalerDispatch, UpscalerInit},
};
use crate::{
    accel_struct::AccelStructManager,
    backend::GraphicsPipelineDesc,
    command::{Command, CommandRecorder, RaytracingRoot},
    config::QualityMode,
    descriptor::DescriptorHeap,
    fixed_function::{DirtyFlags, FixedFunctionState},
    frames::FrameManager,
    material::{Material, MaterialTable},
    message::{MsgComputePose, MsgTraceRays, PoseGeometry},
    pipeline::Pipeline,
    resources::{alloc::Allocator, table::ResourceTable},
    Device, HasDevice,
};

const BLUE_NOISE_SEED: u64 = 0x5eed_b1fe;
const RESOLVE_GROUP_SIZE: u32 = 32;
const SKINNING_GROUP_SIZE: u32 = 64;
/// Row-major 3x4 f32 matrix.
const NODE_MATRIX_SIZE: usize = 48;
const POSE_GEOMETRY_SIZE: usize = std::mem::size_of::<PoseGeometry>();

/// Outputs of the primary pass that the secondary passes read.
const PRIMARY_OUTPUTS: [RenderTarget; 3] = [
    RenderTarget::PositionAndFlags,
    RenderTarget::Normal,
    RenderTarget::SpecularPower,
];

const RESOLVE_INPUTS: [RenderTarget; 8] = [
    RenderTarget::Diffuse,
    RenderTarget::Specular,
    RenderTarget::SpecularLevel,
    RenderTarget::Emission,
    RenderTarget::Falloff,
    RenderTarget::Shadow,
    RenderTarget::GlobalIllumination,
    RenderTarget::Reflection,
];

/// Everything a traced frame reads or records into.
pub struct Scene<'a> {
    pub heap: &'a mut DescriptorHeap,
    pub frames: &'a mut FrameManager,
    pub recorder: &'a mut CommandRecorder,
    pub resources: &'a ResourceTable,
    pub materials: &'a mut MaterialTable,
    pub accel: &'a mut AccelStructManager,
    pub state: &'a mut FixedFunctionState,
}

/// The per-frame ray tracing passes and the pipelines they run.
pub struct RaytracingPipeline {
    device: Arc<Device>,
    pipeline: Pipeline,
    sbt: Sbt,
    resolve: Pipeline,
    skinning: Pipeline,
    copy: Pipeline,
    upscaler: Box<dyn Upscaler>,
    quality_mode: QualityMode,
    render_targets: Option<RenderTargets>,
    frame: u32,
    blue_noise: BlueNoise,
}

impl HasDevice for RaytracingPipeline {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl RaytracingPipeline {
    pub fn new(
        allocator: &Arc<Allocator>,
        quality_mode: QualityMode,
        upscaler: Box<dyn Upscaler>,
    ) -> VkResult<Self> {
        let device = allocator.device().clone();
        let layout = SbtLayout::new();
        let pipeline = Pipeline::ray_tracing(device.clone(), &layout)?;
        let sbt = Sbt::new(allocator, &pipeline, &layout)?;
        let resolve = Pipeline::compute(device.clone(), "Resolve")?;
        let skinning = Pipeline::compute(device.clone(), "Skinning")?;
        let copy = Pipeline::graphics(
            device.clone(),
            &GraphicsPipelineDesc {
                vertex_entry: "CopyVertexShader",
                pixel_entry: "CopyPixelShader",
                color_format: vk::Format::B8G8R8A8_UNORM,
                depth_format: vk::Format::D24_UNORM_S8_UINT,
            },
        )?;
        Ok(Self {
            device,
            pipeline,
            sbt,
            resolve,
            skinning,
            copy,
            upscaler,
            quality_mode,
            render_targets: None,
            frame: 0,
            blue_noise: BlueNoise::new(BLUE_NOISE_SEED),
        })
    }

    /// Number of frames traced so far.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn render_targets(&self) -> Option<&RenderTargets> {
        self.render_targets.as_ref()
    }

    pub fn sbt(&self) -> &Sbt {
        &self.sbt
    }

    /// Recreates the render targets when the output size changed.
    fn prepare_render_targets(
        &mut self,
        output_extent: vk::Extent2D,
        heap: &mut DescriptorHeap,
        frames: &mut FrameManager,
    ) -> VkResult<()> {
        if let Some(targets) = &self.render_targets {
            if targets.output_extent() == output_extent {
                return Ok(());
            }
        }
        self.upscaler.init(&UpscalerInit {
            output_extent,
            quality_mode: self.quality_mode,
        });
        if let Some(old) = self.render_targets.take() {
            old.release(heap, frames);
        }
        let render_extent = vk::Extent2D {
            width: self.upscaler.width(),
            height: self.upscaler.height(),
        };
        self.render_targets = Some(RenderTargets::new(
            &self.device,
            heap,
            render_extent,
            output_extent,
        )?);
        Ok(())
    }

    pub fn trace_rays(&mut self, message: &MsgTraceRays, scene: Scene) -> VkResult<()> {
        let Scene {
            heap,
            frames,
            recorder,
            resources,
            materials,
            accel,
            state,
        } = scene;
        let (width, height) = (message.width, message.height);
        let output_extent = vk::Extent2D {
            width: (width as u32).max(1),
            height: (height as u32).max(1),
        };
        self.prepare_render_targets(output_extent, heap, frames)?;
        let Some(targets) = self.render_targets.as_ref() else {
            return Ok(());
        };
        let render_extent = targets.render_extent();

        accel.build_top_level(materials, resources, frames, recorder)?;

        let constant_alignment = self
            .device
            .physical_device()
            .properties()
            .constant_buffer_alignment as u64;
        let globals_vs = frames.upload(state.vs_constant_bytes(), constant_alignment)?;
        let globals_ps = frames.upload(state.ps_constant_bytes(), constant_alignment)?;
        let blue_noise_texture = resources
            .texture(message.blue_noise_texture_id)
            .map_or(DescriptorHeap::NULL_SLOT, |texture| texture.srv());
        let globals = GlobalsRT::new(
            message,
            self.frame,
            self.blue_noise.next_offset(),
            blue_noise_texture,
            render_extent,
            output_extent,
        );
        let globals_rt = frames.upload(bytemuck::bytes_of(&globals), constant_alignment)?;
        let geometry_descs = accel.upload_geometry_descs(frames)?;
        let inert = Material::default();
        let material_bytes = if materials.is_empty() {
            bytemuck::bytes_of(&inert)
        } else {
            materials.as_bytes()
        };
        let materials_address = frames.upload(material_bytes, 16)?;

        recorder.bind_pipeline(self.pipeline.bind_point(), self.pipeline.raw());
        recorder.push(Command::BindRaytracingRoot(RaytracingRoot {
            globals_vs,
            globals_ps,
            globals_rt,
            top_level: accel.tlas_address(),
            output_table: targets.uav_start(),
            geometry_descs,
            materials: materials_address,
        }));
        recorder.trace_rays(&self.sbt, RaygenPass::Primary, render_extent);
        targets.barrier(recorder, &PRIMARY_OUTPUTS);
        for pass in [
            RaygenPass::Shadow,
            RaygenPass::GlobalIllumination,
            RaygenPass::Reflection,
        ] {
            recorder.trace_rays(&self.sbt, pass, render_extent);
        }

        targets.barrier(recorder, &RESOLVE_INPUTS);
        recorder.bind_pipeline(self.resolve.bind_point(), self.resolve.raw());
        recorder.push(Command::BindComputeRoot {
            addresses: smallvec![globals_rt],
            descriptor_table: targets.uav_start(),
        });
        recorder.dispatch(
            (render_extent.width + RESOLVE_GROUP_SIZE - 1) / RESOLVE_GROUP_SIZE,
            (render_extent.height + RESOLVE_GROUP_SIZE - 1) / RESOLVE_GROUP_SIZE,
            1,
        );
        targets.barrier(recorder, &[RenderTarget::Color, RenderTarget::Depth]);
        let color = targets.image(RenderTarget::Color);
        let depth = targets.image(RenderTarget::Depth);
        for image in [color, depth] {
            recorder.transition(
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }

        let reset_accumulation = message.reset_accumulation != 0;
        self.upscaler.dispatch(
            recorder,
            &UpscalerDispatch {
                color,
                depth,
                motion_vectors: targets.image(RenderTarget::MotionVectors),
                output: targets.output(),
                render_extent,
                output_extent,
                jitter: pixel_jitter(self.frame),
                reset_accumulation,
            },
        );

        self.copy_to_render_target(targets, resources, state, recorder);
        for image in [color, depth] {
            recorder.transition(
                image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::GENERAL,
            );
        }

        state.mark_dirty(DirtyFlags::AFTER_TRACE);
        state.clear_dirty(DirtyFlags::RENDER_TARGET_AND_DEPTH_STENCIL);
        tracing::debug!(
            frame = self.frame,
            width = render_extent.width,
            height = render_extent.height,
            reset_accumulation,
            "trace rays"
        );
        self.frame = self.frame.wrapping_add(1);
        Ok(())
    }

    /// Draws the upscaled output and its depth over the game's current render target.
    fn copy_to_render_target(
        &self,
        targets: &RenderTargets,
        resources: &ResourceTable,
        state: &FixedFunctionState,
        recorder: &mut CommandRecorder,
    ) {
        let output = targets.output();
        let extent = targets.output_extent();
        recorder.transition(
            output,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        recorder.push(Command::SetViewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }));
        recorder.push(Command::SetScissor(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        }));
        let (color, depth_stencil) = state.render_target_images(resources);
        recorder.push(Command::SetRenderTargets {
            color,
            depth_stencil,
        });
        recorder.bind_pipeline(self.copy.bind_point(), self.copy.raw());
        recorder.push(Command::BindTextures(smallvec![
            targets.output_srv(),
            targets.depth_srv()
        ]));
        recorder.push(Command::Draw {
            vertex_count: 6,
            instance_count: 1,
        });
        recorder.transition(
            output,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
    }

    /// Skins the geometries of a pose into the destination vertex buffer, back to back.
    ///
    /// Returns false when the message is dropped: unknown destination or a short payload.
    pub fn compute_pose(
        &mut self,
        message: &MsgComputePose,
        payload: &[u8],
        resources: &ResourceTable,
        frames: &mut FrameManager,
        recorder: &mut CommandRecorder,
        accel: &mut AccelStructManager,
    ) -> VkResult<bool> {
        let (vertex_buffer_id, node_count, geometry_count) = (
            message.vertex_buffer_id,
            message.node_count as usize,
            message.geometry_count as usize,
        );
        let Some(destination) = resources.vertex_buffer(vertex_buffer_id) else {
            tracing::warn!(vertex_buffer_id, "pose into unknown vertex buffer");
            return Ok(false);
        };
        let nodes_len = node_count * NODE_MATRIX_SIZE;
        let expected = nodes_len + geometry_count * POSE_GEOMETRY_SIZE;
        if payload.len() < expected {
            tracing::warn!(
                vertex_buffer_id,
                len = payload.len(),
                expected,
                "truncated pose payload"
            );
            return Ok(false);
        }

        let nodes = frames.upload(&payload[..nodes_len], 16)?;
        recorder.bind_pipeline(self.skinning.bind_point(), self.skinning.raw());
        let mut dst_address = destination.buffer().get_device_address();
        for record in payload[nodes_len..expected].chunks_exact(POSE_GEOMETRY_SIZE) {
            let geometry: PoseGeometry = bytemuck::pod_read_unaligned(record);
            let (source_id, vertex_count, vertex_stride) = (
                geometry.vertex_buffer_id,
                geometry.vertex_count,
                geometry.vertex_stride,
            );
            let written = vertex_count as u64 * vertex_stride as u64;
            match resources.vertex_buffer(source_id) {
                Some(source) => {
                    let constants = frames.upload(record, 16)?;
                    recorder.push(Command::BindComputeRoot {
                        addresses: smallvec![
                            nodes,
                            constants,
                            source.buffer().get_device_address(),
                            dst_address
                        ],
                        descriptor_table: DescriptorHeap::NULL_SLOT,
                    });
                    recorder.dispatch(
                        (vertex_count + SKINNING_GROUP_SIZE - 1) / SKINNING_GROUP_SIZE,
                        1,
                        1,
                    );
                }
                None => tracing::warn!(source_id, "pose from unknown vertex buffer"),
            }
            dst_address += written;
        }
        accel.queue_pose(destination.buffer().buffer);
        tracing::trace!(vertex_buffer_id, node_count, geometry_count, "compute pose");
        Ok(true)
    }

    /// Frees the render targets with the current frame.
    pub fn release(&mut self, heap: &mut DescriptorHeap, frames: &mut FrameManager) {
        if let Some(targets) = self.render_targets.take() {
            targets.release(heap, frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frames::Options, headless::HeadlessDevice, message::Opcode, ray_tracing::ScalingUpscaler,
    };
    use bytemuck::Zeroable;

    struct Fixture {
        headless: HeadlessDevice,
        heap: DescriptorHeap,
        frames: FrameManager,
        recorder: CommandRecorder,
        resources: ResourceTable,
        materials: MaterialTable,
        accel: AccelStructManager,
        state: FixedFunctionState,
        pipeline: RaytracingPipeline,
    }

    impl Fixture {
        fn new() -> Self {
            let headless = HeadlessDevice::new();
            let device = Device::new(headless.clone());
            let allocator = Arc::new(Allocator::new(device.clone()));
            let pipeline = RaytracingPipeline::new(
                &allocator,
                QualityMode::Native,
                Box::new(ScalingUpscaler::new()),
            )
            .unwrap();
            Self {
                headless,
                heap: DescriptorHeap::new(device),
                frames: FrameManager::new(allocator.clone(), Options::default()),
                recorder: CommandRecorder::new(),
                resources: ResourceTable::new(),
                materials: MaterialTable::new(),
                accel: AccelStructManager::new(allocator),
                state: FixedFunctionState::new(),
                pipeline,
            }
        }

        fn trace(&mut self, width: u16, height: u16) -> Vec<Command> {
            let mut message = MsgTraceRays::zeroed();
            message.id = Opcode::TraceRays as u8;
            message.width = width;
            message.height = height;
            self.pipeline
                .trace_rays(
                    &message,
                    Scene {
                        heap: &mut self.heap,
                        frames: &mut self.frames,
                        recorder: &mut self.recorder,
                        resources: &self.resources,
                        materials: &mut self.materials,
                        accel: &mut self.accel,
                        state: &mut self.state,
                    },
                )
                .unwrap();
            self.recorder.finish()
        }
    }

    #[test]
    fn passes_run_in_order() {
        let mut fixture = Fixture::new();
        let commands = fixture.trace(64, 64);

        let base = fixture.pipeline.sbt().buffer().get_device_address();
        let raygens: Vec<u64> = commands
            .iter()
            .filter_map(|command| match command {
                Command::TraceRays {
                    raygen,
                    width: 64,
                    height: 64,
                    ..
                } => Some(raygen.device_address - base),
                _ => None,
            })
            .collect();
        assert_eq!(raygens, vec![0, 64, 128, 192]);

        let position = |pred: &dyn Fn(&Command) -> bool| commands.iter().position(pred).unwrap();
        let resolve = position(&|c: &Command| matches!(c, Command::Dispatch { x: 2, y: 2, z: 1 }));
        let blit = position(&|c: &Command| matches!(c, Command::BlitImage { .. }));
        let draw = position(&|c: &Command| {
            matches!(
                c,
                Command::Draw {
                    vertex_count: 6,
                    instance_count: 1
                }
            )
        });
        assert!(resolve < blit && blit < draw);
        assert!(matches!(commands.last(), Some(Command::PipelineBarrier(_))));

        let dirty = fixture.state.dirty();
        assert!(dirty.contains(DirtyFlags::AFTER_TRACE));
        assert!(!dirty.contains(DirtyFlags::RENDER_TARGET_AND_DEPTH_STENCIL));
        assert_eq!(fixture.pipeline.frame(), 1);
    }

    #[test]
    fn render_targets_follow_the_output_size() {
        let mut fixture = Fixture::new();
        fixture.trace(64, 64);
        let color = fixture
            .pipeline
            .render_targets()
            .unwrap()
            .image(RenderTarget::Color);
        fixture.trace(64, 64);
        assert_eq!(
            fixture
                .pipeline
                .render_targets()
                .unwrap()
                .image(RenderTarget::Color),
            color
        );

        fixture.trace(128, 32);
        let targets = fixture.pipeline.render_targets().unwrap();
        assert_ne!(targets.image(RenderTarget::Color), color);
        assert_eq!(targets.render_extent().width, 128);
        assert!(fixture.headless.is_image_alive(color));
        fixture.frames.end_frame(&mut fixture.recorder).unwrap();
        fixture.frames.end_frame(&mut fixture.recorder).unwrap();
        assert!(!fixture.headless.is_image_alive(color));
    }

    #[test]
    fn pose_dispatches_per_geometry() {
        let mut fixture = Fixture::new();
        fixture
            .resources
            .create_vertex_buffer(&mut fixture.heap, &mut fixture.frames, 1, 4096)
            .unwrap();
        let destination = fixture
            .resources
            .create_vertex_buffer(&mut fixture.heap, &mut fixture.frames, 2, 4096)
            .unwrap()
            .buffer()
            .get_device_address();

        let geometry = |vertex_count| PoseGeometry {
            vertex_buffer_id: 1,
            vertex_count,
            vertex_stride: 16,
            ..PoseGeometry::zeroed()
        };
        let mut payload = vec![0u8; 2 * NODE_MATRIX_SIZE];
        payload.extend_from_slice(bytemuck::bytes_of(&geometry(100)));
        payload.extend_from_slice(bytemuck::bytes_of(&geometry(10)));
        let message = MsgComputePose {
            id: Opcode::ComputePose as u8,
            vertex_buffer_id: 2,
            node_count: 2,
            geometry_count: 2,
            data_size: payload.len() as u32,
            ..MsgComputePose::zeroed()
        };
        assert!(fixture
            .pipeline
            .compute_pose(
                &message,
                &payload,
                &fixture.resources,
                &mut fixture.frames,
                &mut fixture.recorder,
                &mut fixture.accel,
            )
            .unwrap());

        let commands = fixture.recorder.finish();
        let dispatches: Vec<u32> = commands
            .iter()
            .filter_map(|command| match command {
                Command::Dispatch { x, .. } => Some(*x),
                _ => None,
            })
            .collect();
        assert_eq!(dispatches, vec![2, 1]);
        let destinations: Vec<u64> = commands
            .iter()
            .filter_map(|command| match command {
                Command::BindComputeRoot { addresses, .. } => Some(addresses[3]),
                _ => None,
            })
            .collect();
        assert_eq!(destinations, vec![destination, destination + 1600]);

        assert!(!fixture
            .pipeline
            .compute_pose(
                &message,
                &payload[..50],
                &fixture.resources,
                &mut fixture.frames,
                &mut fixture.recorder,
                &mut fixture.accel,
            )
            .unwrap());
    }
}
