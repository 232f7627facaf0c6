//! The consumer's state and the handler behind every opcode.
use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{
    accel_struct::AccelStructManager,
    command::CommandRecorder,
    config::Config,
    descriptor::{sampler::SamplerCache, DescriptorHeap},
    error::BridgeError,
    fixed_function::FixedFunctionState,
    frames::{self, FrameManager},
    material::MaterialTable,
    message::*,
    ray_tracing::{RaytracingPipeline, ScalingUpscaler, Scene, Upscaler},
    resources::{
        alloc::Allocator,
        table::{ResourceTable, Texture},
    },
    Device, HasDevice,
};

const GEOMETRY_DESCRIPTION_SIZE: usize = std::mem::size_of::<GeometryDescription>();
const MATERIAL_OVERRIDE_SIZE: usize = 8;

/// Owns every subsystem of the consumer and replays received blocks into them.
///
/// Each processed block is one frame: the commands it records are submitted when the block ends.
pub struct BridgeContext {
    device: Arc<Device>,
    heap: DescriptorHeap,
    samplers: SamplerCache,
    frames: FrameManager,
    recorder: CommandRecorder,
    resources: ResourceTable,
    materials: MaterialTable,
    accel: AccelStructManager,
    state: FixedFunctionState,
    /// `None` when the device cannot ray trace; ray tracing messages are then dropped.
    raytracing: Option<RaytracingPipeline>,
}

impl HasDevice for BridgeContext {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl BridgeContext {
    pub fn new(device: Arc<Device>, config: &Config) -> VkResult<Self> {
        Self::with_upscaler(device, config, Box::new(ScalingUpscaler::new()))
    }

    pub fn with_upscaler(
        device: Arc<Device>,
        config: &Config,
        upscaler: Box<dyn Upscaler>,
    ) -> VkResult<Self> {
        let allocator = Arc::new(Allocator::new(device.clone()));
        let raytracing = if device.physical_device().capabilities().supports_raytracing() {
            Some(RaytracingPipeline::new(
                &allocator,
                config.quality_mode,
                upscaler,
            )?)
        } else {
            tracing::warn!("ray tracing disabled, only the conventional path runs");
            None
        };
        Ok(Self {
            heap: DescriptorHeap::new(device.clone()),
            samplers: SamplerCache::new(device.clone()),
            frames: FrameManager::new(allocator.clone(), frames::Options::from(config)),
            recorder: CommandRecorder::new(),
            resources: ResourceTable::new(),
            materials: MaterialTable::new(),
            accel: AccelStructManager::new(allocator),
            state: FixedFunctionState::new(),
            raytracing,
            device,
        })
    }

    pub fn is_raytracing_enabled(&self) -> bool {
        self.raytracing.is_some()
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn materials(&self) -> &MaterialTable {
        &self.materials
    }

    pub fn accel(&self) -> &AccelStructManager {
        &self.accel
    }

    pub fn state(&self) -> &FixedFunctionState {
        &self.state
    }

    pub fn frames(&self) -> &FrameManager {
        &self.frames
    }

    pub fn raytracing(&self) -> Option<&RaytracingPipeline> {
        self.raytracing.as_ref()
    }

    /// Replays one received block and ends the frame. Returns the number of messages handled.
    ///
    /// A record without a handler stops the block; what was recorded before it is still
    /// submitted.
    pub fn process_block(&mut self, block: &[u8]) -> Result<usize, BridgeError> {
        let processed = self.dispatch_block(block);
        self.frames.end_frame(&mut self.recorder)?;
        processed
    }

    fn dispatch_block(&mut self, block: &[u8]) -> Result<usize, BridgeError> {
        let mut reader = MessageReader::new(block)?;
        let mut count = 0;
        while let Some(opcode) = reader.next_opcode()? {
            let Some(known) = Opcode::from_u8(opcode) else {
                let err = reader.unknown(opcode);
                tracing::error!(%err, "unhandled message");
                return Err(err.into());
            };
            self.dispatch(known, &mut reader)?;
            count += 1;
        }
        Ok(count)
    }

    fn dispatch(&mut self, opcode: Opcode, reader: &mut MessageReader) -> Result<(), BridgeError> {
        if opcode.is_raytracing() && self.raytracing.is_none() {
            return self.skip_raytracing(opcode, reader);
        }
        match opcode {
            Opcode::Padding => {
                reader.read::<MsgPadding>()?;
            }
            Opcode::CreateTexture => {
                let (message, _) = reader.read::<MsgCreateTexture>()?;
                let extent = vk::Extent2D {
                    width: message.width as u32,
                    height: message.height as u32,
                };
                self.resources.create_texture(
                    &mut self.heap,
                    &mut self.frames,
                    message.texture_id,
                    extent,
                    message.levels as u32,
                    message.format,
                )?;
            }
            Opcode::WriteTexture => {
                let (message, data) = reader.read::<MsgWriteTexture>()?;
                self.resources
                    .write_texture(message.texture_id, message.mip_level as u32, data)?;
            }
            Opcode::CreateVertexBuffer => {
                let (message, _) = reader.read::<MsgCreateVertexBuffer>()?;
                self.resources.create_vertex_buffer(
                    &mut self.heap,
                    &mut self.frames,
                    message.vertex_buffer_id,
                    message.length,
                )?;
            }
            Opcode::WriteVertexBuffer => {
                let (message, data) = reader.read::<MsgWriteVertexBuffer>()?;
                self.resources.write_buffer(
                    ResourceType::VertexBuffer,
                    message.vertex_buffer_id,
                    message.offset,
                    data,
                )?;
            }
            Opcode::CreateIndexBuffer => {
                let (message, _) = reader.read::<MsgCreateIndexBuffer>()?;
                self.resources.create_index_buffer(
                    &mut self.heap,
                    &mut self.frames,
                    message.index_buffer_id,
                    message.length,
                )?;
            }
            Opcode::WriteIndexBuffer => {
                let (message, data) = reader.read::<MsgWriteIndexBuffer>()?;
                self.resources.write_buffer(
                    ResourceType::IndexBuffer,
                    message.index_buffer_id,
                    message.offset,
                    data,
                )?;
            }
            Opcode::CreateVertexShader => {
                let (message, data) = reader.read::<MsgCreateVertexShader>()?;
                self.resources
                    .create_shader(ResourceType::VertexShader, message.shader_id, data);
            }
            Opcode::CreatePixelShader => {
                let (message, data) = reader.read::<MsgCreatePixelShader>()?;
                self.resources
                    .create_shader(ResourceType::PixelShader, message.shader_id, data);
            }
            Opcode::SetRenderState => {
                let (message, _) = reader.read::<MsgSetRenderState>()?;
                self.state.set_render_state(message.state, message.value);
            }
            Opcode::SetTexture => {
                let (message, _) = reader.read::<MsgSetTexture>()?;
                self.state.set_texture(message.stage, message.texture_id);
            }
            Opcode::SetViewport => {
                let (message, _) = reader.read::<MsgSetViewport>()?;
                self.state.set_viewport(&message);
            }
            Opcode::SetScissorRect => {
                let (message, _) = reader.read::<MsgSetScissorRect>()?;
                self.state.set_scissor_rect(&message);
            }
            Opcode::SetRenderTarget => {
                let (message, _) = reader.read::<MsgSetRenderTarget>()?;
                self.state.set_render_target(message.texture_id);
            }
            Opcode::SetDepthStencilSurface => {
                let (message, _) = reader.read::<MsgSetDepthStencilSurface>()?;
                self.state.set_depth_stencil(message.texture_id);
            }
            Opcode::SetVertexShader => {
                let (message, _) = reader.read::<MsgSetVertexShader>()?;
                self.state.set_vertex_shader(message.shader_id);
            }
            Opcode::SetPixelShader => {
                let (message, _) = reader.read::<MsgSetPixelShader>()?;
                self.state.set_pixel_shader(message.shader_id);
            }
            Opcode::SetStreamSource => {
                let (message, _) = reader.read::<MsgSetStreamSource>()?;
                self.state.set_stream_source(&message);
            }
            Opcode::SetIndices => {
                let (message, _) = reader.read::<MsgSetIndices>()?;
                self.state.set_indices(message.index_buffer_id);
            }
            Opcode::SetVertexShaderConstants => {
                let (message, data) = reader.read::<MsgSetVertexShaderConstants>()?;
                self.state.set_vs_constants(message.start_register, data);
            }
            Opcode::SetPixelShaderConstants => {
                let (message, data) = reader.read::<MsgSetPixelShaderConstants>()?;
                self.state.set_ps_constants(message.start_register, data);
            }
            Opcode::DrawIndexedPrimitive => {
                let (message, _) = reader.read::<MsgDrawIndexedPrimitive>()?;
                self.state.draw_indexed_primitive(
                    &message,
                    &self.resources,
                    &mut self.frames,
                    &mut self.recorder,
                )?;
            }
            Opcode::Present => {
                reader.read::<MsgPresent>()?;
                self.state.present(&mut self.recorder);
            }
            Opcode::ReleaseResource => {
                let (message, _) = reader.read::<MsgReleaseResource>()?;
                self.release_resource(message.resource_type, message.resource_id);
            }
            Opcode::CreateBottomLevelAccelStruct => {
                let (message, data) = reader.read::<MsgCreateBottomLevelAccelStruct>()?;
                if data.len() % GEOMETRY_DESCRIPTION_SIZE != 0 {
                    let blas_id = message.blas_id;
                    tracing::warn!(blas_id, len = data.len(), "ragged geometry payload");
                }
                let geometries: Vec<GeometryDescription> = data
                    .chunks_exact(GEOMETRY_DESCRIPTION_SIZE)
                    .map(bytemuck::pod_read_unaligned)
                    .collect();
                self.accel
                    .create_blas(&message, &geometries, &self.resources, &mut self.frames)?;
            }
            Opcode::ReleaseRaytracingResource => {
                let (message, _) = reader.read::<MsgReleaseRaytracingResource>()?;
                let id = message.resource_id;
                match RaytracingResourceType::from_u8(message.resource_type) {
                    Some(RaytracingResourceType::BottomLevelAccelStruct) => {
                        self.accel.release_blas(id, &mut self.frames);
                    }
                    Some(RaytracingResourceType::Instance) => {
                        self.accel.release_instance(id);
                    }
                    Some(RaytracingResourceType::Material) => self.materials.release(id),
                    None => {
                        let resource_type = message.resource_type;
                        tracing::warn!(resource_type, id, "unknown ray tracing resource type");
                    }
                }
            }
            Opcode::CreateInstance => {
                let (message, data) = reader.read::<MsgCreateInstance>()?;
                let overrides: Vec<(u32, u32)> = data
                    .chunks_exact(MATERIAL_OVERRIDE_SIZE)
                    .map(|pair| {
                        let [src, dst]: [u32; 2] = bytemuck::pod_read_unaligned(pair);
                        (src, dst)
                    })
                    .collect();
                self.accel.create_instance(&message, &overrides);
            }
            Opcode::TraceRays => {
                let (message, _) = reader.read::<MsgTraceRays>()?;
                if let Some(raytracing) = self.raytracing.as_mut() {
                    raytracing.trace_rays(
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
                    )?;
                }
            }
            Opcode::CreateMaterial => {
                let (message, _) = reader.read::<MsgCreateMaterial>()?;
                self.materials
                    .create(&message, &self.resources, &mut self.samplers)?;
            }
            Opcode::ComputePose => {
                let (message, data) = reader.read::<MsgComputePose>()?;
                if let Some(raytracing) = self.raytracing.as_mut() {
                    raytracing.compute_pose(
                        &message,
                        data,
                        &self.resources,
                        &mut self.frames,
                        &mut self.recorder,
                        &mut self.accel,
                    )?;
                }
            }
            Opcode::BuildBottomLevelAccelStruct => {
                let (message, _) = reader.read::<MsgBuildBottomLevelAccelStruct>()?;
                self.accel
                    .build_blas(message.blas_id, message.perform_update != 0);
            }
        }
        Ok(())
    }

    fn release_resource(&mut self, resource_type: u8, id: u32) {
        let Some(ty) = ResourceType::from_u8(resource_type) else {
            tracing::warn!(resource_type, id, "unknown resource type");
            return;
        };
        if ty == ResourceType::Texture {
            if let Some(srv) = self.resources.texture(id).map(Texture::srv) {
                self.materials.on_texture_released(id, srv);
            }
        }
        self.resources
            .release(&mut self.heap, &mut self.frames, ty, id);
    }

    /// Consumes a ray tracing record without acting on it.
    fn skip_raytracing(
        &mut self,
        opcode: Opcode,
        reader: &mut MessageReader,
    ) -> Result<(), BridgeError> {
        match opcode {
            Opcode::CreateBottomLevelAccelStruct => {
                reader.read::<MsgCreateBottomLevelAccelStruct>()?;
            }
            Opcode::ReleaseRaytracingResource => {
                reader.read::<MsgReleaseRaytracingResource>()?;
            }
            Opcode::CreateInstance => {
                reader.read::<MsgCreateInstance>()?;
            }
            Opcode::TraceRays => {
                reader.read::<MsgTraceRays>()?;
            }
            Opcode::CreateMaterial => {
                reader.read::<MsgCreateMaterial>()?;
            }
            Opcode::ComputePose => {
                reader.read::<MsgComputePose>()?;
            }
            Opcode::BuildBottomLevelAccelStruct => {
                reader.read::<MsgBuildBottomLevelAccelStruct>()?;
            }
            _ => return Err(reader.unknown(opcode as u8).into()),
        }
        tracing::trace!(?opcode, "ray tracing disabled, message dropped");
        Ok(())
    }

    /// Releases the frame-lifetime resources of the ray tracing pipeline and drains every frame.
    pub fn shutdown(&mut self) -> VkResult<()> {
        if let Some(raytracing) = self.raytracing.as_mut() {
            raytracing.release(&mut self.heap, &mut self.frames);
        }
        for _ in 0..self.frames.num_frames() {
            self.frames.end_frame(&mut self.recorder)?;
        }
        tracing::info!(frames = self.frames.frame_number(), "bridge context shut down");
        Ok(())
    }
}
