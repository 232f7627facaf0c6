//! Mirror of the game's conventional pipeline state.
//!
//! State messages only update the mirror and mark what changed; a draw flushes the dirty parts as
//! bind commands in front of the draw itself.
use ash::{prelude::VkResult, vk};
use bitflags::bitflags;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    command::{Command, CommandRecorder},
    descriptor::DescriptorHeap,
    frames::FrameManager,
    message::{
        MsgDrawIndexedPrimitive, MsgSetScissorRect, MsgSetStreamSource, MsgSetViewport, NULL_ID,
        PRIMITIVE_TRIANGLE_LIST,
    },
    resources::table::ResourceTable,
};

pub const RENDER_STATE_COUNT: usize = 256;
pub const TEXTURE_STAGE_COUNT: usize = 16;
pub const VERTEX_SHADER_CONSTANTS: usize = 256;
pub const PIXEL_SHADER_CONSTANTS: usize = 224;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        const ROOT_SIGNATURE = 1 << 0;
        const PIPELINE_DESC = 1 << 1;
        const GLOBALS_VS = 1 << 2;
        const GLOBALS_PS = 1 << 3;
        const TEXTURE = 1 << 4;
        const VIEWPORT = 1 << 5;
        const SCISSOR_RECT = 1 << 6;
        const PRIMITIVE_TOPOLOGY = 1 << 7;
        const RENDER_TARGET_AND_DEPTH_STENCIL = 1 << 8;
        const VERTEX_BUFFER = 1 << 9;
        const INDEX_BUFFER = 1 << 10;
    }
}

impl DirtyFlags {
    /// State the raytraced frame leaves behind: everything it bound over the game's pipeline.
    pub const AFTER_TRACE: DirtyFlags = DirtyFlags::ROOT_SIGNATURE
        .union(DirtyFlags::PIPELINE_DESC)
        .union(DirtyFlags::GLOBALS_VS)
        .union(DirtyFlags::GLOBALS_PS)
        .union(DirtyFlags::VIEWPORT)
        .union(DirtyFlags::SCISSOR_RECT)
        .union(DirtyFlags::PRIMITIVE_TOPOLOGY);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSource {
    pub vertex_buffer_id: u32,
    pub offset: u32,
    pub stride: u32,
}

pub struct FixedFunctionState {
    render_states: [u32; RENDER_STATE_COUNT],
    textures: [u32; TEXTURE_STAGE_COUNT],
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    render_target: u32,
    depth_stencil: u32,
    vertex_shader: u32,
    pixel_shader: u32,
    vs_constants: Box<[[f32; 4]]>,
    ps_constants: Box<[[f32; 4]]>,
    stream_source: StreamSource,
    index_buffer: u32,
    dirty: DirtyFlags,
}

impl Default for FixedFunctionState {
    fn default() -> Self {
        Self::new()
    }
}

fn write_registers(registers: &mut [[f32; 4]], start_register: u32, data: &[u8]) -> bool {
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(registers);
    let start = (start_register as usize * 16).min(bytes.len());
    let len = data.len().min(bytes.len() - start);
    bytes[start..start + len].copy_from_slice(&data[..len]);
    len == data.len()
}

impl FixedFunctionState {
    pub fn new() -> Self {
        Self {
            render_states: [0; RENDER_STATE_COUNT],
            textures: [NULL_ID; TEXTURE_STAGE_COUNT],
            viewport: vk::Viewport::default(),
            scissor: vk::Rect2D::default(),
            render_target: NULL_ID,
            depth_stencil: NULL_ID,
            vertex_shader: NULL_ID,
            pixel_shader: NULL_ID,
            vs_constants: vec![[0.0; 4]; VERTEX_SHADER_CONSTANTS].into_boxed_slice(),
            ps_constants: vec![[0.0; 4]; PIXEL_SHADER_CONSTANTS].into_boxed_slice(),
            stream_source: StreamSource::default(),
            index_buffer: NULL_ID,
            dirty: DirtyFlags::all(),
        }
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    pub fn clear_dirty(&mut self, flags: DirtyFlags) {
        self.dirty &= !flags;
    }

    pub fn render_state(&self, state: u8) -> u32 {
        self.render_states[state as usize]
    }

    pub fn texture(&self, stage: u8) -> Option<u32> {
        self.textures.get(stage as usize).copied()
    }

    pub fn viewport(&self) -> vk::Viewport {
        self.viewport
    }

    pub fn scissor(&self) -> vk::Rect2D {
        self.scissor
    }

    pub fn render_target(&self) -> u32 {
        self.render_target
    }

    pub fn depth_stencil(&self) -> u32 {
        self.depth_stencil
    }

    pub fn stream_source(&self) -> StreamSource {
        self.stream_source
    }

    pub fn index_buffer(&self) -> u32 {
        self.index_buffer
    }

    pub fn vs_constant_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vs_constants[..])
    }

    pub fn ps_constant_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.ps_constants[..])
    }

    pub fn set_render_state(&mut self, state: u8, value: u32) {
        let slot = &mut self.render_states[state as usize];
        if *slot != value {
            *slot = value;
            self.dirty |= DirtyFlags::PIPELINE_DESC;
        }
    }

    pub fn set_texture(&mut self, stage: u8, texture_id: u32) {
        let Some(slot) = self.textures.get_mut(stage as usize) else {
            tracing::warn!(stage, "texture stage out of range");
            return;
        };
        *slot = texture_id;
        self.dirty |= DirtyFlags::TEXTURE;
    }

    pub fn set_viewport(&mut self, message: &MsgSetViewport) {
        self.viewport = vk::Viewport {
            x: message.x,
            y: message.y,
            width: message.width,
            height: message.height,
            min_depth: message.min_z,
            max_depth: message.max_z,
        };
        self.dirty |= DirtyFlags::VIEWPORT;
    }

    pub fn set_scissor_rect(&mut self, message: &MsgSetScissorRect) {
        let (left, top, right, bottom) = (message.left, message.top, message.right, message.bottom);
        self.scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: left as i32,
                y: top as i32,
            },
            extent: vk::Extent2D {
                width: right.saturating_sub(left) as u32,
                height: bottom.saturating_sub(top) as u32,
            },
        };
        self.dirty |= DirtyFlags::SCISSOR_RECT;
    }

    pub fn set_render_target(&mut self, texture_id: u32) {
        self.render_target = texture_id;
        self.dirty |= DirtyFlags::RENDER_TARGET_AND_DEPTH_STENCIL;
    }

    pub fn set_depth_stencil(&mut self, texture_id: u32) {
        self.depth_stencil = texture_id;
        self.dirty |= DirtyFlags::RENDER_TARGET_AND_DEPTH_STENCIL;
    }

    pub fn set_vertex_shader(&mut self, shader_id: u32) {
        self.vertex_shader = shader_id;
        self.dirty |= DirtyFlags::PIPELINE_DESC;
    }

    pub fn set_pixel_shader(&mut self, shader_id: u32) {
        self.pixel_shader = shader_id;
        self.dirty |= DirtyFlags::PIPELINE_DESC;
    }

    pub fn set_stream_source(&mut self, message: &MsgSetStreamSource) {
        self.stream_source = StreamSource {
            vertex_buffer_id: message.vertex_buffer_id,
            offset: message.offset,
            stride: message.stride,
        };
        self.dirty |= DirtyFlags::VERTEX_BUFFER;
    }

    pub fn set_indices(&mut self, index_buffer_id: u32) {
        self.index_buffer = index_buffer_id;
        self.dirty |= DirtyFlags::INDEX_BUFFER;
    }

    pub fn set_vs_constants(&mut self, start_register: u32, data: &[u8]) {
        if !write_registers(&mut self.vs_constants, start_register, data) {
            tracing::warn!(start_register, len = data.len(), "vertex shader constants clipped");
        }
        self.dirty |= DirtyFlags::GLOBALS_VS;
    }

    pub fn set_ps_constants(&mut self, start_register: u32, data: &[u8]) {
        if !write_registers(&mut self.ps_constants, start_register, data) {
            tracing::warn!(start_register, len = data.len(), "pixel shader constants clipped");
        }
        self.dirty |= DirtyFlags::GLOBALS_PS;
    }

    fn render_state_hash(&self) -> u64 {
        xxh3_64(bytemuck::cast_slice(&self.render_states[..]))
    }

    /// Images currently bound as render target and depth stencil. Unknown ids bind nothing.
    pub fn render_target_images(&self, resources: &ResourceTable) -> (vk::Image, vk::Image) {
        let image = |id| {
            resources
                .texture(id)
                .map_or(vk::Image::null(), |texture| texture.image().image)
        };
        (image(self.render_target), image(self.depth_stencil))
    }

    fn flush(
        &mut self,
        resources: &ResourceTable,
        frames: &mut FrameManager,
        recorder: &mut CommandRecorder,
    ) -> VkResult<()> {
        let dirty = self.dirty;
        if dirty.contains(DirtyFlags::RENDER_TARGET_AND_DEPTH_STENCIL) {
            let (color, depth_stencil) = self.render_target_images(resources);
            recorder.push(Command::SetRenderTargets {
                color,
                depth_stencil,
            });
        }
        if dirty.contains(DirtyFlags::VIEWPORT) {
            recorder.push(Command::SetViewport(self.viewport));
        }
        if dirty.contains(DirtyFlags::SCISSOR_RECT) {
            recorder.push(Command::SetScissor(self.scissor));
        }
        if dirty.contains(DirtyFlags::PRIMITIVE_TOPOLOGY) {
            recorder.push(Command::SetPrimitiveTopology(
                vk::PrimitiveTopology::TRIANGLE_LIST,
            ));
        }
        if dirty.intersects(DirtyFlags::ROOT_SIGNATURE | DirtyFlags::PIPELINE_DESC) {
            recorder.push(Command::BindGraphicsPipeline {
                vertex_shader: self.vertex_shader,
                pixel_shader: self.pixel_shader,
                render_state_hash: self.render_state_hash(),
            });
        }
        let globals = DirtyFlags::ROOT_SIGNATURE | DirtyFlags::GLOBALS_VS | DirtyFlags::GLOBALS_PS;
        if dirty.intersects(globals) {
            let globals_vs = frames.upload(self.vs_constant_bytes(), 256)?;
            let globals_ps = frames.upload(self.ps_constant_bytes(), 256)?;
            recorder.push(Command::BindGraphicsRoot {
                globals_vs,
                globals_ps,
            });
        }
        if dirty.intersects(DirtyFlags::ROOT_SIGNATURE | DirtyFlags::TEXTURE) {
            let srvs: SmallVec<[u32; 16]> = self
                .textures
                .iter()
                .map(|id| {
                    resources
                        .texture(*id)
                        .map_or(DescriptorHeap::NULL_SLOT, |texture| texture.srv())
                })
                .collect();
            recorder.push(Command::BindTextures(srvs));
        }
        if dirty.contains(DirtyFlags::VERTEX_BUFFER) {
            let source = self.stream_source;
            let buffer = resources
                .vertex_buffer(source.vertex_buffer_id)
                .map_or(vk::Buffer::null(), |buffer| buffer.buffer().buffer);
            recorder.push(Command::BindVertexBuffer {
                buffer,
                offset: source.offset as u64,
                stride: source.stride,
            });
        }
        if dirty.contains(DirtyFlags::INDEX_BUFFER) {
            let buffer = resources
                .index_buffer(self.index_buffer)
                .map_or(vk::Buffer::null(), |buffer| buffer.buffer().buffer);
            recorder.push(Command::BindIndexBuffer {
                buffer,
                index_type: vk::IndexType::UINT16,
            });
        }
        self.dirty = DirtyFlags::empty();
        Ok(())
    }

    /// Flushes dirty state and records the draw. Only indexed triangle lists are drawn.
    pub fn draw_indexed_primitive(
        &mut self,
        message: &MsgDrawIndexedPrimitive,
        resources: &ResourceTable,
        frames: &mut FrameManager,
        recorder: &mut CommandRecorder,
    ) -> VkResult<()> {
        let primitive_type = message.primitive_type;
        if primitive_type != PRIMITIVE_TRIANGLE_LIST {
            tracing::warn!(primitive_type, "unsupported primitive type");
            return Ok(());
        }
        self.flush(resources, frames, recorder)?;
        recorder.push(Command::DrawIndexed {
            index_count: message.primitive_count * 3,
            first_index: message.start_index,
            vertex_offset: message.base_vertex_index,
        });
        Ok(())
    }

    pub fn present(&mut self, recorder: &mut CommandRecorder) {
        recorder.push(Command::Present);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frames::Options, headless::HeadlessDevice, resources::alloc::Allocator, Device};
    use std::sync::Arc;

    fn draw() -> MsgDrawIndexedPrimitive {
        MsgDrawIndexedPrimitive {
            id: crate::message::Opcode::DrawIndexedPrimitive as u8,
            primitive_type: PRIMITIVE_TRIANGLE_LIST,
            base_vertex_index: 4,
            start_index: 6,
            primitive_count: 2,
        }
    }

    #[test]
    fn constants_are_clipped_to_the_register_file() {
        let mut state = FixedFunctionState::new();
        let data: Vec<u8> = (0..32).collect();
        state.set_ps_constants(PIXEL_SHADER_CONSTANTS as u32 - 1, &data);
        let bytes = state.ps_constant_bytes();
        assert_eq!(bytes.len(), PIXEL_SHADER_CONSTANTS * 16);
        assert_eq!(&bytes[bytes.len() - 16..], &data[..16]);

        state.set_vs_constants(2, &[1; 16]);
        assert_eq!(&state.vs_constant_bytes()[32..48], &[1; 16]);
        assert!(state.dirty().contains(DirtyFlags::GLOBALS_VS | DirtyFlags::GLOBALS_PS));
    }

    #[test]
    fn draw_flushes_only_dirty_state() {
        let headless = HeadlessDevice::new();
        let device = Device::new(headless);
        let mut frames = FrameManager::new(Arc::new(Allocator::new(device)), Options::default());
        let resources = ResourceTable::new();
        let mut recorder = CommandRecorder::new();
        let mut state = FixedFunctionState::new();

        state
            .draw_indexed_primitive(&draw(), &resources, &mut frames, &mut recorder)
            .unwrap();
        let first = recorder.finish();
        assert_eq!(first.len(), 10);
        assert!(matches!(
            first.last(),
            Some(Command::DrawIndexed {
                index_count: 6,
                first_index: 6,
                vertex_offset: 4
            })
        ));

        state.set_render_state(7, 1);
        state.set_render_state(7, 1);
        state
            .draw_indexed_primitive(&draw(), &resources, &mut frames, &mut recorder)
            .unwrap();
        let second = recorder.finish();
        assert_eq!(second.len(), 2);
        assert!(matches!(second[0], Command::BindGraphicsPipeline { .. }));
        assert!(state.dirty().is_empty());
    }

    #[test]
    fn other_primitive_types_are_skipped() {
        let headless = HeadlessDevice::new();
        let device = Device::new(headless);
        let mut frames = FrameManager::new(Arc::new(Allocator::new(device)), Options::default());
        let mut recorder = CommandRecorder::new();
        let mut state = FixedFunctionState::new();
        let mut strip = draw();
        strip.primitive_type = 5;
        state
            .draw_indexed_primitive(&strip, &ResourceTable::new(), &mut frames, &mut recorder)
            .unwrap();
        assert!(recorder.is_empty());
        assert_eq!(state.dirty(), DirtyFlags::all());
    }

    #[test]
    fn scissor_is_converted_to_extent() {
        let mut state = FixedFunctionState::new();
        state.set_scissor_rect(&MsgSetScissorRect {
            id: crate::message::Opcode::SetScissorRect as u8,
            left: 10,
            top: 20,
            right: 110,
            bottom: 10,
        });
        let scissor = state.scissor();
        assert_eq!((scissor.offset.x, scissor.offset.y), (10, 20));
        assert_eq!((scissor.extent.width, scissor.extent.height), (100, 0));
    }
}
