//! Device mirrors of the game's textures, vertex/index buffers and shaders, indexed by the ids
//! the game assigns.
use std::{collections::HashMap, sync::Arc};

use ash::{prelude::VkResult, vk};

use super::{
    alloc::{Allocator, BufferRequest, MemBuffer},
    Image,
};
use crate::{
    backend::{Descriptor, ImageCreateInfo, MemoryLocation},
    descriptor::DescriptorHeap,
    frames::FrameManager,
    message::ResourceType,
    HasDevice,
};

const fn make_fourcc(code: &[u8; 4]) -> u32 {
    code[0] as u32 | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Maps a D3DFORMAT onto the closest image format. Unknown formats fall back to BGRA8.
pub fn format_from_d3d(format: u32) -> vk::Format {
    const DXT1: u32 = make_fourcc(b"DXT1");
    const DXT3: u32 = make_fourcc(b"DXT3");
    const DXT5: u32 = make_fourcc(b"DXT5");
    const ATI1: u32 = make_fourcc(b"ATI1");
    const ATI2: u32 = make_fourcc(b"ATI2");
    const INTZ: u32 = make_fourcc(b"INTZ");
    match format {
        21 | 22 => vk::Format::B8G8R8A8_UNORM,
        32 => vk::Format::R8G8B8A8_UNORM,
        28 | 50 => vk::Format::R8_UNORM,
        51 => vk::Format::R8G8_UNORM,
        34 => vk::Format::R16G16_UNORM,
        36 => vk::Format::R16G16B16A16_UNORM,
        111 => vk::Format::R16_SFLOAT,
        112 => vk::Format::R16G16_SFLOAT,
        113 => vk::Format::R16G16B16A16_SFLOAT,
        114 => vk::Format::R32_SFLOAT,
        115 => vk::Format::R32G32_SFLOAT,
        116 => vk::Format::R32G32B32A32_SFLOAT,
        75 | 77 | INTZ => vk::Format::D24_UNORM_S8_UINT,
        DXT1 => vk::Format::BC1_RGBA_UNORM_BLOCK,
        DXT3 => vk::Format::BC2_UNORM_BLOCK,
        DXT5 => vk::Format::BC3_UNORM_BLOCK,
        ATI1 => vk::Format::BC4_UNORM_BLOCK,
        ATI2 => vk::Format::BC5_UNORM_BLOCK,
        _ => vk::Format::B8G8R8A8_UNORM,
    }
}

fn is_depth(format: vk::Format) -> bool {
    format == vk::Format::D24_UNORM_S8_UINT
}

pub struct Texture {
    image: Image,
    /// Sampled view slot. Depth surfaces have none.
    srv: u32,
}

impl Texture {
    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn srv(&self) -> u32 {
        self.srv
    }
}

/// A vertex or index buffer and its raw view.
pub struct GeometryBuffer {
    buffer: MemBuffer,
    srv: u32,
}

impl GeometryBuffer {
    pub fn buffer(&self) -> &MemBuffer {
        &self.buffer
    }

    pub fn srv(&self) -> u32 {
        self.srv
    }
}

fn entry<T>(table: &mut Vec<Option<T>>, id: u32) -> &mut Option<T> {
    let index = id as usize;
    if table.len() <= index {
        table.resize_with(index + 1, || None);
    }
    &mut table[index]
}

fn lookup<T>(table: &[Option<T>], id: u32) -> Option<&T> {
    table.get(id as usize).and_then(Option::as_ref)
}

#[derive(Default)]
pub struct ResourceTable {
    textures: Vec<Option<Texture>>,
    vertex_buffers: Vec<Option<GeometryBuffer>>,
    index_buffers: Vec<Option<GeometryBuffer>>,
    vertex_shaders: HashMap<u32, Arc<[u8]>>,
    pixel_shaders: HashMap<u32, Arc<[u8]>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texture(&self, id: u32) -> Option<&Texture> {
        lookup(&self.textures, id)
    }

    pub fn vertex_buffer(&self, id: u32) -> Option<&GeometryBuffer> {
        lookup(&self.vertex_buffers, id)
    }

    pub fn index_buffer(&self, id: u32) -> Option<&GeometryBuffer> {
        lookup(&self.index_buffers, id)
    }

    pub fn vertex_shader(&self, id: u32) -> Option<&Arc<[u8]>> {
        self.vertex_shaders.get(&id)
    }

    pub fn pixel_shader(&self, id: u32) -> Option<&Arc<[u8]>> {
        self.pixel_shaders.get(&id)
    }

    /// Creates a texture, replacing any previous texture with the same id.
    pub fn create_texture(
        &mut self,
        heap: &mut DescriptorHeap,
        frames: &mut FrameManager,
        id: u32,
        extent: vk::Extent2D,
        levels: u32,
        d3d_format: u32,
    ) -> VkResult<&Texture> {
        self.release(heap, frames, ResourceType::Texture, id);

        let format = format_from_d3d(d3d_format);
        let mip_levels = levels.max(1);
        let usage = if is_depth(format) {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        } else {
            vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        let image = Image::new(
            heap.device().clone(),
            &ImageCreateInfo {
                extent,
                mip_levels,
                format,
                usage,
            },
        )?;
        let srv = heap.allocate(&Descriptor::SampledImage {
            image: image.image,
            format,
            mip_levels,
        })?;
        tracing::debug!(id, srv, ?format, "create texture");
        Ok(entry(&mut self.textures, id).insert(Texture { image, srv }))
    }

    /// Returns false for an unknown texture.
    pub fn write_texture(&self, id: u32, mip_level: u32, data: &[u8]) -> VkResult<bool> {
        let Some(texture) = self.texture(id) else {
            tracing::warn!(id, "write to unknown texture");
            return Ok(false);
        };
        texture
            .image
            .device()
            .write_image(texture.image.image, mip_level, data)?;
        Ok(true)
    }

    fn create_buffer(
        allocator: &Arc<Allocator>,
        heap: &mut DescriptorHeap,
        length: u32,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<GeometryBuffer> {
        let buffer = allocator.allocate_buffer(&BufferRequest {
            size: length as u64,
            alignment: 16,
            usage: usage
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        })?;
        let srv = heap.allocate(&Descriptor::RawBuffer {
            buffer: buffer.buffer,
            size: length as u64,
        })?;
        Ok(GeometryBuffer { buffer, srv })
    }

    pub fn create_vertex_buffer(
        &mut self,
        heap: &mut DescriptorHeap,
        frames: &mut FrameManager,
        id: u32,
        length: u32,
    ) -> VkResult<&GeometryBuffer> {
        self.release(heap, frames, ResourceType::VertexBuffer, id);
        let buffer = Self::create_buffer(
            frames.allocator(),
            heap,
            length,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        tracing::debug!(id, length, srv = buffer.srv, "create vertex buffer");
        Ok(entry(&mut self.vertex_buffers, id).insert(buffer))
    }

    pub fn create_index_buffer(
        &mut self,
        heap: &mut DescriptorHeap,
        frames: &mut FrameManager,
        id: u32,
        length: u32,
    ) -> VkResult<&GeometryBuffer> {
        self.release(heap, frames, ResourceType::IndexBuffer, id);
        let buffer = Self::create_buffer(
            frames.allocator(),
            heap,
            length,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        tracing::debug!(id, length, srv = buffer.srv, "create index buffer");
        Ok(entry(&mut self.index_buffers, id).insert(buffer))
    }

    /// Writes `data` at `offset`. Writes past the end are clipped. Returns false for an unknown buffer.
    pub fn write_buffer(
        &self,
        ty: ResourceType,
        id: u32,
        offset: u32,
        data: &[u8],
    ) -> VkResult<bool> {
        let target = match ty {
            ResourceType::VertexBuffer => self.vertex_buffer(id),
            ResourceType::IndexBuffer => self.index_buffer(id),
            _ => None,
        };
        let Some(target) = target else {
            tracing::warn!(?ty, id, "write to unknown buffer");
            return Ok(false);
        };
        let size = target.buffer.size();
        let offset = offset as u64;
        if offset >= size {
            return Ok(true);
        }
        let len = data.len().min((size - offset) as usize);
        if len < data.len() {
            tracing::warn!(?ty, id, offset, len = data.len(), size, "buffer write clipped");
        }
        target.buffer.write_bytes(offset, &data[..len])?;
        Ok(true)
    }

    pub fn create_shader(&mut self, ty: ResourceType, id: u32, bytecode: &[u8]) {
        let shaders = match ty {
            ResourceType::VertexShader => &mut self.vertex_shaders,
            ResourceType::PixelShader => &mut self.pixel_shaders,
            _ => return,
        };
        shaders.insert(id, Arc::from(bytecode));
    }

    /// Retires the device object behind `id` and frees its view slot. Returns whether anything
    /// was released.
    pub fn release(
        &mut self,
        heap: &mut DescriptorHeap,
        frames: &mut FrameManager,
        ty: ResourceType,
        id: u32,
    ) -> bool {
        match ty {
            ResourceType::Texture => {
                let Some(texture) = self.textures.get_mut(id as usize).and_then(Option::take)
                else {
                    return false;
                };
                heap.retire(frames, texture.srv);
                frames.retire(texture.image);
            }
            ResourceType::VertexBuffer | ResourceType::IndexBuffer => {
                let table = if ty == ResourceType::VertexBuffer {
                    &mut self.vertex_buffers
                } else {
                    &mut self.index_buffers
                };
                let Some(buffer) = table.get_mut(id as usize).and_then(Option::take) else {
                    return false;
                };
                heap.retire(frames, buffer.srv);
                frames.retire(buffer.buffer);
            }
            ResourceType::VertexShader => return self.vertex_shaders.remove(&id).is_some(),
            ResourceType::PixelShader => return self.pixel_shaders.remove(&id).is_some(),
        }
        tracing::debug!(?ty, id, "release resource");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::CommandRecorder, frames::Options, headless::HeadlessDevice, Device};

    fn setup(headless: &HeadlessDevice) -> (DescriptorHeap, FrameManager) {
        let device = Device::new(headless.clone());
        let allocator = Arc::new(Allocator::new(device.clone()));
        (
            DescriptorHeap::new(device),
            FrameManager::new(allocator, Options::default()),
        )
    }

    #[test]
    fn fourcc_formats() {
        assert_eq!(format_from_d3d(make_fourcc(b"DXT5")), vk::Format::BC3_UNORM_BLOCK);
        assert_eq!(format_from_d3d(21), vk::Format::B8G8R8A8_UNORM);
        assert_eq!(format_from_d3d(0xdead), vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn texture_release_is_deferred() {
        let headless = HeadlessDevice::new();
        let (mut heap, mut frames) = setup(&headless);
        let mut table = ResourceTable::new();
        let extent = vk::Extent2D {
            width: 4,
            height: 4,
        };
        let texture = table
            .create_texture(&mut heap, &mut frames, 9, extent, 1, 21)
            .unwrap();
        let (image, srv) = (texture.image().image, texture.srv());
        assert!(matches!(
            headless.descriptor(srv),
            Some(Descriptor::SampledImage { .. })
        ));
        assert!(table.write_texture(9, 0, &[0; 64]).unwrap());

        assert!(table.release(&mut heap, &mut frames, ResourceType::Texture, 9));
        assert!(table.texture(9).is_none());
        assert!(matches!(
            headless.descriptor(srv),
            Some(Descriptor::SampledImage { .. })
        ));
        assert!(headless.is_image_alive(image));
        assert!(!table.write_texture(9, 0, &[0; 64]).unwrap());
        assert!(!table.release(&mut heap, &mut frames, ResourceType::Texture, 9));

        let mut recorder = CommandRecorder::new();
        frames.end_frame(&mut recorder).unwrap();
        frames.end_frame(&mut recorder).unwrap();
        assert_eq!(headless.descriptor(srv), Some(Descriptor::Null));
        assert!(!headless.is_image_alive(image));
        assert!(heap.is_empty());
    }

    #[test]
    fn buffer_writes_are_clipped() {
        let headless = HeadlessDevice::new();
        let (mut heap, mut frames) = setup(&headless);
        let mut table = ResourceTable::new();
        let address = table
            .create_vertex_buffer(&mut heap, &mut frames, 1, 8)
            .unwrap()
            .buffer()
            .get_device_address();
        assert!(table
            .write_buffer(ResourceType::VertexBuffer, 1, 4, &[1, 2, 3, 4, 5, 6])
            .unwrap());
        assert_eq!(headless.read_address(address, 8), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(!table
            .write_buffer(ResourceType::IndexBuffer, 1, 0, &[1])
            .unwrap());
    }
}
