use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{
    backend::MemoryLocation,
    resources::alloc::{Allocator, BufferRequest, MemBuffer},
    util::align_up,
};

pub(crate) const UPLOAD_CHUNK_ALIGNMENT: u64 = 256;

/// Per-frame bump allocator over host-visible chunks.
///
/// Data written here stays valid until the frame slot comes around again.
pub struct UploadArena {
    chunk_size: u64,
    chunks: Vec<MemBuffer>,
    current: usize,
    offset: u64,
}

impl UploadArena {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            chunks: Vec::new(),
            current: 0,
            offset: 0,
        }
    }

    pub fn upload(
        &mut self,
        allocator: &Arc<Allocator>,
        data: &[u8],
        alignment: u64,
    ) -> VkResult<vk::DeviceAddress> {
        debug_assert!(alignment <= UPLOAD_CHUNK_ALIGNMENT);
        let size = data.len() as u64;
        let alignment = alignment.max(1);
        loop {
            if let Some(chunk) = self.chunks.get(self.current) {
                let offset = align_up(self.offset, alignment);
                if offset + size <= chunk.size() {
                    chunk.write_bytes(offset, data)?;
                    self.offset = offset + size;
                    return Ok(chunk.get_device_address() + offset);
                }
                if self.current + 1 < self.chunks.len() {
                    self.current += 1;
                    self.offset = 0;
                    continue;
                }
            }
            let chunk = allocator.allocate_buffer(&BufferRequest {
                size: self.chunk_size.max(align_up(size, UPLOAD_CHUNK_ALIGNMENT)),
                alignment: UPLOAD_CHUNK_ALIGNMENT,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                location: MemoryLocation::Upload,
            })?;
            self.chunks.push(chunk);
            self.current = self.chunks.len() - 1;
            self.offset = 0;
        }
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.offset = 0;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{headless::HeadlessDevice, Device};

    #[test]
    fn bump_and_spill() {
        let headless = HeadlessDevice::new();
        let allocator = Arc::new(Allocator::new(Device::new(headless.clone())));
        let mut arena = UploadArena::new(1024);

        let a = arena.upload(&allocator, &[1; 100], 16).unwrap();
        let b = arena.upload(&allocator, &[2; 100], 256).unwrap();
        assert_eq!(b - a, 256);
        assert_eq!(headless.read_address(a, 4), vec![1; 4]);

        // Does not fit the rest of the first chunk
        let c = arena.upload(&allocator, &[3; 900], 16).unwrap();
        assert_eq!(arena.chunk_count(), 2);
        // Larger than a chunk
        arena.upload(&allocator, &[4; 4096], 16).unwrap();
        assert_eq!(arena.chunk_count(), 3);

        arena.reset();
        let again = arena.upload(&allocator, &[5; 8], 16).unwrap();
        assert_eq!(again, a);
        assert_ne!(c, again);
    }
}
