use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ash::{prelude::VkResult, vk};

use super::HasBuffer;
use crate::{
    backend::{BufferCreateInfo, MemoryLocation},
    Device, HasDevice,
};

/// Creates device buffers and keeps count of the bytes they occupy.
pub struct Allocator {
    device: Arc<Device>,
    allocated_bytes: AtomicU64,
}

impl HasDevice for Allocator {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Allocator {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            allocated_bytes: AtomicU64::new(0),
        }
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn allocate_buffer(self: &Arc<Self>, request: &BufferRequest) -> VkResult<MemBuffer> {
        let (buffer, device_address) = self.device.create_buffer(&BufferCreateInfo {
            size: request.size,
            usage: request.usage,
            location: request.location,
        })?;
        debug_assert!(
            request.alignment == 0 || device_address % request.alignment == 0,
            "device returned a misaligned buffer"
        );
        self.allocated_bytes
            .fetch_add(request.size, Ordering::Relaxed);
        tracing::debug!(?buffer, size = request.size, location = ?request.location, "create buffer");
        Ok(MemBuffer {
            allocator: self.clone(),
            buffer,
            device_address,
            size: request.size,
            location: request.location,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferRequest {
    pub size: u64,
    /// Required alignment of the buffer's device address. 0 means no requirement.
    pub alignment: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl Default for BufferRequest {
    fn default() -> Self {
        Self {
            size: 0,
            alignment: 0,
            usage: vk::BufferUsageFlags::empty(),
            location: MemoryLocation::DeviceLocal,
        }
    }
}

pub struct MemBuffer {
    allocator: Arc<Allocator>,
    pub buffer: vk::Buffer,
    device_address: vk::DeviceAddress,
    size: u64,
    location: MemoryLocation,
}

impl HasBuffer for MemBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.buffer
    }
}

impl std::fmt::Debug for MemBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBuffer")
            .field("buffer", &self.buffer)
            .field("device_address", &self.device_address)
            .field("size", &self.size)
            .finish()
    }
}

impl MemBuffer {
    pub fn get_device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn location(&self) -> MemoryLocation {
        self.location
    }
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> VkResult<()> {
        debug_assert!(offset + data.len() as u64 <= self.size);
        self.allocator.device.write_buffer(self.buffer, offset, data)
    }
}

impl Drop for MemBuffer {
    fn drop(&mut self) {
        tracing::debug!(buffer = ?self.buffer, "drop buffer");
        self.allocator
            .allocated_bytes
            .fetch_sub(self.size, Ordering::Relaxed);
        self.allocator.device.destroy_buffer(self.buffer);
    }
}
