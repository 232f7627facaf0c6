use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{
    backend::MemoryLocation,
    command::CommandRecorder,
    config::Config,
    resources::alloc::{Allocator, BufferRequest, MemBuffer},
    util::align_up,
    Device, HasDevice,
};

pub mod upload;
pub use upload::UploadArena;

/// Paces the consumer's frames and owns everything that must outlive the frame that used it.
///
/// A resource retired while frame slot `i` is current is released once slot `i` comes around again
/// and the device reports the work of its previous use complete.
pub struct FrameManager {
    allocator: Arc<Allocator>,
    options: Options,
    frames: Vec<Frame>,
    frame_index: usize,
    frame_number: u64,
}

/// [`FrameManager`] configuration
#[derive(Debug, Clone)]
pub struct Options {
    pub frames_in_flight: usize,
    pub scratch_buffer_size: u64,
    pub upload_chunk_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for Options {
    fn from(config: &Config) -> Self {
        Self {
            frames_in_flight: config.frames_in_flight.max(1),
            scratch_buffer_size: config.scratch_buffer_size,
            upload_chunk_size: config.upload_chunk_size,
        }
    }
}

struct Frame {
    retired: Vec<Box<dyn Send + Sync>>,
    scratch: Option<MemBuffer>,
    scratch_offset: u64,
    upload: UploadArena,
}

impl HasDevice for FrameManager {
    fn device(&self) -> &Arc<Device> {
        self.allocator.device()
    }
}

impl FrameManager {
    pub fn new(allocator: Arc<Allocator>, options: Options) -> Self {
        let frames = (0..options.frames_in_flight)
            .map(|_| Frame {
                retired: Vec::new(),
                scratch: None,
                scratch_offset: 0,
                upload: UploadArena::new(options.upload_chunk_size),
            })
            .collect();
        Self {
            allocator,
            options,
            frames,
            frame_index: 0,
            frame_number: 0,
        }
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Number of frames ended so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    fn current_frame(&mut self) -> &mut Frame {
        &mut self.frames[self.frame_index]
    }

    /// Keeps `resource` alive until the device is done with the current frame.
    pub fn retire(&mut self, resource: impl Send + Sync + 'static) {
        self.current_frame().retired.push(Box::new(resource));
    }

    /// Number of resources waiting in the current frame's retirement list.
    pub fn retired_count(&self) -> usize {
        self.frames[self.frame_index].retired.len()
    }

    /// Scratch memory for one acceleration structure build.
    ///
    /// Served from the frame's scratch buffer when it fits; otherwise a dedicated buffer is created
    /// and retired with the frame.
    pub fn allocate_scratch(&mut self, size: u64) -> VkResult<vk::DeviceAddress> {
        let alignment = self
            .device()
            .physical_device()
            .properties()
            .min_acceleration_structure_scratch_offset_alignment as u64;
        let size = align_up(size, alignment);
        let request = |size| BufferRequest {
            size,
            alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::DeviceLocal,
        };

        let capacity = self.options.scratch_buffer_size;
        let offset = self.frames[self.frame_index].scratch_offset;
        if offset + size > capacity {
            let buffer = self.allocator.allocate_buffer(&request(size))?;
            let address = buffer.get_device_address();
            tracing::debug!(size, "dedicated scratch buffer");
            self.retire(buffer);
            return Ok(address);
        }

        if self.frames[self.frame_index].scratch.is_none() {
            let buffer = self.allocator.allocate_buffer(&request(capacity))?;
            self.frames[self.frame_index].scratch = Some(buffer);
        }
        let frame = &mut self.frames[self.frame_index];
        let base = frame
            .scratch
            .as_ref()
            .map_or(0, MemBuffer::get_device_address);
        frame.scratch_offset = offset + size;
        Ok(base + offset)
    }

    /// Copies `data` into this frame's upload memory and returns its device address.
    pub fn upload(&mut self, data: &[u8], alignment: u64) -> VkResult<vk::DeviceAddress> {
        let allocator = self.allocator.clone();
        self.current_frame()
            .upload
            .upload(&allocator, data, alignment)
    }

    /// Submits the frame and recycles the next frame slot.
    pub fn end_frame(&mut self, recorder: &mut CommandRecorder) -> VkResult<()> {
        let commands = recorder.finish();
        if !commands.is_empty() {
            self.device().submit(commands)?;
        }
        self.frame_number += 1;
        self.frame_index = (self.frame_index + 1) % self.frames.len();
        self.device().wait_for_frame(self.frame_index)?;

        let frame = &mut self.frames[self.frame_index];
        if !frame.retired.is_empty() {
            tracing::debug!(
                count = frame.retired.len(),
                frame = self.frame_number,
                "release retired resources"
            );
        }
        frame.retired.clear();
        frame.scratch_offset = 0;
        frame.upload.reset();
        Ok(())
    }
}
