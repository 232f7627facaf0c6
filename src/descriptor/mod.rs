use std::sync::Arc;

use ash::{prelude::VkResult, vk};
use parking_lot::Mutex;

use crate::{backend::Descriptor, frames::FrameManager, Device, HasDevice};

pub mod sampler;

/// Bindless resource descriptor heap.
///
/// Slot 0 permanently holds a null view, so a zero index in any packed table means "nothing bound".
pub struct DescriptorHeap {
    device: Arc<Device>,
    capacity: u32,
    /// Slots at these locations are considered free. Shared with slots still retiring.
    freelist: Arc<Mutex<Vec<u32>>>,
    /// All slots after this index are considered free
    tail: u32,
}

impl HasDevice for DescriptorHeap {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl DescriptorHeap {
    pub const NULL_SLOT: u32 = 0;

    pub fn new(device: Arc<Device>) -> Self {
        let capacity = device.physical_device().properties().max_descriptor_heap_size;
        device.write_descriptor(Self::NULL_SLOT, &Descriptor::Null);
        Self {
            device,
            capacity,
            freelist: Arc::new(Mutex::new(Vec::new())),
            tail: 1,
        }
    }

    pub fn allocate(&mut self, descriptor: &Descriptor) -> VkResult<u32> {
        let free = self.freelist.lock().pop();
        let slot = match free {
            Some(slot) => slot,
            None => {
                if self.tail >= self.capacity {
                    return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
                }
                let slot = self.tail;
                self.tail += 1;
                slot
            }
        };
        self.device.write_descriptor(slot, descriptor);
        Ok(slot)
    }

    /// Writes `descriptors` into consecutive slots and returns the first one.
    pub fn allocate_range(&mut self, descriptors: &[Descriptor]) -> VkResult<u32> {
        let count = descriptors.len() as u32;
        if self.tail + count > self.capacity {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let first = self.tail;
        self.tail += count;
        for (slot, descriptor) in (first..).zip(descriptors) {
            self.device.write_descriptor(slot, descriptor);
        }
        Ok(first)
    }

    pub fn write(&self, slot: u32, descriptor: &Descriptor) {
        debug_assert!(slot != Self::NULL_SLOT && slot < self.tail);
        self.device.write_descriptor(slot, descriptor);
    }

    /// Hands `slot` back once the device is done with the current frame. Until then the view stays
    /// readable and the slot is not reused.
    pub fn retire(&mut self, frames: &mut FrameManager, slot: u32) {
        debug_assert!(slot != Self::NULL_SLOT && slot < self.tail);
        debug_assert!(
            !self.freelist.lock().contains(&slot),
            "slot {} freed twice",
            slot
        );
        frames.retire(RetiredSlot {
            device: self.device.clone(),
            freelist: self.freelist.clone(),
            slot,
        });
    }

    pub fn retire_range(&mut self, frames: &mut FrameManager, first: u32, count: u32) {
        for slot in first..first + count {
            self.retire(frames, slot);
        }
    }

    /// Number of slots currently handed out, the null slot excluded.
    pub fn len(&self) -> u32 {
        self.tail - 1 - self.freelist.lock().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Nulls the view and frees the slot when dropped.
struct RetiredSlot {
    device: Arc<Device>,
    freelist: Arc<Mutex<Vec<u32>>>,
    slot: u32,
}

impl Drop for RetiredSlot {
    fn drop(&mut self) {
        self.device.write_descriptor(self.slot, &Descriptor::Null);
        self.freelist.lock().push(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::CommandRecorder,
        frames::Options,
        headless::HeadlessDevice,
        resources::alloc::Allocator,
    };
    use ash::vk::Handle;

    #[test]
    fn retired_slots_wait_for_their_frame() {
        let headless = HeadlessDevice::new();
        let device = Device::new(headless.clone());
        let mut heap = DescriptorHeap::new(device.clone());
        let mut frames = FrameManager::new(
            Arc::new(Allocator::new(device)),
            Options {
                frames_in_flight: 2,
                scratch_buffer_size: 4096,
                upload_chunk_size: 4096,
            },
        );
        let mut recorder = CommandRecorder::new();
        let view = Descriptor::RawBuffer {
            buffer: vk::Buffer::from_raw(1),
            size: 16,
        };
        let a = heap.allocate(&view).unwrap();
        let b = heap.allocate(&view).unwrap();
        assert_eq!((a, b), (1, 2));

        heap.retire(&mut frames, a);
        assert_eq!(heap.allocate(&view).unwrap(), 3);
        assert_eq!(headless.descriptor(a), Some(view));
        frames.end_frame(&mut recorder).unwrap();
        assert_eq!(heap.allocate(&view).unwrap(), 4);
        frames.end_frame(&mut recorder).unwrap();
        assert_eq!(headless.descriptor(a), Some(Descriptor::Null));
        assert_eq!(heap.len(), 3);
        assert_eq!(heap.allocate(&view).unwrap(), a);

        let range = heap.allocate_range(&[view; 4]).unwrap();
        assert_eq!(range, 5);
        assert_eq!(heap.len(), 8);
    }
}
