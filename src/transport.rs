//! Shared memory block exchanged between the game process and the renderer.
//!
//! The mapping holds one message block followed by a small control area with the two events
//! and the exit flag. The game side waits on the GPU event before overwriting the block and sets
//! the CPU event once it is done; the renderer does the opposite.
use std::{
    fs::OpenOptions,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use memmap2::MmapMut;

use crate::error::TransportError;

/// Smallest usable block size.
pub const MIN_CAPACITY: usize = 256;
const CONTROL_SIZE: usize = 64;
const CONTROL_ALIGNMENT: usize = 64;

const CPU_EVENT: usize = 0;
const GPU_EVENT: usize = 4;
const SHOULD_EXIT: usize = 8;

/// Manual reset event over a word of shared memory.
#[derive(Clone, Copy)]
pub struct Event<'a> {
    flag: &'a AtomicU32,
}

impl<'a> Event<'a> {
    pub fn set(&self) {
        self.flag.store(1, Ordering::Release);
    }

    pub fn reset(&self) {
        self.flag.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire) != 0
    }

    pub fn wait(&self) {
        let mut spins = 0u32;
        while !self.is_set() {
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

pub struct SharedMemory {
    _mmap: MmapMut,
    base: *mut u8,
    capacity: usize,
}

impl SharedMemory {
    /// A mapping private to this process, for a producer and consumer living on different threads.
    pub fn anonymous(capacity: usize) -> Result<Self, TransportError> {
        let capacity = Self::checked_capacity(capacity)?;
        let mmap = MmapMut::map_anon(capacity + CONTROL_SIZE)?;
        Ok(Self::init(mmap, capacity))
    }

    fn from_mapping(mut mmap: MmapMut, capacity: usize) -> Self {
        let base = mmap.as_mut_ptr();
        Self {
            _mmap: mmap,
            base,
            capacity,
        }
    }

    /// Creates (or truncates) a file-backed mapping another process can [`open`](Self::open).
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self, TransportError> {
        let capacity = Self::checked_capacity(capacity)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len((capacity + CONTROL_SIZE) as u64)?;
        // Safety: the file was just sized by us; both sides only touch it through this type.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        tracing::info!(path = %path.as_ref().display(), capacity, "create shared memory");
        Ok(Self::init(mmap, capacity))
    }

    /// Maps a file created by [`create`](Self::create). Events keep their current state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        let capacity = len.saturating_sub(CONTROL_SIZE);
        let capacity = Self::checked_capacity(capacity)?;
        if capacity + CONTROL_SIZE != len {
            return Err(TransportError::CapacityTooSmall(capacity));
        }
        // Safety: see `create`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        tracing::info!(path = %path.as_ref().display(), capacity, "open shared memory");
        Ok(Self::from_mapping(mmap, capacity))
    }

    fn checked_capacity(capacity: usize) -> Result<usize, TransportError> {
        if capacity < MIN_CAPACITY {
            return Err(TransportError::CapacityTooSmall(capacity));
        }
        Ok(capacity / CONTROL_ALIGNMENT * CONTROL_ALIGNMENT)
    }

    fn init(mmap: MmapMut, capacity: usize) -> Self {
        let shared = Self::from_mapping(mmap, capacity);
        shared.cpu_event().reset();
        // The block starts out free to write.
        shared.gpu_event().set();
        shared.word(SHOULD_EXIT).store(0, Ordering::Release);
        shared
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= CONTROL_SIZE);
        // Safety: the control area starts at a 64 byte aligned offset of a page aligned mapping
        // and is only ever accessed atomically.
        unsafe { &*(self.base.add(self.capacity + offset) as *const AtomicU32) }
    }

    /// Set by the producer when a block is ready.
    pub fn cpu_event(&self) -> Event<'_> {
        Event {
            flag: self.word(CPU_EVENT),
        }
    }

    /// Set by the consumer when the block may be overwritten.
    pub fn gpu_event(&self) -> Event<'_> {
        Event {
            flag: self.word(GPU_EVENT),
        }
    }

    pub fn should_exit(&self) -> bool {
        self.word(SHOULD_EXIT).load(Ordering::Acquire) != 0
    }

    /// Raises the exit flag and wakes whichever side is waiting.
    pub fn notify_should_exit(&self) {
        tracing::info!("shared memory exit requested");
        self.word(SHOULD_EXIT).store(1, Ordering::Release);
        self.cpu_event().set();
        self.gpu_event().set();
    }

    /// Waits until the consumer released the block, then copies `block` in and signals it.
    /// Dropped silently once exiting.
    pub fn publish(&self, block: &[u8]) {
        debug_assert!(block.len() <= self.capacity);
        if self.should_exit() {
            self.cpu_event().set();
            return;
        }
        self.gpu_event().wait();
        if self.should_exit() {
            return;
        }
        self.gpu_event().reset();
        // Safety: the GPU event handshake gives the producer exclusive access to the block.
        unsafe {
            std::ptr::copy_nonoverlapping(block.as_ptr(), self.base, block.len());
        }
        self.cpu_event().set();
    }

    /// Waits for a published block and copies it into `out`, returning its length.
    /// `None` once exiting.
    pub fn receive(&self, out: &mut [u8]) -> Option<usize> {
        self.cpu_event().wait();
        if self.should_exit() {
            return None;
        }
        self.cpu_event().reset();
        // Safety: the CPU event handshake gives the consumer exclusive access to the block.
        let block = unsafe { std::slice::from_raw_parts(self.base, self.capacity) };
        let len = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
        let len = len.min(self.capacity).min(out.len());
        out[..len].copy_from_slice(&block[..len]);
        self.gpu_event().set();
        Some(len)
    }
}

// Safety: the mapping is only accessed through atomics or under the event handshake.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn capacity_rules() {
        assert!(matches!(
            SharedMemory::anonymous(100),
            Err(TransportError::CapacityTooSmall(100))
        ));
        assert_eq!(SharedMemory::anonymous(1000).unwrap().capacity(), 960);
    }

    #[test]
    fn handshake_between_threads() {
        let shared = Arc::new(SharedMemory::anonymous(4096).unwrap());
        assert!(shared.gpu_event().is_set());
        assert!(!shared.cpu_event().is_set());

        let consumer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let mut out = vec![0; 4096];
                let mut received = Vec::new();
                while let Some(len) = shared.receive(&mut out) {
                    received.push(out[4..len].to_vec());
                }
                received
            })
        };
        for i in 0..3u8 {
            let mut block = 6u32.to_le_bytes().to_vec();
            block.extend_from_slice(&[i, i]);
            shared.publish(&block);
        }
        // The last block must be taken before the exit flag goes up.
        shared.gpu_event().wait();
        shared.notify_should_exit();
        let received = consumer.join().unwrap();
        assert_eq!(received, vec![vec![0, 0], vec![1, 1], vec![2, 2]]);
    }

    #[test]
    fn file_backed_mapping_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.shm");
        let producer = SharedMemory::create(&path, 512).unwrap();
        let consumer = SharedMemory::open(&path).unwrap();
        assert_eq!(consumer.capacity(), 512);
        producer.publish(&[8, 0, 0, 0, 1, 2, 3, 4]);
        assert!(consumer.cpu_event().is_set());
        let mut out = [0; 512];
        assert_eq!(consumer.receive(&mut out), Some(8));
        assert_eq!(&out[4..8], &[1, 2, 3, 4]);
        assert!(producer.gpu_event().is_set());
    }
}
