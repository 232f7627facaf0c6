use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use super::{Message, Opcode, BLOCK_HEADER_SIZE, PADDING_HEADER_SIZE};
use crate::{error::ProtocolError, transport::SharedMemory, util::align_up_usize};

/// Producer side of the transport.
///
/// Messages are accumulated in a local block and published to shared memory on [`commit`](Self::commit),
/// or earlier when the next message would not fit. Any number of threads may encode concurrently:
/// slot reservation is serialized, writing into a reserved slot is not.
pub struct MessageSender {
    shared: Arc<SharedMemory>,
    /// Write cursor into `block`.
    offset: Mutex<usize>,
    /// Owned allocation of `shared.capacity()` bytes, only ever reached through raw pointers.
    block: NonNull<u8>,
    /// Slots reserved but not yet finished.
    pending: AtomicU32,
}

// Safety: `block` is only written through slots handed out under the `offset` lock, and every slot
// covers a range no other live slot overlaps. No reference to the whole block is formed except in
// `commit_locked`, which holds the lock and waits for `pending` to drop to zero first.
unsafe impl Sync for MessageSender {}
unsafe impl Send for MessageSender {}

/// A reserved, writable message record. Dropping it finishes the message.
pub struct MessageSlot<'a> {
    sender: &'a MessageSender,
    data: &'a mut [u8],
}

impl MessageSlot<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data
    }
}

impl Drop for MessageSlot<'_> {
    fn drop(&mut self) {
        self.sender.pending.fetch_sub(1, Ordering::Release);
    }
}

impl MessageSender {
    pub fn new(shared: Arc<SharedMemory>) -> Self {
        let capacity = shared.capacity();
        let block = Box::into_raw(vec![0u8; capacity].into_boxed_slice());
        Self {
            shared,
            offset: Mutex::new(BLOCK_HEADER_SIZE),
            // Safety: `Box::into_raw` never returns null.
            block: unsafe { NonNull::new_unchecked(block.cast::<u8>()) },
            pending: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Reserves `size` bytes starting at a multiple of `alignment`, padding the gap.
    ///
    /// A thread must not hold a slot while reserving another one: if the reservation commits,
    /// it waits for every outstanding slot.
    pub fn make_message(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<MessageSlot<'_>, ProtocolError> {
        let alignment = alignment.max(1);
        debug_assert!(alignment.is_power_of_two());
        let capacity = self.capacity();
        let aligned_start = |offset: usize| {
            if offset % alignment == 0 {
                offset
            } else {
                align_up_usize(offset + PADDING_HEADER_SIZE, alignment)
            }
        };
        if aligned_start(BLOCK_HEADER_SIZE) + size > capacity {
            return Err(ProtocolError::MessageTooLarge { size, capacity });
        }

        let mut offset = self.offset.lock();
        let mut start = aligned_start(*offset);
        if start + size > capacity {
            self.commit_locked(&mut offset);
            start = aligned_start(*offset);
        }

        // Safety: see the `Sync` impl. The range [*offset, start + size) is past every live slot
        // and inside the allocation.
        let base = self.block.as_ptr();
        if start != *offset {
            unsafe {
                base.add(*offset).write(Opcode::Padding as u8);
                base.add(*offset + 1)
                    .write((start - *offset - PADDING_HEADER_SIZE) as u8);
            }
        }
        *offset = start + size;
        self.pending.fetch_add(1, Ordering::Acquire);
        drop(offset);

        let data = unsafe { std::slice::from_raw_parts_mut(base.add(start), size) };
        Ok(MessageSlot { sender: self, data })
    }

    pub fn send<T: Message>(&self, message: &T) -> Result<(), ProtocolError> {
        self.send_with_payload(message, &[])
    }

    /// Encodes `message` followed by `payload`. The header's opcode and payload length are filled in.
    pub fn send_with_payload<T: Message>(
        &self,
        message: &T,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut header = *message;
        header.set_payload_len(payload.len());
        debug_assert_eq!(header.payload_len(), payload.len(), "message carries no payload");

        let header_size = std::mem::size_of::<T>();
        let mut slot = self.make_message(header_size + payload.len(), T::ALIGNMENT)?;
        let data = slot.as_mut_slice();
        data[..header_size].copy_from_slice(bytemuck::bytes_of(&header));
        data[0] = T::OPCODE as u8;
        data[header_size..].copy_from_slice(payload);
        Ok(())
    }

    /// Publishes everything encoded so far as one block.
    pub fn commit(&self) {
        let mut offset = self.offset.lock();
        self.commit_locked(&mut offset);
    }

    fn commit_locked(&self, offset: &mut usize) {
        while self.pending.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        let len = *offset;
        let base = self.block.as_ptr();
        // Safety: the lock is held and no slot is live, so nothing else points into the block.
        let block = unsafe {
            std::ptr::copy_nonoverlapping(
                (len as u32).to_le_bytes().as_ptr(),
                base,
                BLOCK_HEADER_SIZE,
            );
            std::slice::from_raw_parts(base, len)
        };
        self.shared.publish(block);
        *offset = BLOCK_HEADER_SIZE;
    }

    /// Unblocks both sides for shutdown. Later commits are dropped.
    pub fn notify_should_exit(&self) {
        self.shared.notify_should_exit();
    }
}

impl Drop for MessageSender {
    fn drop(&mut self) {
        let len = self.shared.capacity();
        // Safety: `block` came from `Box::into_raw` of a slice of exactly `len` bytes, and `&mut self`
        // rules out live slots.
        drop(unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.block.as_ptr(), len))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        MessageReader, MsgCreateBottomLevelAccelStruct, MsgCreateTexture, MsgSetRenderState,
        MsgWriteVertexBuffer,
    };
    use bytemuck::Zeroable;
    use proptest::prelude::*;

    fn block_of(sender: &MessageSender) -> Vec<u8> {
        let offset = *sender.offset.lock();
        let block = unsafe { std::slice::from_raw_parts(sender.block.as_ptr(), offset) };
        let mut bytes = block.to_vec();
        bytes[..4].copy_from_slice(&(offset as u32).to_le_bytes());
        bytes
    }

    #[test]
    fn pads_to_alignment() {
        let shared = Arc::new(SharedMemory::anonymous(4096).unwrap());
        let sender = MessageSender::new(shared);
        sender
            .send(&MsgSetRenderState {
                state: 7,
                value: 1,
                ..Zeroable::zeroed()
            })
            .unwrap();
        // 4 + 6 = 10, next 16-aligned start after a padding header is 16
        sender
            .send_with_payload(
                &MsgWriteVertexBuffer {
                    vertex_buffer_id: 3,
                    ..Zeroable::zeroed()
                },
                &[9; 5],
            )
            .unwrap();

        let block = block_of(&sender);
        assert_eq!(block[10], Opcode::Padding as u8);
        assert_eq!(block[11], 4);
        assert_eq!(block[16], Opcode::WriteVertexBuffer as u8);
        assert_eq!(block.len(), 16 + 16 + 5);

        let mut reader = MessageReader::new(&block).unwrap();
        assert_eq!(reader.next_opcode().unwrap(), Some(Opcode::SetRenderState as u8));
        let (state, _) = reader.read::<MsgSetRenderState>().unwrap();
        assert_eq!({ state.state }, 7);
        assert_eq!(reader.next_opcode().unwrap(), Some(Opcode::WriteVertexBuffer as u8));
        assert_eq!(reader.offset(), 16);
        let (write, payload) = reader.read::<MsgWriteVertexBuffer>().unwrap();
        assert_eq!({ write.vertex_buffer_id }, 3);
        assert_eq!({ write.data_size }, 5);
        assert_eq!(payload, &[9; 5]);
        assert_eq!(reader.next_opcode().unwrap(), None);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let shared = Arc::new(SharedMemory::anonymous(256).unwrap());
        let sender = MessageSender::new(shared);
        let result = sender.send_with_payload(
            &MsgWriteVertexBuffer::zeroed(),
            &[0; 256],
        );
        assert!(matches!(
            result,
            Err(ProtocolError::MessageTooLarge { capacity: 256, .. })
        ));
        // Nothing was reserved.
        sender.send(&MsgCreateTexture::zeroed()).unwrap();
        assert_eq!(block_of(&sender).len(), 4 + 14);
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Record {
        RenderState { state: u8, value: u32 },
        VertexData { buffer: u32, data: Vec<u8> },
        Geometry { blas: u32, data: Vec<u8> },
    }

    fn record() -> impl Strategy<Value = Record> {
        prop_oneof![
            (any::<u8>(), any::<u32>())
                .prop_map(|(state, value)| Record::RenderState { state, value }),
            (any::<u32>(), proptest::collection::vec(any::<u8>(), 0..200))
                .prop_map(|(buffer, data)| Record::VertexData { buffer, data }),
            (any::<u32>(), proptest::collection::vec(any::<u8>(), 0..120))
                .prop_map(|(blas, data)| Record::Geometry { blas, data }),
        ]
    }

    fn encode(sender: &MessageSender, record: &Record) {
        let sent = match record {
            Record::RenderState { state, value } => sender.send(&MsgSetRenderState {
                state: *state,
                value: *value,
                ..Zeroable::zeroed()
            }),
            Record::VertexData { buffer, data } => sender.send_with_payload(
                &MsgWriteVertexBuffer {
                    vertex_buffer_id: *buffer,
                    ..Zeroable::zeroed()
                },
                data,
            ),
            Record::Geometry { blas, data } => sender.send_with_payload(
                &MsgCreateBottomLevelAccelStruct {
                    blas_id: *blas,
                    ..Zeroable::zeroed()
                },
                data,
            ),
        };
        sent.unwrap();
    }

    fn decode(block: &[u8], records: &mut Vec<Record>) {
        let mut reader = MessageReader::new(block).unwrap();
        while let Some(opcode) = reader.next_opcode().unwrap() {
            let offset = reader.offset();
            let record = match Opcode::from_u8(opcode) {
                Some(Opcode::SetRenderState) => {
                    let (message, _) = reader.read::<MsgSetRenderState>().unwrap();
                    Record::RenderState {
                        state: message.state,
                        value: message.value,
                    }
                }
                Some(Opcode::WriteVertexBuffer) => {
                    assert_eq!(offset % MsgWriteVertexBuffer::ALIGNMENT, 0);
                    let (message, data) = reader.read::<MsgWriteVertexBuffer>().unwrap();
                    Record::VertexData {
                        buffer: message.vertex_buffer_id,
                        data: data.to_vec(),
                    }
                }
                Some(Opcode::CreateBottomLevelAccelStruct) => {
                    assert_eq!(offset % MsgCreateBottomLevelAccelStruct::ALIGNMENT, 0);
                    let (message, data) = reader.read::<MsgCreateBottomLevelAccelStruct>().unwrap();
                    Record::Geometry {
                        blas: message.blas_id,
                        data: data.to_vec(),
                    }
                }
                other => panic!("unexpected record {:?} at {}", other, offset),
            };
            records.push(record);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn sequences_survive_the_transport(records in proptest::collection::vec(record(), 0..48)) {
            // Small enough that most sequences spill over several blocks.
            let shared = Arc::new(SharedMemory::anonymous(256).unwrap());
            let consumer = {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let mut out = vec![0; 256];
                    let mut blocks = Vec::new();
                    while let Some(len) = shared.receive(&mut out) {
                        blocks.push(out[..len].to_vec());
                    }
                    blocks
                })
            };
            let sender = MessageSender::new(shared.clone());
            for record in &records {
                encode(&sender, record);
            }
            sender.commit();
            shared.gpu_event().wait();
            sender.notify_should_exit();
            let blocks = consumer.join().unwrap();

            let mut decoded = Vec::new();
            for block in &blocks {
                prop_assert!(block.len() <= 256);
                decode(block, &mut decoded);
            }
            prop_assert_eq!(decoded, records);
        }
    }
}
