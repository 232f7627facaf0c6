use std::sync::Arc;

use super::{Message, Opcode, BLOCK_HEADER_SIZE, PADDING_HEADER_SIZE};
use crate::{error::ProtocolError, transport::SharedMemory};

/// Walks the records of one received block.
pub struct MessageReader<'a> {
    block: &'a [u8],
    offset: usize,
    end: usize,
}

impl<'a> MessageReader<'a> {
    /// Fails if the length prefix is missing or claims more bytes than `block` holds.
    pub fn new(block: &'a [u8]) -> Result<Self, ProtocolError> {
        let truncated = ProtocolError::Truncated {
            opcode: 0,
            offset: 0,
        };
        let prefix: [u8; BLOCK_HEADER_SIZE] = block
            .get(..BLOCK_HEADER_SIZE)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| truncated.clone())?;
        let end = u32::from_le_bytes(prefix) as usize;
        if end < BLOCK_HEADER_SIZE || end > block.len() {
            return Err(truncated);
        }
        Ok(Self {
            block,
            offset: BLOCK_HEADER_SIZE,
            end,
        })
    }

    /// Start of the next record.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Skips padding and peeks at the next record's opcode. `None` at the end of the block.
    pub fn next_opcode(&mut self) -> Result<Option<u8>, ProtocolError> {
        while self.offset < self.end {
            let opcode = self.block[self.offset];
            if opcode != Opcode::Padding as u8 {
                return Ok(Some(opcode));
            }
            let filler = *self
                .block
                .get(self.offset + 1)
                .filter(|_| self.offset + 1 < self.end)
                .ok_or(ProtocolError::Truncated {
                    opcode,
                    offset: self.offset,
                })?;
            let next = self.offset + PADDING_HEADER_SIZE + filler as usize;
            if next > self.end {
                return Err(ProtocolError::Truncated {
                    opcode,
                    offset: self.offset,
                });
            }
            self.offset = next;
        }
        Ok(None)
    }

    /// Consumes the record at the cursor as a `T`, returning the header and its payload.
    pub fn read<T: Message>(&mut self) -> Result<(T, &'a [u8]), ProtocolError> {
        let opcode = T::OPCODE as u8;
        let start = self.offset;
        if start % T::ALIGNMENT != 0 {
            return Err(ProtocolError::Misaligned {
                opcode,
                offset: start,
                alignment: T::ALIGNMENT,
            });
        }
        let truncated = ProtocolError::Truncated {
            opcode,
            offset: start,
        };
        let header_end = start + std::mem::size_of::<T>();
        if header_end > self.end {
            return Err(truncated);
        }
        let header: T = bytemuck::pod_read_unaligned(&self.block[start..header_end]);
        let payload_end = header_end + header.payload_len();
        if payload_end > self.end {
            return Err(truncated);
        }
        self.offset = payload_end;
        Ok((header, &self.block[header_end..payload_end]))
    }

    /// Reads an opcode the caller has no handler for, so the cursor cannot advance.
    pub fn unknown(&self, opcode: u8) -> ProtocolError {
        ProtocolError::UnknownOpcode {
            opcode,
            offset: self.offset,
        }
    }
}

/// Consumer side of the transport.
pub struct MessageReceiver {
    shared: Arc<SharedMemory>,
    block: Vec<u8>,
}

impl MessageReceiver {
    pub fn new(shared: Arc<SharedMemory>) -> Self {
        let capacity = shared.capacity();
        Self {
            shared,
            block: vec![0; capacity],
        }
    }

    /// Blocks for the next published block. `None` once the producer asked to exit.
    pub fn receive(&mut self) -> Option<&[u8]> {
        let len = self.shared.receive(&mut self.block)?;
        Some(&self.block[..len])
    }

    pub fn should_exit(&self) -> bool {
        self.shared.should_exit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgCreateBottomLevelAccelStruct, MsgWriteTexture};
    use bytemuck::Zeroable;

    fn block(records: &[u8]) -> Vec<u8> {
        let mut block = ((records.len() + 4) as u32).to_le_bytes().to_vec();
        block.extend_from_slice(records);
        block
    }

    #[test]
    fn bad_length_prefix() {
        assert!(MessageReader::new(&[1, 0]).is_err());
        assert!(MessageReader::new(&[9, 0, 0, 0, 1]).is_err());
        let empty = block(&[]);
        let mut reader = MessageReader::new(&empty).unwrap();
        assert_eq!(reader.next_opcode().unwrap(), None);
    }

    #[test]
    fn truncated_payload() {
        let mut header = MsgCreateBottomLevelAccelStruct::zeroed();
        header.id = Opcode::CreateBottomLevelAccelStruct as u8;
        header.data_size = 68;
        let bytes = block(bytemuck::bytes_of(&header));
        let mut reader = MessageReader::new(&bytes).unwrap();
        reader.next_opcode().unwrap();
        assert_eq!(
            reader.read::<MsgCreateBottomLevelAccelStruct>().unwrap_err(),
            ProtocolError::Truncated {
                opcode: Opcode::CreateBottomLevelAccelStruct as u8,
                offset: 4
            }
        );
    }

    #[test]
    fn misaligned_record() {
        let mut header = MsgWriteTexture::zeroed();
        header.id = Opcode::WriteTexture as u8;
        let bytes = block(bytemuck::bytes_of(&header));
        let mut reader = MessageReader::new(&bytes).unwrap();
        reader.next_opcode().unwrap();
        assert!(matches!(
            reader.read::<MsgWriteTexture>(),
            Err(ProtocolError::Misaligned { offset: 4, alignment: 16, .. })
        ));
    }

    #[test]
    fn padding_past_the_end() {
        let bytes = block(&[Opcode::Padding as u8, 10]);
        let mut reader = MessageReader::new(&bytes).unwrap();
        assert!(reader.next_opcode().is_err());
    }
}
