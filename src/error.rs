use ash::vk;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message {opcode} at offset {offset} runs past the end of the block")]
    Truncated { opcode: u8, offset: usize },
    #[error("no handler for opcode {opcode} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("message of {size} bytes does not fit a block of {capacity} bytes")]
    MessageTooLarge { size: usize, capacity: usize },
    #[error("message {opcode} at offset {offset} is not aligned to {alignment}")]
    Misaligned {
        opcode: u8,
        offset: usize,
        alignment: usize,
    },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("shared memory i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport capacity {0} is too small")]
    CapacityTooSmall(usize),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("device call failed: {0}")]
    Device(#[from] vk::Result),
}
