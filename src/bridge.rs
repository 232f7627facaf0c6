use std::{path::Path, sync::Arc};

use crate::{
    config::Config,
    context::BridgeContext,
    error::BridgeError,
    message::MessageReceiver,
    transport::SharedMemory,
    Device,
};

/// The consumer loop: waits for blocks and replays them until the producer exits.
pub struct Bridge {
    context: BridgeContext,
    receiver: MessageReceiver,
}

impl Bridge {
    pub fn new(context: BridgeContext, shared: Arc<SharedMemory>) -> Self {
        Self {
            context,
            receiver: MessageReceiver::new(shared),
        }
    }

    /// Creates the shared memory file at `path`, sized from the configuration.
    pub fn create(
        device: Arc<Device>,
        config: &Config,
        path: impl AsRef<Path>,
    ) -> Result<Self, BridgeError> {
        let shared = SharedMemory::create(path, config.transport_capacity)?;
        let context = BridgeContext::new(device, config)?;
        Ok(Self::new(context, Arc::new(shared)))
    }

    pub fn context(&self) -> &BridgeContext {
        &self.context
    }

    /// Processes blocks until the producer asks to exit. Returns the number of blocks processed.
    ///
    /// A malformed block loses its remaining messages but does not stop the loop. Device errors
    /// do.
    pub fn run(&mut self) -> Result<u64, BridgeError> {
        let mut blocks = 0;
        while let Some(block) = self.receiver.receive() {
            match self.context.process_block(block) {
                Ok(messages) => tracing::trace!(block = blocks, messages, "processed block"),
                Err(BridgeError::Protocol(err)) => {
                    tracing::error!(block = blocks, %err, "dropped the rest of a block");
                }
                Err(err) => return Err(err),
            }
            blocks += 1;
        }
        tracing::info!(blocks, "producer exited");
        self.context.shutdown()?;
        Ok(blocks)
    }
}
