//! Consumer side of a Direct3D 9 to ray tracing bridge.
//!
//! A producer encodes the game's draw and resource calls into a shared memory block
//! ([`message::MessageSender`]); the consumer replays every block into a [`BridgeContext`], which
//! mirrors the resources, maintains the acceleration structures and records the ray traced frame
//! against a [`backend::RaytracingDevice`].
use std::{ops::Deref, sync::Arc};

pub mod accel_struct;
pub mod backend;
pub mod bridge;
pub mod command;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod fixed_function;
pub mod frames;
pub mod headless;
pub mod material;
pub mod message;
mod physical_device;
pub mod pipeline;
pub mod ray_tracing;
pub mod resources;
pub mod transport;
mod util;

pub use bridge::Bridge;
pub use config::{Config, QualityMode};
pub use context::BridgeContext;
pub use error::BridgeError;
pub use physical_device::*;
pub use util::halton;

pub struct Device {
    physical_device: PhysicalDevice,
    backend: Box<dyn backend::RaytracingDevice>,
}

impl Device {
    /// Wraps `backend` and probes its capabilities.
    pub fn new(backend: impl backend::RaytracingDevice + 'static) -> Arc<Self> {
        let physical_device = PhysicalDevice::probe(&backend);
        Arc::new(Self {
            physical_device,
            backend: Box::new(backend),
        })
    }
    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }
}

impl Deref for Device {
    type Target = dyn backend::RaytracingDevice;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::info!("drop device");
    }
}

pub trait HasDevice {
    fn device(&self) -> &Arc<Device>;
}
