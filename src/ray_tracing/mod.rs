use ash::vk;

use crate::command::{Command, CommandRecorder};

pub mod globals;
pub mod pipeline;
pub mod render_targets;
pub mod sbt;
pub mod upscaler;

pub use pipeline::{RaytracingPipeline, Scene};
pub use upscaler::{ScalingUpscaler, Upscaler};

impl CommandRecorder {
    /// Dispatches one raygen pass of the table over `extent`.
    pub fn trace_rays(&mut self, sbt: &sbt::Sbt, pass: sbt::RaygenPass, extent: vk::Extent2D) {
        self.push(Command::TraceRays {
            raygen: sbt.raygen(pass),
            miss: sbt.miss(),
            hit: sbt.hit(),
            width: extent.width,
            height: extent.height,
        });
    }
}
