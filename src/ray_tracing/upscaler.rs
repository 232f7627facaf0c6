use ash::vk;

use crate::{
    command::{Command, CommandRecorder},
    config::QualityMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpscalerInit {
    pub output_extent: vk::Extent2D,
    pub quality_mode: QualityMode,
}

/// Images and per-frame inputs of one upscale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpscalerDispatch {
    pub color: vk::Image,
    pub depth: vk::Image,
    pub motion_vectors: vk::Image,
    pub output: vk::Image,
    pub render_extent: vk::Extent2D,
    pub output_extent: vk::Extent2D,
    pub jitter: [f32; 2],
    pub reset_accumulation: bool,
}

/// Turns the raytraced image into the output image. `width`/`height` give the render resolution
/// chosen by the last `init`.
pub trait Upscaler: Send {
    fn init(&mut self, init: &UpscalerInit);
    fn dispatch(&mut self, recorder: &mut CommandRecorder, dispatch: &UpscalerDispatch);
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// Renders at a fraction of the output size given by the quality mode and stretches the result
/// with a filtered blit.
#[derive(Debug, Default)]
pub struct ScalingUpscaler {
    extent: vk::Extent2D,
}

impl ScalingUpscaler {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scaled(size: u32, scale: f32) -> u32 {
    ((size as f32 * scale) as u32).max(1)
}

impl Upscaler for ScalingUpscaler {
    fn init(&mut self, init: &UpscalerInit) {
        let scale = init.quality_mode.render_scale();
        self.extent = vk::Extent2D {
            width: scaled(init.output_extent.width, scale),
            height: scaled(init.output_extent.height, scale),
        };
        tracing::debug!(
            quality_mode = ?init.quality_mode,
            width = self.extent.width,
            height = self.extent.height,
            "init upscaler"
        );
    }

    fn dispatch(&mut self, recorder: &mut CommandRecorder, dispatch: &UpscalerDispatch) {
        recorder.push(Command::BlitImage {
            src: dispatch.color,
            src_extent: dispatch.render_extent,
            dst: dispatch.output,
            dst_extent: dispatch.output_extent,
            filter: vk::Filter::LINEAR,
        });
    }

    fn width(&self) -> u32 {
        self.extent.width
    }

    fn height(&self) -> u32 {
        self.extent.height
    }
}
