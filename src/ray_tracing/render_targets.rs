use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{
    backend::{Descriptor, ImageCreateInfo},
    command::{CommandRecorder, ResourceRef},
    descriptor::DescriptorHeap,
    frames::FrameManager,
    resources::Image,
    Device,
};

/// Storage images written by the ray tracing passes, in UAV table order.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    Color,
    Depth,
    MotionVectors,
    PositionAndFlags,
    Normal,
    Diffuse,
    Specular,
    SpecularPower,
    SpecularLevel,
    Emission,
    Falloff,
    Shadow,
    GlobalIllumination,
    Reflection,
}

impl RenderTarget {
    pub const COUNT: usize = 14;
    pub const ALL: [RenderTarget; Self::COUNT] = [
        RenderTarget::Color,
        RenderTarget::Depth,
        RenderTarget::MotionVectors,
        RenderTarget::PositionAndFlags,
        RenderTarget::Normal,
        RenderTarget::Diffuse,
        RenderTarget::Specular,
        RenderTarget::SpecularPower,
        RenderTarget::SpecularLevel,
        RenderTarget::Emission,
        RenderTarget::Falloff,
        RenderTarget::Shadow,
        RenderTarget::GlobalIllumination,
        RenderTarget::Reflection,
    ];

    pub fn format(self) -> vk::Format {
        match self {
            RenderTarget::Color
            | RenderTarget::Diffuse
            | RenderTarget::Specular
            | RenderTarget::Emission
            | RenderTarget::Falloff => vk::Format::R16G16B16A16_SFLOAT,
            RenderTarget::Depth | RenderTarget::SpecularPower | RenderTarget::SpecularLevel => {
                vk::Format::R32_SFLOAT
            }
            RenderTarget::MotionVectors => vk::Format::R16G16_SFLOAT,
            RenderTarget::PositionAndFlags
            | RenderTarget::GlobalIllumination
            | RenderTarget::Reflection => vk::Format::R32G32B32A32_SFLOAT,
            RenderTarget::Normal => vk::Format::A2B10G10R10_UNORM_PACK32,
            RenderTarget::Shadow => vk::Format::R16_UNORM,
        }
    }
}

pub const OUTPUT_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// The ray tracing outputs at render resolution plus the upscaled output image.
///
/// Every image is left in `GENERAL` layout between frames.
pub struct RenderTargets {
    images: Vec<Image>,
    output: Image,
    render_extent: vk::Extent2D,
    /// First of the contiguous UAV slots, one per [`RenderTarget`].
    uav_start: u32,
    /// Sampled views of the output and the depth target, in that order.
    srv_start: u32,
}

impl RenderTargets {
    pub fn new(
        device: &Arc<Device>,
        heap: &mut DescriptorHeap,
        render_extent: vk::Extent2D,
        output_extent: vk::Extent2D,
    ) -> VkResult<Self> {
        let images = RenderTarget::ALL
            .iter()
            .map(|target| {
                Image::new(
                    device.clone(),
                    &ImageCreateInfo {
                        extent: render_extent,
                        mip_levels: 1,
                        format: target.format(),
                        usage: vk::ImageUsageFlags::STORAGE
                            | vk::ImageUsageFlags::SAMPLED
                            | vk::ImageUsageFlags::TRANSFER_SRC,
                    },
                )
            })
            .collect::<VkResult<Vec<_>>>()?;
        let output = Image::new(
            device.clone(),
            &ImageCreateInfo {
                extent: output_extent,
                mip_levels: 1,
                format: OUTPUT_FORMAT,
                usage: vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST,
            },
        )?;

        let uavs: Vec<Descriptor> = images
            .iter()
            .map(|image| Descriptor::StorageImage {
                image: image.image,
                format: image.format(),
            })
            .collect();
        let uav_start = heap.allocate_range(&uavs)?;
        let depth = &images[RenderTarget::Depth as usize];
        let srv_start = heap.allocate_range(&[
            Descriptor::SampledImage {
                image: output.image,
                format: OUTPUT_FORMAT,
                mip_levels: 1,
            },
            Descriptor::SampledImage {
                image: depth.image,
                format: depth.format(),
                mip_levels: 1,
            },
        ])?;
        tracing::debug!(
            width = render_extent.width,
            height = render_extent.height,
            output_width = output_extent.width,
            output_height = output_extent.height,
            uav_start,
            "create render targets"
        );
        Ok(Self {
            images,
            output,
            render_extent,
            uav_start,
            srv_start,
        })
    }

    pub fn image(&self, target: RenderTarget) -> vk::Image {
        self.images[target as usize].image
    }

    pub fn output(&self) -> vk::Image {
        self.output.image
    }

    pub fn render_extent(&self) -> vk::Extent2D {
        self.render_extent
    }

    pub fn output_extent(&self) -> vk::Extent2D {
        self.output.extent()
    }

    pub fn uav_start(&self) -> u32 {
        self.uav_start
    }

    pub fn output_srv(&self) -> u32 {
        self.srv_start
    }

    pub fn depth_srv(&self) -> u32 {
        self.srv_start + 1
    }

    /// Records UAV barriers on `targets`, flushed in front of the next command.
    pub fn barrier(&self, recorder: &mut CommandRecorder, targets: &[RenderTarget]) {
        for target in targets {
            recorder.uav_barrier(ResourceRef::Image(self.image(*target)));
        }
    }

    /// Frees the descriptor slots and retires the images with the current frame.
    pub fn release(self, heap: &mut DescriptorHeap, frames: &mut FrameManager) {
        heap.retire_range(frames, self.uav_start, RenderTarget::COUNT as u32);
        heap.retire_range(frames, self.srv_start, 2);
        tracing::debug!(uav_start = self.uav_start, "release render targets");
        frames.retire(self.images);
        frames.retire(self.output);
    }
}
