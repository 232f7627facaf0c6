use crate::{backend::GraphicsPipelineDesc, ray_tracing::sbt::SbtLayout, Device, HasDevice};
use ash::{prelude::VkResult, vk};
use std::sync::Arc;

/// A device pipeline, destroyed on drop.
pub struct Pipeline {
    device: Arc<Device>,
    pub(crate) pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

impl HasDevice for Pipeline {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pipeline")
            .field(&self.bind_point)
            .field(&self.pipeline)
            .finish()
    }
}

impl Pipeline {
    pub fn ray_tracing(device: Arc<Device>, layout: &SbtLayout) -> VkResult<Self> {
        let pipeline = device.create_ray_tracing_pipeline(layout)?;
        tracing::debug!(?pipeline, groups = layout.group_count(), "create ray tracing pipeline");
        Ok(Self {
            device,
            pipeline,
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
        })
    }

    pub fn compute(device: Arc<Device>, entry: &str) -> VkResult<Self> {
        let pipeline = device.create_compute_pipeline(entry)?;
        tracing::debug!(?pipeline, entry, "create compute pipeline");
        Ok(Self {
            device,
            pipeline,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    pub fn graphics(device: Arc<Device>, desc: &GraphicsPipelineDesc) -> VkResult<Self> {
        let pipeline = device.create_graphics_pipeline(desc)?;
        tracing::debug!(
            ?pipeline,
            vertex = desc.vertex_entry,
            pixel = desc.pixel_entry,
            "create graphics pipeline"
        );
        Ok(Self {
            device,
            pipeline,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        tracing::debug!(pipeline = ?self.pipeline, "drop pipeline");
        self.device.destroy_pipeline(self.pipeline);
    }
}
