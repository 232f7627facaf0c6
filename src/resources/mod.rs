use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{backend::ImageCreateInfo, Device, HasDevice};

pub mod alloc;
pub mod free_list;
pub mod table;

pub trait HasBuffer: Send + Sync + 'static {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl HasBuffer for vk::Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        *self
    }
}

impl<T: HasBuffer> HasBuffer for Arc<T> {
    fn raw_buffer(&self) -> vk::Buffer {
        let r: &T = self.as_ref();
        r.raw_buffer()
    }
}

pub trait HasImage {
    fn raw_image(&self) -> vk::Image;
}

impl HasImage for vk::Image {
    fn raw_image(&self) -> vk::Image {
        *self
    }
}

pub struct Image {
    device: Arc<Device>,
    pub(crate) image: vk::Image,
    info: ImageCreateInfo,
}

impl Image {
    pub fn new(device: Arc<Device>, info: &ImageCreateInfo) -> VkResult<Self> {
        let image = device.create_image(info)?;
        tracing::debug!(?image, width = info.extent.width, height = info.extent.height, format = ?info.format, "create image");
        Ok(Self {
            device,
            image,
            info: *info,
        })
    }
    pub fn extent(&self) -> vk::Extent2D {
        self.info.extent
    }
    pub fn format(&self) -> vk::Format {
        self.info.format
    }
    pub fn mip_levels(&self) -> u32 {
        self.info.mip_levels
    }
}

impl HasDevice for Image {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl HasImage for Image {
    fn raw_image(&self) -> vk::Image {
        self.image
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        tracing::debug!(image = ?self.image, "drop image");
        self.device.destroy_image(self.image);
    }
}
