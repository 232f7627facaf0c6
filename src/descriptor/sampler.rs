use std::{collections::HashMap, sync::Arc};

use ash::{prelude::VkResult, vk};
use xxhash_rust::xxh3::xxh3_64;

use crate::{Device, HasDevice};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescription {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: f32,
    pub compare_op: vk::CompareOp,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl SamplerDescription {
    /// Linear min/mag, point mip, clamped W: the sampler every material texture uses.
    pub fn material(
        address_mode_u: vk::SamplerAddressMode,
        address_mode_v: vk::SamplerAddressMode,
    ) -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u,
            address_mode_v,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            mip_lod_bias: 0.0,
            max_anisotropy: 1.0,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }

    fn to_bytes(&self) -> [u8; 44] {
        let words: [u32; 11] = [
            self.mag_filter.as_raw() as u32,
            self.min_filter.as_raw() as u32,
            self.mipmap_mode.as_raw() as u32,
            self.address_mode_u.as_raw() as u32,
            self.address_mode_v.as_raw() as u32,
            self.address_mode_w.as_raw() as u32,
            self.mip_lod_bias.to_bits(),
            self.max_anisotropy.to_bits(),
            self.compare_op.as_raw() as u32,
            self.min_lod.to_bits(),
            self.max_lod.to_bits(),
        ];
        let mut bytes = [0u8; 44];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Content hash over every field.
    pub fn hash_key(&self) -> u64 {
        xxh3_64(&self.to_bytes())
    }
}

/// Maps a D3D texture address mode onto the sampler address mode. Unknown values wrap.
pub fn address_mode_from_d3d(mode: u8) -> vk::SamplerAddressMode {
    match mode {
        2 => vk::SamplerAddressMode::MIRRORED_REPEAT,
        3 => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        4 => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        5 => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
        _ => vk::SamplerAddressMode::REPEAT,
    }
}

/// Creates each distinct sampler once and hands out its heap slot.
pub struct SamplerCache {
    device: Arc<Device>,
    samplers: HashMap<u64, u32>,
    capacity: u32,
    tail: u32,
}

impl HasDevice for SamplerCache {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl SamplerCache {
    pub fn new(device: Arc<Device>) -> Self {
        let capacity = device.physical_device().properties().max_sampler_heap_size;
        Self {
            device,
            samplers: HashMap::new(),
            capacity,
            tail: 0,
        }
    }

    pub fn get_or_create(&mut self, desc: &SamplerDescription) -> VkResult<u32> {
        let key = desc.hash_key();
        if let Some(&slot) = self.samplers.get(&key) {
            return Ok(slot);
        }
        if self.tail >= self.capacity {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let slot = self.tail;
        self.device.create_sampler(slot, desc)?;
        self.tail += 1;
        self.samplers.insert(key, slot);
        tracing::debug!(slot, key, "create sampler");
        Ok(slot)
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }
}
