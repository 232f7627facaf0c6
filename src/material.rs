//! Materials as the hit shaders read them, plus deferred texture binding.
use ash::{prelude::VkResult, vk};
use bytemuck::{Pod, Zeroable};

use crate::{
    descriptor::{
        sampler::{address_mode_from_d3d, SamplerCache, SamplerDescription},
        DescriptorHeap,
    },
    message::{MsgCreateMaterial, MAX_MATERIAL_PARAMETERS, MAX_MATERIAL_TEXTURES, NULL_ID},
    resources::table::ResourceTable,
};

const SRV_BITS: u32 = 20;
const SRV_MASK: u32 = (1 << SRV_BITS) - 1;
const SAMPLER_MASK: u32 = (1 << 10) - 1;

/// Packs a material texture field: view slot, sampler slot and texture coordinate set.
pub const fn pack_texture(srv: u32, sampler: u32, tex_coord_index: u32) -> u32 {
    (srv & SRV_MASK) | (sampler & SAMPLER_MASK) << SRV_BITS | (tex_coord_index & 3) << 30
}

pub const fn texture_srv(field: u32) -> u32 {
    field & SRV_MASK
}

/// Replaces the view slot of a packed field, keeping its sampler and coordinate set.
pub const fn with_texture_srv(field: u32, srv: u32) -> u32 {
    (field & !SRV_MASK) | (srv & SRV_MASK)
}

pub const fn texture_sampler(field: u32) -> u32 {
    (field >> SRV_BITS) & SAMPLER_MASK
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Material {
    pub shader_type: u32,
    pub flags: u32,
    pub tex_coord_offsets: [f32; 8],
    pub textures: [u32; MAX_MATERIAL_TEXTURES],
    pub parameters: [f32; MAX_MATERIAL_PARAMETERS],
}

const MATERIAL_WORDS: usize = std::mem::size_of::<Material>() / 4;
const TEXTURES_WORD: usize = std::mem::offset_of!(Material, textures) / 4;

/// A texture field waiting for its texture to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedTexture {
    texture_id: u32,
    /// Byte offset of the field in the material array.
    offset: usize,
}

impl DelayedTexture {
    fn material_id(&self) -> u32 {
        (self.offset / std::mem::size_of::<Material>()) as u32
    }
}

#[derive(Default)]
pub struct MaterialTable {
    materials: Vec<Material>,
    delayed: Vec<DelayedTexture>,
}

impl MaterialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn material(&self, id: u32) -> Option<&Material> {
        self.materials.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Texture fields still waiting for their texture.
    pub fn delayed_texture_count(&self) -> usize {
        self.delayed.len()
    }

    /// The material array as uploaded for the shaders.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.materials)
    }

    fn words_mut(&mut self) -> &mut [u32] {
        bytemuck::cast_slice_mut(&mut self.materials)
    }

    /// Creates or replaces a material. Textures that do not exist yet are bound on a later
    /// [`resolve_delayed`](Self::resolve_delayed).
    pub fn create(
        &mut self,
        message: &MsgCreateMaterial,
        resources: &ResourceTable,
        samplers: &mut SamplerCache,
    ) -> VkResult<()> {
        let id = message.material_id;
        let index = id as usize;
        if self.materials.len() <= index {
            self.materials.resize(index + 1, Material::zeroed());
        }
        self.delayed.retain(|d| d.material_id() != id);

        let mut material = Material {
            shader_type: message.shader_type,
            flags: message.flags,
            tex_coord_offsets: message.tex_coord_offsets,
            textures: [0; MAX_MATERIAL_TEXTURES],
            parameters: message.parameters,
        };
        let textures = message.textures;
        let texture_count = (message.texture_count as usize).min(MAX_MATERIAL_TEXTURES);
        for (slot, texture) in textures[..texture_count].iter().enumerate() {
            let texture_id = texture.texture_id;
            if texture_id == NULL_ID {
                continue;
            }
            let sampler = samplers.get_or_create(&SamplerDescription::material(
                address_mode_from_d3d(texture.address_mode_u),
                address_mode_from_d3d(texture.address_mode_v),
            ))?;
            let srv = match resources.texture(texture_id) {
                Some(texture) => texture.srv(),
                None => {
                    let offset = (index * MATERIAL_WORDS + TEXTURES_WORD + slot) * 4;
                    self.delayed.push(DelayedTexture { texture_id, offset });
                    tracing::trace!(material = id, texture_id, "defer material texture");
                    DescriptorHeap::NULL_SLOT
                }
            };
            material.textures[slot] = pack_texture(srv, sampler, texture.tex_coord_index as u32);
        }
        self.materials[index] = material;
        Ok(())
    }

    /// Binds every delayed texture that exists by now. The rest stay queued in order.
    /// Returns the number of fields resolved.
    pub fn resolve_delayed(&mut self, resources: &ResourceTable) -> usize {
        if self.delayed.is_empty() {
            return 0;
        }
        let mut delayed = std::mem::take(&mut self.delayed);
        let before = delayed.len();
        let words = self.words_mut();
        delayed.retain(|d| match resources.texture(d.texture_id) {
            Some(texture) => {
                let field = &mut words[d.offset / 4];
                *field = with_texture_srv(*field, texture.srv());
                false
            }
            None => true,
        });
        let resolved = before - delayed.len();
        tracing::trace!(resolved, remaining = delayed.len(), "resolve delayed textures");
        self.delayed = delayed;
        resolved
    }

    /// Unbinds a texture that is about to be released and queues its fields again.
    pub fn on_texture_released(&mut self, texture_id: u32, srv: u32) {
        if srv == DescriptorHeap::NULL_SLOT {
            return;
        }
        let mut requeued = Vec::new();
        for (index, material) in self.materials.iter_mut().enumerate() {
            for (slot, field) in material.textures.iter_mut().enumerate() {
                if texture_srv(*field) == srv {
                    *field &= !SRV_MASK;
                    let offset = (index * MATERIAL_WORDS + TEXTURES_WORD + slot) * 4;
                    requeued.push(DelayedTexture { texture_id, offset });
                }
            }
        }
        if !requeued.is_empty() {
            tracing::debug!(texture_id, fields = requeued.len(), "texture released under materials");
        }
        self.delayed.extend(requeued);
    }

    /// Resets a material to the inert default and forgets its delayed textures.
    pub fn release(&mut self, id: u32) {
        if let Some(material) = self.materials.get_mut(id as usize) {
            *material = Material::zeroed();
        }
        self.delayed.retain(|d| d.material_id() != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::DescriptorHeap,
        frames::{FrameManager, Options},
        headless::HeadlessDevice,
        message::MaterialTexture,
        resources::alloc::Allocator,
        Device,
    };
    use std::sync::Arc;

    struct Fixture {
        headless: HeadlessDevice,
        heap: DescriptorHeap,
        frames: FrameManager,
        samplers: SamplerCache,
        resources: ResourceTable,
    }

    fn fixture() -> Fixture {
        let headless = HeadlessDevice::new();
        let device = Device::new(headless.clone());
        let allocator = Arc::new(Allocator::new(device.clone()));
        Fixture {
            headless,
            heap: DescriptorHeap::new(device.clone()),
            frames: FrameManager::new(allocator, Options::default()),
            samplers: SamplerCache::new(device),
            resources: ResourceTable::new(),
        }
    }

    fn create_texture(f: &mut Fixture, id: u32) -> u32 {
        f.resources
            .create_texture(
                &mut f.heap,
                &mut f.frames,
                id,
                vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                1,
                21,
            )
            .unwrap()
            .srv()
    }

    fn material_message(material_id: u32, textures: &[(u32, u8)]) -> MsgCreateMaterial {
        let mut message = MsgCreateMaterial::zeroed();
        message.material_id = material_id;
        message.shader_type = 3;
        message.texture_count = textures.len() as u8;
        let mut fields = [MaterialTexture::zeroed(); MAX_MATERIAL_TEXTURES];
        for (field, &(texture_id, tex_coord_index)) in fields.iter_mut().zip(textures) {
            field.texture_id = texture_id;
            field.address_mode_u = 1;
            field.address_mode_v = 3;
            field.tex_coord_index = tex_coord_index;
        }
        message.textures = fields;
        message
    }

    #[test]
    fn loaded_textures_bind_immediately() {
        let mut f = fixture();
        let srv = create_texture(&mut f, 5);
        let mut table = MaterialTable::new();
        table
            .create(&material_message(2, &[(5, 1)]), &f.resources, &mut f.samplers)
            .unwrap();
        let field = table.material(2).unwrap().textures[0];
        assert_eq!(texture_srv(field), srv);
        assert_eq!(field >> 30, 1);
        let sampler = texture_sampler(field);
        assert_eq!(
            f.headless.sampler(sampler).unwrap().address_mode_v,
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        );
        assert_eq!(table.delayed_texture_count(), 0);
        assert_eq!(table.material(0), Some(&Material::zeroed()));
    }

    #[test]
    fn rebinding_a_view_keeps_the_other_bits() {
        let field = pack_texture(0, 9, 2);
        let rebound = with_texture_srv(field, SRV_MASK + 5);
        assert_eq!(texture_srv(rebound), 4);
        assert_eq!(texture_sampler(rebound), 9);
        assert_eq!(rebound >> 30, 2);
        assert_eq!(with_texture_srv(rebound, 17), pack_texture(17, 9, 2));
    }

    #[test]
    fn delayed_textures_resolve_in_order() {
        let mut f = fixture();
        let mut table = MaterialTable::new();
        table
            .create(
                &material_message(1, &[(7, 0), (8, 2)]),
                &f.resources,
                &mut f.samplers,
            )
            .unwrap();
        assert_eq!(table.delayed_texture_count(), 2);
        assert_eq!(texture_srv(table.material(1).unwrap().textures[0]), 0);

        assert_eq!(table.resolve_delayed(&f.resources), 0);
        assert_eq!(table.delayed_texture_count(), 2);

        let sampler = texture_sampler(table.material(1).unwrap().textures[1]);
        let srv = create_texture(&mut f, 8);
        assert_eq!(table.resolve_delayed(&f.resources), 1);
        let material = *table.material(1).unwrap();
        assert_eq!(texture_srv(material.textures[0]), 0);
        assert_eq!(texture_srv(material.textures[1]), srv);
        assert_eq!(texture_sampler(material.textures[1]), sampler);
        assert_eq!(material.textures[1] >> 30, 2);
        assert_eq!(table.delayed_texture_count(), 1);
    }

    #[test]
    fn released_texture_is_deferred_again() {
        let mut f = fixture();
        let srv = create_texture(&mut f, 4);
        let mut table = MaterialTable::new();
        table
            .create(&material_message(0, &[(4, 0)]), &f.resources, &mut f.samplers)
            .unwrap();
        table.on_texture_released(4, srv);
        f.resources.release(
            &mut f.heap,
            &mut f.frames,
            crate::message::ResourceType::Texture,
            4,
        );
        assert_eq!(texture_srv(table.material(0).unwrap().textures[0]), 0);
        assert_eq!(table.delayed_texture_count(), 1);

        let srv = create_texture(&mut f, 4);
        table.resolve_delayed(&f.resources);
        assert_eq!(texture_srv(table.material(0).unwrap().textures[0]), srv);
    }

    #[test]
    fn release_discards_pending_fields() {
        let mut f = fixture();
        let mut table = MaterialTable::new();
        table
            .create(&material_message(3, &[(9, 0)]), &f.resources, &mut f.samplers)
            .unwrap();
        table.release(3);
        assert_eq!(table.delayed_texture_count(), 0);
        assert_eq!(table.material(3), Some(&Material::zeroed()));
    }
}
