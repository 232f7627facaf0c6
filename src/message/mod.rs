//! Wire format shared by the game-side encoder and the renderer-side decoder.
//!
//! Every record starts with a one byte [`Opcode`], followed by the fixed fields of its header
//! and, for messages with a `data_size` field, `data_size` bytes of payload. Headers are packed;
//! read fields by value.
use bytemuck::{Pod, Zeroable};

pub mod decoder;
pub mod encoder;

pub use decoder::{MessageReader, MessageReceiver};
pub use encoder::{MessageSender, MessageSlot};

/// Size of the length prefix at the start of every block.
pub const BLOCK_HEADER_SIZE: usize = 4;
/// Bytes of a padding record before its filler.
pub const PADDING_HEADER_SIZE: usize = 2;

/// Resource ids are nonzero; zero stands for "nothing bound".
pub const NULL_ID: u32 = 0;

/// Opcodes are assigned in declaration order. Producer and consumer must agree on this list.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Padding,
    CreateTexture,
    WriteTexture,
    CreateVertexBuffer,
    WriteVertexBuffer,
    CreateIndexBuffer,
    WriteIndexBuffer,
    CreateVertexShader,
    CreatePixelShader,
    SetRenderState,
    SetTexture,
    SetViewport,
    SetScissorRect,
    SetRenderTarget,
    SetDepthStencilSurface,
    SetVertexShader,
    SetPixelShader,
    SetStreamSource,
    SetIndices,
    SetVertexShaderConstants,
    SetPixelShaderConstants,
    DrawIndexedPrimitive,
    Present,
    ReleaseResource,
    CreateBottomLevelAccelStruct,
    ReleaseRaytracingResource,
    CreateInstance,
    TraceRays,
    CreateMaterial,
    ComputePose,
    BuildBottomLevelAccelStruct,
}

impl Opcode {
    pub const ALL: [Opcode; 31] = [
        Opcode::Padding,
        Opcode::CreateTexture,
        Opcode::WriteTexture,
        Opcode::CreateVertexBuffer,
        Opcode::WriteVertexBuffer,
        Opcode::CreateIndexBuffer,
        Opcode::WriteIndexBuffer,
        Opcode::CreateVertexShader,
        Opcode::CreatePixelShader,
        Opcode::SetRenderState,
        Opcode::SetTexture,
        Opcode::SetViewport,
        Opcode::SetScissorRect,
        Opcode::SetRenderTarget,
        Opcode::SetDepthStencilSurface,
        Opcode::SetVertexShader,
        Opcode::SetPixelShader,
        Opcode::SetStreamSource,
        Opcode::SetIndices,
        Opcode::SetVertexShaderConstants,
        Opcode::SetPixelShaderConstants,
        Opcode::DrawIndexedPrimitive,
        Opcode::Present,
        Opcode::ReleaseResource,
        Opcode::CreateBottomLevelAccelStruct,
        Opcode::ReleaseRaytracingResource,
        Opcode::CreateInstance,
        Opcode::TraceRays,
        Opcode::CreateMaterial,
        Opcode::ComputePose,
        Opcode::BuildBottomLevelAccelStruct,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn is_raytracing(self) -> bool {
        self as u8 >= Opcode::CreateBottomLevelAccelStruct as u8
    }
}

/// A fixed message header.
pub trait Message: Pod {
    const OPCODE: Opcode;
    /// Required alignment of the record's start within a block.
    const ALIGNMENT: usize = 1;

    /// Length of the payload following the header.
    fn payload_len(&self) -> usize {
        0
    }
    fn set_payload_len(&mut self, _len: usize) {}
}

macro_rules! impl_message {
    ($ty:ident, $opcode:ident) => {
        impl Message for $ty {
            const OPCODE: Opcode = Opcode::$opcode;
        }
    };
    ($ty:ident, $opcode:ident, align = $align:expr, payload) => {
        impl Message for $ty {
            const OPCODE: Opcode = Opcode::$opcode;
            const ALIGNMENT: usize = $align;
            fn payload_len(&self) -> usize {
                self.data_size as usize
            }
            fn set_payload_len(&mut self, len: usize) {
                self.data_size = len as _;
            }
        }
    };
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgPadding {
    pub id: u8,
    pub data_size: u8,
}
impl_message!(MsgPadding, Padding, align = 1, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreateTexture {
    pub id: u8,
    pub levels: u8,
    pub width: u16,
    pub height: u16,
    /// D3DFORMAT
    pub format: u32,
    pub texture_id: u32,
}
impl_message!(MsgCreateTexture, CreateTexture);

/// Payload: the texels of one mip level.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgWriteTexture {
    pub id: u8,
    pub mip_level: u8,
    pub _pad: [u8; 2],
    pub texture_id: u32,
    pub data_size: u32,
    pub _reserved: u32,
}
impl_message!(MsgWriteTexture, WriteTexture, align = 16, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreateVertexBuffer {
    pub id: u8,
    pub allow_unordered_access: u8,
    pub vertex_buffer_id: u32,
    pub length: u32,
}
impl_message!(MsgCreateVertexBuffer, CreateVertexBuffer);

/// Payload: bytes written at `offset`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgWriteVertexBuffer {
    pub id: u8,
    pub initial_write: u8,
    pub _pad: [u8; 2],
    pub vertex_buffer_id: u32,
    pub offset: u32,
    pub data_size: u32,
}
impl_message!(MsgWriteVertexBuffer, WriteVertexBuffer, align = 16, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreateIndexBuffer {
    pub id: u8,
    /// D3DFORMAT, always INDEX16
    pub format: u32,
    pub index_buffer_id: u32,
    pub length: u32,
}
impl_message!(MsgCreateIndexBuffer, CreateIndexBuffer);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgWriteIndexBuffer {
    pub id: u8,
    pub initial_write: u8,
    pub _pad: [u8; 2],
    pub index_buffer_id: u32,
    pub offset: u32,
    pub data_size: u32,
}
impl_message!(MsgWriteIndexBuffer, WriteIndexBuffer, align = 16, payload);

/// Payload: shader bytecode.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreateVertexShader {
    pub id: u8,
    pub _pad: [u8; 3],
    pub shader_id: u32,
    pub data_size: u32,
    pub _reserved: u32,
}
impl_message!(MsgCreateVertexShader, CreateVertexShader, align = 16, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreatePixelShader {
    pub id: u8,
    pub _pad: [u8; 3],
    pub shader_id: u32,
    pub data_size: u32,
    pub _reserved: u32,
}
impl_message!(MsgCreatePixelShader, CreatePixelShader, align = 16, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetRenderState {
    pub id: u8,
    pub state: u8,
    pub value: u32,
}
impl_message!(MsgSetRenderState, SetRenderState);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetTexture {
    pub id: u8,
    pub stage: u8,
    pub texture_id: u32,
}
impl_message!(MsgSetTexture, SetTexture);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetViewport {
    pub id: u8,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_z: f32,
    pub max_z: f32,
}
impl_message!(MsgSetViewport, SetViewport);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetScissorRect {
    pub id: u8,
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}
impl_message!(MsgSetScissorRect, SetScissorRect);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetRenderTarget {
    pub id: u8,
    pub texture_id: u32,
}
impl_message!(MsgSetRenderTarget, SetRenderTarget);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetDepthStencilSurface {
    pub id: u8,
    pub texture_id: u32,
}
impl_message!(MsgSetDepthStencilSurface, SetDepthStencilSurface);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetVertexShader {
    pub id: u8,
    pub shader_id: u32,
}
impl_message!(MsgSetVertexShader, SetVertexShader);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetPixelShader {
    pub id: u8,
    pub shader_id: u32,
}
impl_message!(MsgSetPixelShader, SetPixelShader);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetStreamSource {
    pub id: u8,
    pub vertex_buffer_id: u32,
    pub offset: u32,
    pub stride: u32,
}
impl_message!(MsgSetStreamSource, SetStreamSource);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetIndices {
    pub id: u8,
    pub index_buffer_id: u32,
}
impl_message!(MsgSetIndices, SetIndices);

/// Payload: `data_size / 16` float4 registers starting at `start_register`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetVertexShaderConstants {
    pub id: u8,
    pub _pad: [u8; 3],
    pub start_register: u32,
    pub data_size: u32,
    pub _reserved: u32,
}
impl_message!(MsgSetVertexShaderConstants, SetVertexShaderConstants, align = 16, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgSetPixelShaderConstants {
    pub id: u8,
    pub _pad: [u8; 3],
    pub start_register: u32,
    pub data_size: u32,
    pub _reserved: u32,
}
impl_message!(MsgSetPixelShaderConstants, SetPixelShaderConstants, align = 16, payload);

pub const PRIMITIVE_TRIANGLE_LIST: u8 = 4;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgDrawIndexedPrimitive {
    pub id: u8,
    /// D3DPRIMITIVETYPE
    pub primitive_type: u8,
    pub base_vertex_index: i32,
    pub start_index: u32,
    pub primitive_count: u32,
}
impl_message!(MsgDrawIndexedPrimitive, DrawIndexedPrimitive);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgPresent {
    pub id: u8,
}
impl_message!(MsgPresent, Present);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Texture,
    IndexBuffer,
    VertexBuffer,
    VertexShader,
    PixelShader,
}

impl ResourceType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Texture),
            1 => Some(Self::IndexBuffer),
            2 => Some(Self::VertexBuffer),
            3 => Some(Self::VertexShader),
            4 => Some(Self::PixelShader),
            _ => None,
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgReleaseResource {
    pub id: u8,
    pub resource_type: u8,
    pub resource_id: u32,
}
impl_message!(MsgReleaseResource, ReleaseResource);

/// Geometry flags carried in [`GeometryDescription::flags`].
pub mod geometry_flags {
    pub const TRANSPARENT: u32 = 1 << 0;
    pub const PUNCH_THROUGH: u32 = 1 << 1;
}

/// One submesh of a bottom level acceleration structure.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GeometryDescription {
    pub flags: u32,
    pub index_buffer_id: u32,
    pub index_count: u32,
    /// Byte offset into the index buffer.
    pub index_offset: u32,
    pub vertex_buffer_id: u32,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    /// Byte offset of the first vertex's position.
    pub position_offset: u32,
    pub normal_offset: u32,
    pub tangent_offset: u32,
    pub binormal_offset: u32,
    pub color_offset: u32,
    pub tex_coord_offsets: [u32; 4],
    pub material_id: u32,
}

/// Payload: `GeometryDescription[data_size / size_of::<GeometryDescription>()]`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreateBottomLevelAccelStruct {
    pub id: u8,
    pub allow_update: u8,
    pub allow_compaction: u8,
    pub prefer_fast_build: u8,
    pub blas_id: u32,
    pub data_size: u32,
}
impl_message!(MsgCreateBottomLevelAccelStruct, CreateBottomLevelAccelStruct, align = 4, payload);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaytracingResourceType {
    BottomLevelAccelStruct,
    Instance,
    Material,
}

impl RaytracingResourceType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::BottomLevelAccelStruct),
            1 => Some(Self::Instance),
            2 => Some(Self::Material),
            _ => None,
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgReleaseRaytracingResource {
    pub id: u8,
    pub resource_type: u8,
    pub resource_id: u32,
}
impl_message!(MsgReleaseRaytracingResource, ReleaseRaytracingResource);

/// Payload: `(src_material_id: u32, dst_material_id: u32)` override pairs.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreateInstance {
    pub id: u8,
    pub is_mirrored: u8,
    pub instance_mask: u8,
    pub instance_type: u8,
    /// Row-major 3x4
    pub transform: [f32; 12],
    pub prev_transform: [f32; 12],
    pub instance_id: u32,
    pub blas_id: u32,
    pub data_size: u32,
}
impl_message!(MsgCreateInstance, CreateInstance, align = 4, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgTraceRays {
    pub id: u8,
    pub reset_accumulation: u8,
    pub debug_view: u8,
    pub env_mode: u8,
    pub width: u16,
    pub height: u16,
    pub blue_noise_texture_id: u32,
    pub diffuse_power: f32,
    pub light_power: f32,
    pub emissive_power: f32,
    pub sky_power: f32,
    pub sky_color: [f32; 3],
    pub ground_color: [f32; 3],
    pub background_color: [f32; 3],
    pub middle_gray: f32,
    pub use_sky_texture: u32,
}
impl_message!(MsgTraceRays, TraceRays);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialTexture {
    pub texture_id: u32,
    /// D3DTEXTUREADDRESS
    pub address_mode_u: u8,
    pub address_mode_v: u8,
    pub tex_coord_index: u8,
    pub _pad: u8,
}

pub const MAX_MATERIAL_TEXTURES: usize = 16;
pub const MAX_MATERIAL_PARAMETERS: usize = 32;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgCreateMaterial {
    pub id: u8,
    pub texture_count: u8,
    pub parameter_count: u8,
    pub _pad: u8,
    pub material_id: u32,
    pub shader_type: u32,
    pub flags: u32,
    pub tex_coord_offsets: [f32; 8],
    pub textures: [MaterialTexture; MAX_MATERIAL_TEXTURES],
    pub parameters: [f32; MAX_MATERIAL_PARAMETERS],
}
impl_message!(MsgCreateMaterial, CreateMaterial);

/// A skinned submesh written by [`MsgComputePose`].
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PoseGeometry {
    /// Source vertices in bind pose.
    pub vertex_buffer_id: u32,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub position_offset: u32,
    pub normal_offset: u32,
    pub tangent_offset: u32,
    pub binormal_offset: u32,
    pub blend_weight_offset: u32,
    pub blend_indices_offset: u32,
}

/// Payload: `node_count` row-major 3x4 matrices, then `geometry_count` [`PoseGeometry`].
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgComputePose {
    pub id: u8,
    pub _pad: [u8; 3],
    /// Destination of the posed vertices, written back to back.
    pub vertex_buffer_id: u32,
    pub node_count: u32,
    pub geometry_count: u32,
    pub data_size: u32,
    pub _reserved: [u32; 3],
}
impl_message!(MsgComputePose, ComputePose, align = 16, payload);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgBuildBottomLevelAccelStruct {
    pub id: u8,
    pub perform_update: u8,
    pub blas_id: u32,
}
impl_message!(MsgBuildBottomLevelAccelStruct, BuildBottomLevelAccelStruct);
