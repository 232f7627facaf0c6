#![allow(dead_code)]

use std::sync::Arc;

use bytemuck::Zeroable;
use raybridge::{
    headless::HeadlessDevice,
    message::*,
    transport::SharedMemory,
    BridgeContext, BridgeError, Config, Device,
};

pub const VERTEX_BUFFER: u32 = 1;
pub const INDEX_BUFFER: u32 = 2;
pub const BLAS: u32 = 1;
pub const INSTANCE: u32 = 0;
pub const MATERIAL: u32 = 1;

const D3DFMT_INDEX16: u32 = 101;
pub const D3DFMT_A8R8G8B8: u32 = 21;

/// A context fed through a real sender and receiver pair on one thread.
pub struct Harness {
    pub headless: HeadlessDevice,
    pub context: BridgeContext,
    sender: MessageSender,
    receiver: MessageReceiver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_device(HeadlessDevice::new())
    }

    pub fn with_device(headless: HeadlessDevice) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let config = Config {
            quality_mode: raybridge::QualityMode::Native,
            transport_capacity: 64 * 1024,
            ..Default::default()
        };
        let context = BridgeContext::new(Device::new(headless.clone()), &config).unwrap();
        let shared = Arc::new(SharedMemory::anonymous(config.transport_capacity).unwrap());
        Self {
            headless,
            context,
            sender: MessageSender::new(shared.clone()),
            receiver: MessageReceiver::new(shared),
        }
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Publishes what was sent so far and processes it as one frame.
    pub fn frame(&mut self) -> Result<usize, BridgeError> {
        self.sender.commit();
        let block = self.receiver.receive().unwrap();
        self.context.process_block(block)
    }
}

pub fn send_quad(sender: &MessageSender) {
    let vertices: [f32; 12] = [
        0.0, 0.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, //
        1.0, 1.0, 0.0,
    ];
    let indices: [u16; 6] = [0, 1, 2, 2, 1, 3];
    sender
        .send(&MsgCreateVertexBuffer {
            vertex_buffer_id: VERTEX_BUFFER,
            length: 48,
            ..Zeroable::zeroed()
        })
        .unwrap();
    sender
        .send_with_payload(
            &MsgWriteVertexBuffer {
                vertex_buffer_id: VERTEX_BUFFER,
                initial_write: 1,
                ..Zeroable::zeroed()
            },
            bytemuck::cast_slice(&vertices),
        )
        .unwrap();
    sender
        .send(&MsgCreateIndexBuffer {
            format: D3DFMT_INDEX16,
            index_buffer_id: INDEX_BUFFER,
            length: 12,
            ..Zeroable::zeroed()
        })
        .unwrap();
    sender
        .send_with_payload(
            &MsgWriteIndexBuffer {
                index_buffer_id: INDEX_BUFFER,
                initial_write: 1,
                ..Zeroable::zeroed()
            },
            bytemuck::cast_slice(&indices),
        )
        .unwrap();
}

pub fn quad_geometry() -> GeometryDescription {
    GeometryDescription {
        index_buffer_id: INDEX_BUFFER,
        index_count: 6,
        vertex_buffer_id: VERTEX_BUFFER,
        vertex_stride: 12,
        vertex_count: 4,
        material_id: MATERIAL,
        ..Zeroable::zeroed()
    }
}

pub fn send_blas(sender: &MessageSender) {
    let geometry = quad_geometry();
    sender
        .send_with_payload(
            &MsgCreateBottomLevelAccelStruct {
                blas_id: BLAS,
                ..Zeroable::zeroed()
            },
            bytemuck::bytes_of(&geometry),
        )
        .unwrap();
}

pub fn send_instance(sender: &MessageSender) {
    let identity = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    sender
        .send(&MsgCreateInstance {
            instance_mask: 0xff,
            transform: identity,
            prev_transform: identity,
            instance_id: INSTANCE,
            blas_id: BLAS,
            ..Zeroable::zeroed()
        })
        .unwrap();
}

pub fn send_trace(sender: &MessageSender, width: u16, height: u16) {
    sender
        .send(&MsgTraceRays {
            width,
            height,
            diffuse_power: 1.0,
            light_power: 1.0,
            emissive_power: 1.0,
            sky_power: 1.0,
            middle_gray: 0.18,
            ..Zeroable::zeroed()
        })
        .unwrap();
}

pub fn send_texture(sender: &MessageSender, texture_id: u32) {
    sender
        .send(&MsgCreateTexture {
            levels: 1,
            width: 4,
            height: 4,
            format: D3DFMT_A8R8G8B8,
            texture_id,
            ..Zeroable::zeroed()
        })
        .unwrap();
}

pub fn send_material(sender: &MessageSender, material_id: u32, texture_id: u32) {
    let mut textures = [MaterialTexture::zeroed(); MAX_MATERIAL_TEXTURES];
    textures[0] = MaterialTexture {
        texture_id,
        ..Zeroable::zeroed()
    };
    sender
        .send(&MsgCreateMaterial {
            texture_count: 1,
            material_id,
            textures,
            ..Zeroable::zeroed()
        })
        .unwrap();
}
