//! Per-frame constants of the ray tracing passes.
use ash::vk;
use bytemuck::{Pod, Zeroable};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{message::MsgTraceRays, util::halton};

/// Number of jitter positions before the sequence repeats.
pub const JITTER_PHASE_COUNT: u32 = 64;
pub const BLUE_NOISE_RANGE: i32 = 1024;

/// Sub-pixel offset of `frame`, in `[-0.5, 0.5)` on both axes.
pub fn pixel_jitter(frame: u32) -> [f32; 2] {
    let index = frame % JITTER_PHASE_COUNT + 1;
    [halton(index, 2) - 0.5, halton(index, 3) - 0.5]
}

/// Random tile offsets into the blue noise texture.
pub struct BlueNoise {
    rng: StdRng,
}

impl BlueNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_offset(&mut self) -> [i32; 2] {
        [
            self.rng.gen_range(0..=BLUE_NOISE_RANGE),
            self.rng.gen_range(0..=BLUE_NOISE_RANGE),
        ]
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct GlobalsRT {
    pub pixel_jitter: [f32; 2],
    pub blue_noise_offset: [i32; 2],
    pub internal_resolution: [u32; 2],
    pub output_resolution: [u32; 2],
    pub frame: u32,
    pub reset_accumulation: u32,
    pub debug_view: u32,
    pub env_mode: u32,
    pub blue_noise_texture: u32,
    pub use_sky_texture: u32,
    pub diffuse_power: f32,
    pub light_power: f32,
    pub emissive_power: f32,
    pub sky_power: f32,
    pub middle_gray: f32,
    pub _pad: f32,
    pub sky_color: [f32; 4],
    pub ground_color: [f32; 4],
    pub background_color: [f32; 4],
}

fn rgb(color: [f32; 3]) -> [f32; 4] {
    [color[0], color[1], color[2], 1.0]
}

impl GlobalsRT {
    pub fn new(
        message: &MsgTraceRays,
        frame: u32,
        blue_noise_offset: [i32; 2],
        blue_noise_texture: u32,
        render_extent: vk::Extent2D,
        output_extent: vk::Extent2D,
    ) -> Self {
        Self {
            pixel_jitter: pixel_jitter(frame),
            blue_noise_offset,
            internal_resolution: [render_extent.width, render_extent.height],
            output_resolution: [output_extent.width, output_extent.height],
            frame,
            reset_accumulation: message.reset_accumulation as u32,
            debug_view: message.debug_view as u32,
            env_mode: message.env_mode as u32,
            blue_noise_texture,
            use_sky_texture: message.use_sky_texture,
            diffuse_power: message.diffuse_power,
            light_power: message.light_power,
            emissive_power: message.emissive_power,
            sky_power: message.sky_power,
            middle_gray: message.middle_gray,
            _pad: 0.0,
            sky_color: rgb(message.sky_color),
            ground_color: rgb(message.ground_color),
            background_color: rgb(message.background_color),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_cycles_every_64_frames() {
        assert_eq!(pixel_jitter(0), [0.0, halton(1, 3) - 0.5]);
        assert_eq!(pixel_jitter(1), [-0.25, halton(2, 3) - 0.5]);
        assert_eq!(pixel_jitter(64), pixel_jitter(0));
        for frame in 0..JITTER_PHASE_COUNT {
            let [x, y] = pixel_jitter(frame);
            assert!((-0.5..0.5).contains(&x) && (-0.5..0.5).contains(&y));
        }
    }

    #[test]
    fn blue_noise_is_seeded() {
        let mut a = BlueNoise::new(7);
        let mut b = BlueNoise::new(7);
        for _ in 0..32 {
            let offset = a.next_offset();
            assert_eq!(offset, b.next_offset());
            assert!(offset.iter().all(|v| (0..=BLUE_NOISE_RANGE).contains(v)));
        }
    }

    #[test]
    fn globals_layout_is_vec4_aligned() {
        assert_eq!(std::mem::size_of::<GlobalsRT>() % 16, 0);
    }
}
