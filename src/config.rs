use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};

/// Per-frame effect parameters, uploaded verbatim as the GPU constant buffer.
///
/// This is a binary contract with the shader kernels: the layout is packed, field
/// order and widths are fixed, and the total size is exactly 128 bytes. Reordering
/// or resizing any field breaks the kernel's view of the buffer.
///
/// Boolean toggles are `u8` (0 or 1) to match the kernel's byte-addressed flags.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct EffectsConfig {
    pub depth_intensity: f32,
    pub parallax_strength: f32,
    pub alpha: f32,
    pub edge_depth_influence: f32,
    pub color_separation: f32,
    pub perspective_strength: f32,
    pub enable_gpu: u8,
    pub processing_quality: i32,
    pub enable_chromatic: u8,
    pub enable_parallax: u8,
    pub enable_dof: u8,
    pub time: f32,
    pub occlusion_strength: f32,
    pub wiggle_frequency: f32,
    pub fog_density: f32,
    pub fog_color_r: f32,
    pub fog_color_g: f32,
    pub fog_color_b: f32,
    pub fog_scatter: f32,
    pub fog_anisotropy: f32,
    pub fog_height_falloff: f32,
    pub temporal_blend: f32,
    pub outline_width: f32,
    pub outline_intensity: f32,
    pub enable_parallax_barrier: u8,
    pub enable_lenticular: u8,
    pub enable_volumetric_fog: u8,
    padding: [u8; 41],
}

const _: () = assert!(size_of::<EffectsConfig>() == 128);

impl EffectsConfig {
    pub const SIZE: usize = size_of::<EffectsConfig>();

    /// The known-good state restored after device recovery.
    pub const DEFAULT: EffectsConfig = EffectsConfig {
        depth_intensity: 1200.0,
        parallax_strength: 1260.0,
        alpha: 0.95,
        edge_depth_influence: 1000.0,
        color_separation: 12.0,
        perspective_strength: 160.0,
        enable_gpu: 1,
        processing_quality: 3,
        enable_chromatic: 1,
        enable_parallax: 1,
        enable_dof: 1,
        time: 0.016,
        occlusion_strength: 0.75,
        wiggle_frequency: 12.0,
        fog_density: 100.02,
        fog_color_r: 0.6,
        fog_color_g: 0.65,
        fog_color_b: 0.7,
        fog_scatter: 0.5,
        fog_anisotropy: 1000.0,
        fog_height_falloff: 1.0,
        temporal_blend: 0.9,
        outline_width: 2.06,
        outline_intensity: 1000.85,
        enable_parallax_barrier: 1,
        enable_lenticular: 1,
        enable_volumetric_fog: 1,
        padding: [0; 41],
    };
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Shared handle to the active configuration.
///
/// The event thread edits fields under the lock; the render thread takes one
/// whole-struct snapshot per tick. An edit is therefore visible no later than the
/// next tick, and a tick never observes a half-applied edit.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<Mutex<EffectsConfig>>,
}

impl ConfigHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EffectsConfig::DEFAULT)),
        }
    }

    /// Copy of the current configuration, taken once per render tick.
    pub fn snapshot(&self) -> EffectsConfig {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an edit from the event thread.
    pub fn update(&self, edit: impl FnOnce(&mut EffectsConfig)) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        edit(&mut guard);
    }

    /// Restore the documented defaults (used after device recovery).
    pub fn reset_to_defaults(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = EffectsConfig::DEFAULT;
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_exactly_128_bytes() {
        assert_eq!(size_of::<EffectsConfig>(), 128);
        assert_eq!(bytemuck::bytes_of(&EffectsConfig::DEFAULT).len(), 128);
    }

    #[test]
    fn byte_round_trip_preserves_every_field() {
        let mut cfg = EffectsConfig::DEFAULT;
        cfg.time = 123.456;
        cfg.processing_quality = -7;
        cfg.enable_lenticular = 0;
        cfg.outline_intensity = f32::MIN_POSITIVE;

        let bytes = bytemuck::bytes_of(&cfg).to_vec();
        let back: EffectsConfig = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(bytemuck::bytes_of(&back), bytes.as_slice());

        let time = back.time;
        let quality = back.processing_quality;
        assert_eq!(time, 123.456);
        assert_eq!(quality, -7);
        assert_eq!(back.enable_lenticular, 0);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EffectsConfig::DEFAULT;
        let depth = cfg.depth_intensity;
        let alpha = cfg.alpha;
        let blend = cfg.temporal_blend;
        assert_eq!(depth, 1200.0);
        assert_eq!(alpha, 0.95);
        assert_eq!(blend, 0.9);
        let quality = cfg.processing_quality;
        assert_eq!(cfg.enable_volumetric_fog, 1);
        assert_eq!(quality, 3);
    }

    #[test]
    fn edits_are_visible_in_the_next_snapshot() {
        let handle = ConfigHandle::new();
        handle.update(|cfg| cfg.enable_parallax = 0);
        assert_eq!(handle.snapshot().enable_parallax, 0);

        let writer = handle.clone();
        std::thread::spawn(move || writer.update(|cfg| cfg.color_separation = 42.0))
            .join()
            .unwrap();
        let sep = handle.snapshot().color_separation;
        assert_eq!(sep, 42.0);
    }

    #[test]
    fn reset_discards_customization() {
        let handle = ConfigHandle::new();
        handle.update(|cfg| {
            cfg.fog_density = 1.0;
            cfg.enable_chromatic = 0;
        });
        handle.reset_to_defaults();
        let snap = handle.snapshot();
        let fog = snap.fog_density;
        assert_eq!(fog, 100.02);
        assert_eq!(snap.enable_chromatic, 1);
    }
}
