use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::render_state::ShaderFlags;

/// Stencil prepass scheme for the sun cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StencilPrePass {
    /// Mark and sample each cascade in turn with a fixed per-cascade reference.
    PerCascade,
    /// Mark every cascade first, then sample them all. Enables cascade blending.
    #[default]
    Flat,
    /// Mark and sample each cascade in turn, leaving the cull function at `Always`.
    Interleaved,
}

impl StencilPrePass {
    pub fn label(self) -> &'static str {
        match self {
            StencilPrePass::PerCascade => "Per cascade",
            StencilPrePass::Flat => "Flat (blending)",
            StencilPrePass::Interleaved => "Interleaved",
        }
    }

    /// Maps the legacy numeric setting (0, 1, 2).
    pub fn from_level(level: u32) -> Option<Self> {
        match level {
            0 => Some(StencilPrePass::PerCascade),
            1 => Some(StencilPrePass::Flat),
            2 => Some(StencilPrePass::Interleaved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShadowQuality {
    Low,
    Medium,
    #[default]
    High,
    VeryHigh,
}

impl ShadowQuality {
    pub fn shader_flags(self) -> ShaderFlags {
        match self {
            ShadowQuality::Low => ShaderFlags::empty(),
            ShadowQuality::Medium => ShaderFlags::QUALITY,
            ShadowQuality::High => ShaderFlags::QUALITY1,
            ShadowQuality::VeryHigh => ShaderFlags::QUALITY | ShaderFlags::QUALITY1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DebugLightVolumes {
    #[default]
    Off,
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowMaskConfig {
    #[serde(default = "ShadowMaskConfig::default_shadow_passes")]
    pub shadow_passes: bool,
    #[serde(default)]
    pub stencil_prepass: StencilPrePass,
    #[serde(default)]
    pub cascades_debug: bool,
    #[serde(default)]
    pub screen_space_shadows: bool,
    #[serde(default)]
    pub shadow_jittering: f32,
    #[serde(default)]
    pub shadow_quality: ShadowQuality,
    #[serde(default = "ShadowMaskConfig::default_use_clip_volume")]
    pub use_clip_volume: bool,
    #[serde(default = "ShadowMaskConfig::default_scissor")]
    pub deferred_shading_scissor: bool,
    #[serde(default = "ShadowMaskConfig::default_light_volumes")]
    pub light_volumes: bool,
    #[serde(default = "ShadowMaskConfig::default_area_lights")]
    pub area_lights: bool,
    #[serde(default)]
    pub debug_light_volumes: DebugLightVolumes,
    #[serde(default = "ShadowMaskConfig::default_mask_slices")]
    pub mask_slices: u32,
    #[serde(default = "ShadowMaskConfig::default_shadow_pool_size")]
    pub shadow_pool_size: u32,
    #[serde(default = "ShadowMaskConfig::default_draw_near_z_range")]
    pub draw_near_z_range: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ShadowMaskOverrides {
    pub stencil_prepass: Option<StencilPrePass>,
    pub mask_slices: Option<u32>,
    pub cascades_debug: Option<bool>,
}

impl ShadowMaskConfig {
    const fn default_shadow_passes() -> bool {
        true
    }

    const fn default_use_clip_volume() -> bool {
        true
    }

    const fn default_scissor() -> bool {
        true
    }

    const fn default_light_volumes() -> bool {
        true
    }

    const fn default_area_lights() -> bool {
        true
    }

    const fn default_mask_slices() -> u32 {
        2
    }

    const fn default_shadow_pool_size() -> u32 {
        4096
    }

    const fn default_draw_near_z_range() -> f32 {
        0.12
    }

    /// Channels available to pooled lights and the sun together.
    pub fn channel_budget(&self) -> u32 {
        self.mask_slices.saturating_mul(4)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read shadow mask config {}", path.display()))?;
        let mut cfg: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse shadow mask config {}", path.display()))?;
        cfg.mask_slices = cfg.mask_slices.max(1);
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Shadow mask config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ShadowMaskOverrides) {
        if let Some(prepass) = overrides.stencil_prepass {
            self.stencil_prepass = prepass;
        }
        if let Some(slices) = overrides.mask_slices {
            self.mask_slices = slices.max(1);
        }
        if let Some(debug) = overrides.cascades_debug {
            self.cascades_debug = debug;
        }
    }
}

impl Default for ShadowMaskConfig {
    fn default() -> Self {
        Self {
            shadow_passes: Self::default_shadow_passes(),
            stencil_prepass: StencilPrePass::default(),
            cascades_debug: false,
            screen_space_shadows: false,
            shadow_jittering: 0.0,
            shadow_quality: ShadowQuality::default(),
            use_clip_volume: Self::default_use_clip_volume(),
            deferred_shading_scissor: Self::default_scissor(),
            light_volumes: Self::default_light_volumes(),
            area_lights: Self::default_area_lights(),
            debug_light_volumes: DebugLightVolumes::default(),
            mask_slices: Self::default_mask_slices(),
            shadow_pool_size: Self::default_shadow_pool_size(),
            draw_near_z_range: Self::default_draw_near_z_range(),
        }
    }
}

impl ShadowMaskOverrides {
    pub fn is_empty(&self) -> bool {
        self.stencil_prepass.is_none() && self.mask_slices.is_none() && self.cascades_debug.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.stencil_prepass.is_some() {
            fields.push("stencil_prepass");
        }
        if self.mask_slices.is_some() {
            fields.push("mask_slices");
        }
        if self.cascades_debug.is_some() {
            fields.push("cascades_debug");
        }
        fields
    }
}
