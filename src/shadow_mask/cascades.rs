use glam::Vec4;
use std::ops::Range;

use super::volume_cull::DepthClipSupport;
use super::{sun_cascade_range, MaskStage};
use crate::config::{ShadowQuality, StencilPrePass};
use crate::device::{params, RenderTarget, ShadowMapSource};
use crate::frame::ShadowFrame;
use crate::frustum::{FrustumType, ShadowFrustum, MAX_CASCADES};
use crate::light::{Light, LightFlags, LightId};
use crate::mesh::UnitVolume;
use crate::render_state::{
    BlendMode, ColorWrites, CullMode, DepthFunc, ShaderFlags, ShaderPass, ShadowGenPass, StateFlags, StencilFunc,
    StencilOp, StencilState, Technique,
};
use crate::stencil::StencilCullId;

/// Overlay colors of the cascade debug view, picked by `lod % 7`.
pub const DEBUG_CASCADE_PALETTE: [Vec4; 7] = [
    Vec4::new(1.0, 0.0, 0.0, 1.0),
    Vec4::new(0.0, 1.0, 0.0, 1.0),
    Vec4::new(0.0, 0.0, 1.0, 1.0),
    Vec4::new(1.0, 1.0, 0.0, 1.0),
    Vec4::new(1.0, 0.0, 1.0, 1.0),
    Vec4::new(0.0, 1.0, 1.0, 1.0),
    Vec4::new(1.0, 0.0, 0.0, 1.0),
];

/// What one deferred shadow pass draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassKind {
    /// Sample the shadow map into the mask.
    pub shadow: bool,
    /// Composite cloud shadows instead of a depth map.
    pub cloud: bool,
    /// Mark the frustum volume in the stencil buffer.
    pub stencil_prepass: bool,
}

impl PassKind {
    pub const PREPASS: PassKind = PassKind { shadow: false, cloud: false, stencil_prepass: true };
    pub const SHADOW: PassKind = PassKind { shadow: true, cloud: false, stencil_prepass: false };
    pub const CLOUDS: PassKind = PassKind { shadow: true, cloud: true, stencil_prepass: false };
}

/// Order in which the sun cascades are marked and sampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeMode {
    /// Two stencil ids per cascade so neighbouring cascades cross-fade.
    Blending,
    /// Mark every cascade nearest-last, then sample them all.
    Flat,
    /// Mark and sample each cascade with a fixed reference.
    PerCascade,
    /// Like [`CascadeMode::PerCascade`], leaving the cull function at `Always` only at the end.
    Interleaved,
}

impl CascadeMode {
    pub fn select(prepass: StencilPrePass, cascades: u32, first_blends: bool, debug: bool) -> Self {
        match prepass {
            StencilPrePass::Flat if cascades > 0 && first_blends && !debug => CascadeMode::Blending,
            StencilPrePass::Flat => CascadeMode::Flat,
            StencilPrePass::PerCascade => CascadeMode::PerCascade,
            StencilPrePass::Interleaved => CascadeMode::Interleaved,
        }
    }

    /// Stencil counter once the cascades are composited, so later users get fresh values.
    pub fn final_stencil_ref(self, cascades: u32) -> u32 {
        match self {
            CascadeMode::Blending => 2 * cascades + 1,
            _ => cascades,
        }
    }

    /// Fixed reference of cascade `offset` in the per-cascade schemes.
    pub fn fixed_reference(offset: u32) -> u8 {
        debug_assert!(offset < MAX_CASCADES);
        (MAX_CASCADES - offset.min(MAX_CASCADES - 1)) as u8
    }
}

impl MaskStage<'_> {
    /// Sets the quality permutation bits from the config and returns the quality.
    pub(super) fn apply_shadow_quality(&mut self) -> ShadowQuality {
        let quality = self.config.shadow_quality;
        self.ctx.shader_flags.remove(ShaderFlags::QUALITY_MASK);
        self.ctx.shader_flags.insert(quality.shader_flags());
        quality
    }

    /// Binds the shadow map of `frustum` and its tex-gen constants into `slot`.
    ///
    /// Frustums without a depth texture outside the pool are left unbound.
    pub(super) fn config_shadow_texgen(
        &mut self,
        slot: u32,
        frustum: &ShadowFrustum,
        side: u32,
        prev: Option<&ShadowFrustum>,
    ) {
        let source = match (frustum.use_shadow_pool, frustum.depth_texture) {
            (true, _) => ShadowMapSource::Pool,
            (false, Some(texture)) => ShadowMapSource::Depth(texture),
            (false, None) => return,
        };
        let name = if slot == 0 { params::SHADOW_TEX_GEN } else { params::SHADOW_TEX_GEN_HQ };
        self.device.set_matrix(name, &frustum.shadow_texgen(side));
        self.device.set_vector(
            params::SHADOW_PARAMS,
            Vec4::new(frustum.depth_const_bias, 1.0 / frustum.texture_size.max(1) as f32, frustum.lod as f32, 0.0),
        );
        self.device.bind_shadow_map(slot, source, slot == 0 && frustum.hw_pcf_compare);

        let cascade = !frustum.omni && !frustum.use_shadow_pool;
        if cascade && frustum.blend_frustum {
            let (blend, remap) = frustum.blend_params();
            let (prev_blend, prev_remap) = match prev {
                Some(prev) => {
                    self.device.set_matrix(params::PREV_SHADOW_TEX_GEN, &prev.shadow_texgen(0));
                    prev.blend_params()
                }
                None => (0.0, 0.0),
            };
            self.device.set_vector(params::BLEND_PARAMS, Vec4::new(blend, remap, prev_blend, prev_remap));
        }
    }

    fn stencil_reference(&self, id: StencilCullId) -> u8 {
        match id {
            StencilCullId::Mark(reference) => reference,
            _ => self.ctx.stencil_ref.reference(),
        }
    }

    /// Marks and/or samples one shadow frustum into the red channel of the bound target.
    pub fn deferred_shadow_pass(
        &mut self,
        light: &Light,
        frustum: &ShadowFrustum,
        prev: Option<&ShadowFrustum>,
        kind: PassKind,
        id: StencilCullId,
    ) {
        self.ctx.set_cull(self.device, CullMode::Back, true);

        let nearest = frustum.frustum_type == FrustumType::Nearest;
        if !nearest && !kind.cloud && (frustum.use_shadow_pool || frustum.depth_texture.is_none()) {
            log::trace!("Light {}: frustum has no cascade depth map, skipping", light.id.0);
            return;
        }
        if frustum.frustum_type == FrustumType::HeightMapAo {
            return;
        }

        let quality = self.apply_shadow_quality();
        let flags = &mut self.ctx.shader_flags;
        flags.remove(ShaderFlags::SHADOW_PASS_RESET);
        if !frustum.blend_frustum {
            flags.remove(ShaderFlags::SAMPLE3);
        }
        if self.config.shadow_jittering > 0.0 {
            flags.insert(ShaderFlags::SHADOW_JITTERING);
        }
        if frustum.hw_pcf_compare {
            flags.insert(ShaderFlags::HW_PCF_COMPARE);
        }
        if nearest {
            flags.insert(ShaderFlags::NEAREST);
        }
        if kind.cloud || (self.config.screen_space_shadows && kind.shadow && frustum.lod == 0) {
            flags.insert(ShaderFlags::SAMPLE2);
        }

        self.config_shadow_texgen(0, frustum, 0, prev);
        if quality == ShadowQuality::VeryHigh {
            self.config_shadow_texgen(1, frustum, 0, prev);
            self.ctx.shader_flags.insert(ShaderFlags::SAMPLE1);
        }

        let mut state = self.ctx.state();
        state.flags.remove(StateFlags::DEPTH_WRITE | StateFlags::DEPTH_TEST);
        state.blend = BlendMode::Opaque;
        if nearest {
            state.flags.insert(StateFlags::DEPTH_TEST);
            state.depth_func = DepthFunc::Greater;
        }
        if frustum.additive_blend {
            state.blend = BlendMode::AdditiveMax;
        } else if kind.shadow && frustum.blend_frustum {
            state.blend = BlendMode::Additive;
        }

        self.device.begin_technique(Technique::DeferredShadowPass, self.ctx.shader_flags);
        if kind.cloud {
            self.device.bind_shadow_map(0, ShadowMapSource::Clouds, false);
        }

        if kind.stencil_prepass {
            state.flags.insert(StateFlags::STENCIL);
            state.color_writes = ColorWrites::empty();
            self.ctx.set_state(self.device, state);

            self.device.set_matrix(params::UNIT_VOLUME_TO_WORLD, &frustum.light_view_proj.inverse());
            let clips = self.config.use_clip_volume && self.device.caps().depth_clip_control;
            self.stencil_cull_pass(
                id,
                UnitVolume::SimpleProjector,
                ShadowGenPass::StencilVolumeClip,
                DepthClipSupport::select(clips, ShadowGenPass::StencilVolumeClipFrontFacing),
            );

            if frustum.frustum_type.is_cached() && !frustum.contains_point(self.view.camera_position) {
                self.clear_in_front_of_frustum(id);
            }
        }

        if kind.shadow {
            state.flags.remove(StateFlags::STENCIL);
            state.color_writes = ColorWrites::R;
            let reference = self.stencil_reference(id);
            if reference != 0 && !kind.cloud {
                state.flags.insert(StateFlags::STENCIL);
                self.ctx.set_stencil_state(self.device, StencilState::keep(StencilFunc::Equal, reference));
            }
            self.ctx.set_state(self.device, state);

            let pass = if kind.cloud { ShadowGenPass::CloudsSeparate } else { ShadowGenPass::ShadowPass };
            self.device.begin_pass(pass.into());
            let depth = if nearest { self.config.draw_near_z_range - 0.001 } else { 0.0 };
            self.device.draw_fullscreen_triangle(depth);
            self.device.end_pass();
        }

        self.device.end_technique();
    }

    /// With the camera outside a cached frustum the front faces also cover unmarked
    /// pixels; zero the mark where they fail the depth test.
    fn clear_in_front_of_frustum(&mut self, id: StencilCullId) {
        let volume = UnitVolume::SimpleProjector;
        let Some(mesh) = self.meshes.handle(volume) else {
            return;
        };
        let pass = ShaderPass::from(ShadowGenPass::StencilVolumeClip);
        let prev_state = self.ctx.state();
        let prev_cull = self.ctx.cull_mode();

        self.device.begin_pass(pass);
        if self.bind_volume(pass, mesh, self.meshes.format(volume)) {
            let reference = self.stencil_reference(id);
            self.ctx.set_cull(self.device, CullMode::Back, false);
            self.ctx.set_stencil_state(
                self.device,
                StencilState::on_depth_fail(StencilFunc::Always, StencilOp::Zero, reference),
            );
            self.ctx.set_state(self.device, prev_state.stencil_mark());
            self.device.draw_indexed();
        }
        self.device.end_pass();

        self.ctx.restore_cull(self.device, prev_cull);
        self.ctx.set_state(self.device, prev_state);
    }

    fn frustum_pass(&mut self, frame: &ShadowFrame, light: &Light, index: usize, kind: PassKind, id: StencilCullId) {
        let Some(frustum) = frame.frustums.get(index) else {
            debug_assert!(false, "frustum index {index} out of range");
            return;
        };
        let prev = frustum.prev_frustum.and_then(|prev| frame.frustums.get(prev));
        self.deferred_shadow_pass(light, frustum, prev, kind, id);
    }

    /// Composites the sun: cascades, the debug overlay, cloud shadows and custom frustums.
    ///
    /// Returns `false` when the sun has nothing to draw.
    pub fn render_sun_shadows(&mut self, frame: &mut ShadowFrame, sun: LightId) -> bool {
        let Some(light) = frame.light(sun).cloned() else {
            return false;
        };
        if !light.casts_shadows() {
            return false;
        }

        let basis = self.view.screen_to_world_basis();
        self.device.set_constants(params::SCREEN_TO_WORLD_BASIS, &basis);

        let cascades = sun_cascade_range(frame, sun);
        let count = cascades.len() as u32;
        if count == 0 && !frame.cloud_shadows && frame.custom_frustums.is_empty() {
            return false;
        }

        let saved = self.ctx.snapshot();
        let first_blends = frame.frustums.get(cascades.start).is_some_and(|frustum| frustum.blend_frustum);
        let mode = CascadeMode::select(self.config.stencil_prepass, count, first_blends, self.config.cascades_debug);
        log::trace!(
            "Sun shadows: {count} cascades, {mode:?} ({} prepass)",
            self.config.stencil_prepass.label()
        );

        match mode {
            CascadeMode::Blending => self.blend_cascades(frame, &light, cascades.clone()),
            CascadeMode::Flat => {
                self.ctx.stencil_cull_func = StencilFunc::GreaterEqual;
                for (offset, index) in cascades.clone().enumerate() {
                    let id = StencilCullId::Mark((count - offset as u32) as u8);
                    self.frustum_pass(frame, &light, index, PassKind::PREPASS, id);
                }
                self.ctx.stencil_cull_func = StencilFunc::Always;
                for (offset, index) in cascades.clone().enumerate() {
                    let id = StencilCullId::Mark((count - offset as u32) as u8);
                    self.frustum_pass(frame, &light, index, PassKind::SHADOW, id);
                }
            }
            CascadeMode::PerCascade => {
                for (offset, index) in cascades.clone().enumerate() {
                    let id = StencilCullId::Mark(CascadeMode::fixed_reference(offset as u32));
                    self.ctx.stencil_cull_func = StencilFunc::GreaterEqual;
                    self.frustum_pass(frame, &light, index, PassKind::PREPASS, id);
                    self.ctx.stencil_cull_func = StencilFunc::Always;
                    self.frustum_pass(frame, &light, index, PassKind::SHADOW, id);
                }
            }
            CascadeMode::Interleaved => {
                for (offset, index) in cascades.clone().enumerate() {
                    let id = StencilCullId::Mark(CascadeMode::fixed_reference(offset as u32));
                    self.ctx.stencil_cull_func = StencilFunc::GreaterEqual;
                    self.frustum_pass(frame, &light, index, PassKind::PREPASS, id);
                    self.frustum_pass(frame, &light, index, PassKind::SHADOW, id);
                }
                self.ctx.stencil_cull_func = StencilFunc::Always;
            }
        }
        self.ctx.stencil_ref.set(mode.final_stencil_ref(count));

        if light.flags.contains(LightFlags::SUN) && self.config.cascades_debug {
            self.debug_cascades(frame, cascades);
        }

        if frame.cloud_shadows {
            self.deferred_shadow_pass(&light, &ShadowFrustum::clouds(), None, PassKind::CLOUDS, StencilCullId::Mark(0));
        }

        for &index in &frame.custom_frustums {
            let Some(frustum) = frame.frustums.get(index) else {
                continue;
            };
            let nearest = frustum.frustum_type == FrustumType::Nearest;
            if !nearest {
                self.frustum_pass(frame, &light, index, PassKind::PREPASS, StencilCullId::Volume);
            }
            let reference = if nearest { 0 } else { self.ctx.stencil_ref.reference() };
            let id = StencilCullId::Mark(reference);
            self.frustum_pass(frame, &light, index, PassKind::SHADOW, id);
        }

        self.ctx.restore(self.device, saved);
        true
    }

    /// Cascade `i` owns stencil ids `2i + 1` (blend band) and `2i + 2` (interior).
    fn blend_cascades(&mut self, frame: &mut ShadowFrame, light: &Light, cascades: Range<usize>) {
        for index in cascades.start + 1..cascades.end {
            frame.frustums[index].prev_frustum = Some(index - 1);
        }

        let count = cascades.len() as u32;
        let invalidated = StencilCullId::Mark((2 * count + 1) as u8);
        for (offset, index) in cascades.clone().enumerate() {
            let first = index == cascades.start;
            let last = index + 1 == cascades.end;
            let band = (2 * offset + 1) as u8;
            let interior = band + 1;

            self.ctx.stencil_cull_func = StencilFunc::GreaterEqual;
            self.ctx.shader_flags.remove(ShaderFlags::SAMPLE3);
            self.frustum_pass(frame, light, index, PassKind::PREPASS, StencilCullId::Mark(band));

            if !last {
                self.ctx.shader_flags.insert(ShaderFlags::SAMPLE3);
                self.frustum_pass(frame, light, index, PassKind::PREPASS, StencilCullId::Mark(interior));
                if !first {
                    self.ctx.shader_flags.remove(ShaderFlags::SAMPLE3);
                    self.frustum_pass(frame, light, index - 1, PassKind::PREPASS, StencilCullId::Mark(interior));
                }
            }

            self.ctx.shader_flags.remove(ShaderFlags::SAMPLE3);
            let solid = if last { band } else { interior };
            self.frustum_pass(frame, light, index, PassKind::SHADOW, StencilCullId::Mark(solid));

            if !last {
                self.ctx.shader_flags.insert(ShaderFlags::SAMPLE3);
                self.frustum_pass(frame, light, index, PassKind::SHADOW, StencilCullId::Mark(band));
            }

            self.ctx.shader_flags.insert(ShaderFlags::SAMPLE3);
            self.ctx.stencil_cull_func = StencilFunc::Always;
            if !last {
                self.frustum_pass(frame, light, index, PassKind::PREPASS, invalidated);
            }

            self.ctx.shader_flags.remove(ShaderFlags::SAMPLE3);
            if !first && !last {
                self.frustum_pass(frame, light, index - 1, PassKind::PREPASS, invalidated);
            }
        }

        for frustum in &mut frame.frustums[cascades] {
            frustum.prev_frustum = None;
        }
    }

    /// Tints each cascade's stencil region in the scene diffuse target.
    fn debug_cascades(&mut self, frame: &ShadowFrame, cascades: Range<usize>) {
        let count = cascades.len() as u32;
        self.device.push_render_target(RenderTarget::SceneDiffuse);
        let prev_state = self.ctx.state();
        let mut state = prev_state;
        state.flags.insert(StateFlags::STENCIL);
        state.color_writes = ColorWrites::all();
        self.ctx.set_state(self.device, state);

        for (offset, frustum) in frame.frustums[cascades].iter().enumerate() {
            let color = DEBUG_CASCADE_PALETTE[frustum.lod as usize % DEBUG_CASCADE_PALETTE.len()];
            let reference = (count - offset as u32) as u8;
            self.ctx.set_stencil_state(self.device, StencilState::keep(StencilFunc::Equal, reference));
            self.device.begin_technique(Technique::DebugShadowCascades, self.ctx.shader_flags);
            self.device.begin_pass(ShaderPass::Main);
            self.device.set_vector(params::DEBUG_CASCADE_COLOR, color);
            self.device.draw_fullscreen_triangle(0.0);
            self.device.end_pass();
            self.device.end_technique();
        }

        self.ctx.set_state(self.device, prev_state);
        self.device.pop_render_target();
    }
}
