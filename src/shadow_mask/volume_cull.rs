use glam::{Mat4, Quat, Vec3, Vec4};

use super::MaskStage;
use crate::config::DebugLightVolumes;
use crate::device::{params, MeshHandle};
use crate::frustum::{light_frustum, ShadowFrustum};
use crate::light::{Light, LightShape};
use crate::mesh::UnitVolume;
use crate::render_state::{
    BlendMode, ColorWrites, CullMode, DepthFunc, ShaderPass, ShadowGenPass, StateFlags, StencilFunc, StencilOp,
    StencilState, Technique, VertexFormat,
};
use crate::stencil::StencilCullId;

/// Light volumes are grown slightly so the stencil mark covers the lit region's edge.
const VOLUME_EXPANSION: f32 = 1.08;
const LIGHT_RADIUS_EXPANSION: f32 = 1.1;
/// Field of view of the offset frustum used for reversed projectors.
const REVERSED_PROJECTOR_FOV_DEG: f32 = 160.0;

/// Bits of the resolved stencil value the non-convex resolve shader understands.
const STENCIL_STATIC_BITS: u8 = 0x7F;
const STENCIL_INSIDE_VOLUME: u8 = 0x40;

/// How the back faces of a volume avoid being clipped by the far plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthClipSupport {
    /// Rasterizer depth clipping is switched off for the back-face draw.
    Supported,
    /// The back-face pass clamps to the far plane in the vertex stage; front faces
    /// need their own pass.
    Unsupported { front_pass: ShaderPass },
}

impl DepthClipSupport {
    pub fn select(device_clips: bool, front_pass: impl Into<ShaderPass>) -> Self {
        if device_clips {
            DepthClipSupport::Supported
        } else {
            DepthClipSupport::Unsupported { front_pass: front_pass.into() }
        }
    }
}

/// Watertight mesh whose inside gets marked with `!id`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NonConvexVolume {
    pub id: u8,
    pub mesh: MeshHandle,
    pub format: VertexFormat,
    pub world: Mat4,
}

/// Stencil value the resolve pass writes for an inverted non-convex mark.
pub fn resolved_stencil_value(id: u8) -> f32 {
    let inverted = !id & STENCIL_STATIC_BITS;
    let resolved = inverted.saturating_sub(STENCIL_INSIDE_VOLUME).max(1);
    resolved as f32 / 255.0
}

impl MaskStage<'_> {
    /// Binds the stencil-marking state for back faces and picks the reference for `id`.
    pub fn set_back_facing_stencil_state(&mut self, id: StencilCullId) {
        let mut state = self.ctx.state();
        match self.config.debug_light_volumes {
            DebugLightVolumes::Off => {
                state = state.stencil_mark();
            }
            debug => {
                state.flags.insert(StateFlags::DEPTH_TEST | StateFlags::DEPTH_WRITE);
                state.color_writes = ColorWrites::all();
                if debug == DebugLightVolumes::Wireframe {
                    state.flags.insert(StateFlags::WIREFRAME);
                }
            }
        }

        let (func, reference) = match id {
            StencilCullId::Mark(reference) => (self.ctx.stencil_cull_func, reference),
            StencilCullId::Shrink => {
                let reference = self.ctx.stencil_ref.reference();
                self.ctx.stencil_ref.decrement();
                (StencilFunc::Equal, reference)
            }
            StencilCullId::LegacyLequal => {
                self.ctx.stencil_ref.decrement();
                (StencilFunc::LessEqual, self.ctx.stencil_ref.reference())
            }
            StencilCullId::LegacyGequal => {
                self.ctx.stencil_ref.decrement();
                (StencilFunc::GreaterEqual, self.ctx.stencil_ref.reference())
            }
            StencilCullId::Volume => (StencilFunc::GreaterEqual, self.ctx.next_volume_ref(self.device)),
        };
        debug_assert!(
            matches!(id, StencilCullId::Mark(_)) || reference > 0,
            "stencil reference must stay positive for {id:?}"
        );
        let depth_fail = if id == StencilCullId::Shrink { StencilOp::DecrSat } else { StencilOp::Replace };

        self.ctx.set_cull(self.device, CullMode::Front, false);
        self.ctx.set_stencil_state(self.device, StencilState::on_depth_fail(func, depth_fail, reference));
        self.ctx.set_state(self.device, state);
    }

    /// Front faces clear the mark where the volume lies in front of the scene.
    pub fn set_front_facing_stencil_state(&mut self, id: StencilCullId) {
        if !id.uses_front_faces() {
            return;
        }
        self.ctx.set_cull(self.device, CullMode::Back, false);
        let func = self.ctx.stencil_state().func;
        let reference = self.ctx.stencil_ref.reference();
        self.ctx.set_stencil_state(self.device, StencilState::on_depth_fail(func, StencilOp::Zero, reference));
    }

    /// Marks the pixels inside `volume` in the stencil buffer.
    ///
    /// The volume transform must already be bound as `UnitVolumeToWorld`.
    pub fn stencil_cull_pass(
        &mut self,
        id: StencilCullId,
        volume: UnitVolume,
        back_pass: impl Into<ShaderPass>,
        clip: DepthClipSupport,
    ) {
        let back_pass = back_pass.into();
        let Some(mesh) = self.meshes.handle(volume) else {
            log::warn!("No unit mesh for {volume:?}; skipping stencil cull");
            return;
        };
        let format = self.meshes.format(volume);
        let prev_cull = self.ctx.cull_mode();
        let prev_state = self.ctx.state();

        self.device.begin_pass(back_pass);
        if !self.bind_volume(back_pass, mesh, format) {
            self.device.end_pass();
            return;
        }
        self.set_back_facing_stencil_state(id);

        match clip {
            DepthClipSupport::Supported => {
                let prev_clip = self.ctx.depth_clip();
                self.ctx.set_depth_clip(self.device, false);
                self.device.draw_indexed();
                self.ctx.set_depth_clip(self.device, prev_clip);

                if id.uses_front_faces() {
                    self.set_front_facing_stencil_state(id);
                    self.device.draw_indexed();
                }
                self.device.end_pass();
            }
            DepthClipSupport::Unsupported { front_pass } => {
                self.device.draw_indexed();
                self.device.end_pass();

                if id.uses_front_faces() {
                    self.device.begin_pass(front_pass);
                    if self.bind_volume(front_pass, mesh, format) {
                        self.set_front_facing_stencil_state(id);
                        self.device.draw_indexed();
                    }
                    self.device.end_pass();
                }
            }
        }

        self.ctx.restore_cull(self.device, prev_cull);
        self.ctx.set_state(self.device, prev_state);
    }

    pub(super) fn bind_volume(&mut self, pass: ShaderPass, mesh: MeshHandle, format: VertexFormat) -> bool {
        let bound = self.device.bind_vertex_format(format).and_then(|()| self.device.bind_mesh(mesh));
        match bound {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Skipping volume draw for pass {pass:?}: {err}");
                false
            }
        }
    }

    /// Marks the volume of `light`, or of one side of `frustum` when given.
    pub fn stencil_frustum_cull(
        &mut self,
        id: StencilCullId,
        light: &Light,
        frustum: Option<&ShadowFrustum>,
        side: u32,
    ) {
        let device_clips = self.device.caps().depth_clip_control;
        let reversed = light.projector_near_plane < 0.0;
        let offset = if reversed { light.direction() * -light.projector_near_plane } else { Vec3::ZERO };
        let position = light.position - offset;

        let view_proj = match frustum {
            Some(frustum) => frustum.face_view_proj(side),
            None if reversed => light_frustum(
                position,
                light.direction(),
                light.radius - light.projector_near_plane,
                REVERSED_PROJECTOR_FOV_DEG,
            ),
            None if light.shape() == LightShape::Projector && !light.projector_texture_replicated => {
                light_frustum(position, light.direction(), light.radius, light.frustum_angle_deg * 2.0)
            }
            None => {
                self.stencil_volume_cull(id, light, device_clips);
                return;
            }
        };
        let primitive = match (reversed, self.ctx.deferred_primitive) {
            (false, primitive) => primitive,
            (true, UnitVolume::Projector(lod)) => UnitVolume::ClipProjector(lod),
            (true, _) => UnitVolume::ClipProjector(0),
        };

        self.device.set_matrix(params::UNIT_VOLUME_TO_WORLD, &view_proj.inverse());
        self.device.set_vector(params::LIGHT_POS_RADIUS, position.extend(light.radius * LIGHT_RADIUS_EXPANSION));
        self.device.begin_technique(Technique::DeferredShadowPass, self.ctx.shader_flags);
        self.stencil_cull_pass(
            id,
            primitive,
            ShadowGenPass::ShadowFrustumCullPass,
            DepthClipSupport::select(device_clips, ShadowGenPass::ShadowFrustumCullPassFrontFacing),
        );
        self.device.end_technique();
    }

    /// Sphere or box around a light without a usable frustum.
    fn stencil_volume_cull(&mut self, id: StencilCullId, light: &Light, device_clips: bool) {
        let scale = Vec3::splat(light.radius * VOLUME_EXPANSION);
        let (volume, world) = match light.shape() {
            LightShape::Area if self.config.area_lights => (UnitVolume::Box, light.area_light_matrix(scale)),
            LightShape::DeferredCubemap => (UnitVolume::Box, light.probe_box_matrix()),
            _ => (UnitVolume::Sphere, Mat4::from_scale_rotation_translation(scale, Quat::IDENTITY, light.position)),
        };
        let id = if id == StencilCullId::Shrink { StencilCullId::Shrink } else { StencilCullId::Volume };

        self.device.set_matrix(params::UNIT_VOLUME_TO_WORLD, &world);
        self.device.begin_technique(Technique::DeferredShadowPass, self.ctx.shader_flags);
        self.stencil_cull_pass(
            id,
            volume,
            ShadowGenPass::ShadowCullPass,
            DepthClipSupport::select(device_clips, ShadowGenPass::ShadowCullPassFrontFacing),
        );
        self.device.end_technique();
    }

    /// Marks the inside of an arbitrary watertight mesh.
    ///
    /// Pixels inside end up holding `!id`. Without stencil texture sampling the mark is
    /// also resolved into the red channel of the bound target. Frames never carry these
    /// volumes; callers reach this through [`ShadowMaskPipeline::mark_non_convex_volume`].
    ///
    /// [`ShadowMaskPipeline::mark_non_convex_volume`]: crate::shadow_mask::ShadowMaskPipeline::mark_non_convex_volume
    pub fn stencil_cull_non_convex(&mut self, id: u8, mesh: MeshHandle, format: VertexFormat, world: &Mat4) {
        let prev_cull = self.ctx.cull_mode();
        let prev_state = self.ctx.state();
        let inverted = !id;

        let mut state = prev_state.stencil_mark();
        state.blend = BlendMode::Opaque;
        self.device.set_matrix(params::UNIT_VOLUME_TO_WORLD, world);
        self.device.begin_technique(Technique::DeferredShadowPass, self.ctx.shader_flags);

        let pass = ShaderPass::from(ShadowGenPass::ShadowCullPass);
        self.device.begin_pass(pass);
        if self.bind_volume(pass, mesh, format) {
            self.ctx.restore_cull(self.device, CullMode::Front);
            self.ctx.set_stencil_state(
                self.device,
                StencilState::on_depth_fail(StencilFunc::GreaterEqual, StencilOp::Replace, id),
            );
            self.ctx.set_state(self.device, state);
            self.device.draw_indexed();

            self.ctx.restore_cull(self.device, CullMode::None);
            self.ctx.set_stencil_state(
                self.device,
                StencilState::on_depth_fail(StencilFunc::GreaterEqual, StencilOp::Invert, inverted),
            );
            self.device.draw_indexed();
        }
        self.device.end_pass();

        if !self.device.caps().stencil_texture_sampling {
            let resolve = ShaderPass::from(ShadowGenPass::StencilCullNonConvexResolve);
            self.device.begin_pass(resolve);
            if self.bind_volume(resolve, mesh, format) {
                let resolved = Vec4::new(resolved_stencil_value(id), 1.0, 0.0, 0.0);
                self.device.set_vector(params::STENCIL_REF_RESOLVE, resolved);
                let mut resolve_state = state;
                resolve_state.flags.insert(StateFlags::DEPTH_TEST | StateFlags::STENCIL);
                resolve_state.depth_func = DepthFunc::Greater;
                resolve_state.color_writes = ColorWrites::R;
                self.ctx.set_state(self.device, resolve_state);
                self.ctx.set_stencil_state(self.device, StencilState::keep(StencilFunc::Equal, inverted));
                self.device.draw_indexed();
            }
            self.device.end_pass();
        }
        self.device.end_technique();

        self.ctx.restore_cull(self.device, prev_cull);
        self.ctx.set_state(self.device, prev_state);
    }

    /// Restricts drawing to pixels whose stencil equals the current reference.
    pub fn stencil_test_cur_ref(&mut self, equal: bool) {
        self.ctx.stencil_test_current_ref(self.device, equal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_value_drops_inside_bit() {
        // !0x05 = 0xFA, & 0x7F = 0x7A, - 0x40 = 0x3A
        assert!((resolved_stencil_value(0x05) - 0x3A as f32 / 255.0).abs() < 1e-6);
        // !0x7F & 0x7F = 0 -> clamped to 1
        assert!((resolved_stencil_value(0x7F) - 1.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn clip_support_selection() {
        let supported = DepthClipSupport::select(true, ShadowGenPass::ShadowCullPassFrontFacing);
        assert_eq!(supported, DepthClipSupport::Supported);
        assert_eq!(
            DepthClipSupport::select(false, ShadowGenPass::ShadowCullPassFrontFacing),
            DepthClipSupport::Unsupported { front_pass: ShadowGenPass::ShadowCullPassFrontFacing.into() }
        );
    }
}
