use glam::{Mat4, Vec3, Vec4};

use super::{ChannelAssignment, LightVolumePolicy, MaskStage};
use crate::context::PersFlags;
use crate::device::{params, RenderTarget};
use crate::frame::ShadowFrame;
use crate::frustum::ShadowFrustum;
use crate::light::{Light, LightId, LightShape, ScissorRect};
use crate::mesh::UnitVolume;
use crate::render_state::{
    BlendMode, ColorWrites, CullMode, DepthFunc, ShaderFlags, ShaderPass, StateFlags, Technique,
};
use crate::stencil::StencilCullId;

const OMNI_KERNEL_SIZE: f32 = 2.5;
const PROJECTOR_KERNEL_SIZE: f32 = 1.5;
const AREA_VOLUME_EXPANSION: f32 = 1.08;
const SPHERE_ADJUST_EXPANSION: f32 = 1.1;

/// How one light side is shaded into its mask channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShadingTechnique {
    /// Draw the light's bounding volume, depth tested against the scene.
    LightVolume { volume: UnitVolume, to_world: Mat4, sphere_adjust: Vec4 },
    /// Fullscreen triangle limited by the stencil mark.
    Fullscreen,
}

impl ShadingTechnique {
    pub fn select(
        light: &Light,
        frustum: &ShadowFrustum,
        side: u32,
        use_light_volumes: bool,
        primitive: UnitVolume,
    ) -> Self {
        if !use_light_volumes {
            return ShadingTechnique::Fullscreen;
        }
        if light.shape() == LightShape::Area {
            let scale = Vec3::splat(light.radius * AREA_VOLUME_EXPANSION);
            return ShadingTechnique::LightVolume {
                volume: UnitVolume::Box,
                to_world: light.area_light_matrix(scale),
                sphere_adjust: Vec4::ZERO,
            };
        }
        ShadingTechnique::LightVolume {
            volume: primitive,
            to_world: frustum.face_view_proj(side).inverse(),
            sphere_adjust: light.position.extend(light.radius * SPHERE_ADJUST_EXPANSION),
        }
    }

    pub fn technique(&self) -> Technique {
        match self {
            ShadingTechnique::LightVolume { .. } => Technique::ShadowMaskGenVolume,
            ShadingTechnique::Fullscreen => Technique::ShadowMaskGen,
        }
    }
}

/// Shadow tex-gen relative to the camera, with depth pre-divided by the far plane.
pub fn light_shadow_projection(texgen: Mat4, camera_position: Vec3, far_plane: f32) -> Mat4 {
    let depth_scale = Mat4::from_scale(Vec3::new(1.0, 1.0, 1.0 / far_plane.max(f32::EPSILON)));
    depth_scale * texgen * Mat4::from_translation(camera_position)
}

impl MaskStage<'_> {
    /// Renders every packed light into its channel. Returns the number of shaded sides.
    pub fn composite_channels(
        &mut self,
        frame: &mut ShadowFrame,
        assignment: &ChannelAssignment,
        policy: &dyn LightVolumePolicy,
    ) -> u32 {
        let mut shaded = 0;
        for channel in assignment.active_channels() {
            if channel > 0 && channel % 4 == 0 {
                self.device.pop_render_target();
                self.device.push_render_target(RenderTarget::ShadowMaskSlice(channel / 4));
            }
            for &(id, rect) in assignment.channel(channel) {
                shaded += self.composite_light(frame, id, rect, channel, policy);
            }
        }
        shaded
    }

    fn composite_light(
        &mut self,
        frame: &mut ShadowFrame,
        id: LightId,
        rect: ScissorRect,
        channel: u32,
        policy: &dyn LightVolumePolicy,
    ) -> u32 {
        let (Some(light), Some(first)) = (frame.light(id).cloned(), frame.first_frustum(id).cloned()) else {
            debug_assert!(false, "packed light {} has no frustum", id.0);
            return 0;
        };

        self.ctx.deferred_primitive = UnitVolume::Projector(0);
        let sides = first.side_count();
        if first.hw_pcf_compare {
            self.ctx.shader_flags.insert(ShaderFlags::HW_PCF_COMPARE);
        }
        let use_light_volumes = policy.use_light_volumes(&light, &self.view);

        self.ctx.reserve_stencil_refs(self.device, sides);
        if self.config.deferred_shading_scissor {
            self.ctx.set_scissor(self.device, Some(rect.scaled(self.view.downscale)));
        }

        let area = light.shape() == LightShape::Area;
        let pers_flags = self.ctx.pers_flags;
        let mut shaded = 0;
        for side in 0..sides {
            // omni volumes flip winding; inside a mirrored view the two cancel out
            let mirrored = pers_flags.contains(PersFlags::MIRROR_CULL) ^ light.requires_mirror_cull();
            self.ctx.pers_flags.set(PersFlags::MIRROR_CULL, mirrored);

            self.stencil_frustum_cull(StencilCullId::LegacyGequal, &light, (!area).then_some(&first), side);
            self.stencil_test_cur_ref(true);

            if first.renders_side(side) {
                self.shade_side(&light, &first, side, channel, use_light_volumes);
                shaded += 1;
            }
            self.ctx.pers_flags = pers_flags;
        }

        if let Some(light) = frame.light_mut(id) {
            light.mask_channel = Some(channel % 4);
            light.mask_slice = Some(channel / 4);
        }
        self.ctx.set_scissor(self.device, None);
        self.ctx.stencil_ref.release(sides);
        self.ctx.shader_flags.remove(ShaderFlags::HW_PCF_COMPARE | ShaderFlags::CUBEMAP0 | ShaderFlags::SAMPLE2);
        shaded
    }

    fn shade_side(
        &mut self,
        light: &Light,
        frustum: &ShadowFrustum,
        side: u32,
        channel: u32,
        use_light_volumes: bool,
    ) {
        self.apply_shadow_quality();
        self.config_shadow_texgen(0, frustum, side, None);
        if self.config.screen_space_shadows {
            self.ctx.shader_flags.insert(ShaderFlags::SAMPLE2);
        }

        let shading = ShadingTechnique::select(light, frustum, side, use_light_volumes, self.ctx.deferred_primitive);
        if let ShadingTechnique::LightVolume { .. } = shading {
            self.ctx.shader_flags.insert(ShaderFlags::CUBEMAP0);
        }
        log::trace!("Light {} side {side}: channel {channel} via {}", light.id.0, shading.technique().name());
        self.device.begin_technique(shading.technique(), self.ctx.shader_flags);
        self.device.begin_pass(ShaderPass::Main);

        let pool_size = self.config.shadow_pool_size.max(1) as f32;
        let texture_size = frustum.texture_size as f32;
        let kernel = if frustum.omni { OMNI_KERNEL_SIZE } else { PROJECTOR_KERNEL_SIZE };
        self.device.set_vector(
            params::GENERAL_PARAMS,
            Vec4::new(kernel * texture_size / pool_size, texture_size, 1.0 / pool_size, frustum.depth_const_bias),
        );
        let projection =
            light_shadow_projection(frustum.shadow_texgen(side), self.view.camera_position, frustum.far_plane);
        self.device.set_matrix(params::LIGHT_SHADOW_PROJ, &projection);
        let (width, height) = self.view.mask_size;
        self.device.set_vector(
            params::SCREEN_SCALE,
            Vec4::new(1.0 / width.max(1) as f32, 1.0 / height.max(1) as f32, 0.0, 0.0),
        );
        self.device.set_vector(params::LIGHT_POS, light.position.extend(0.0));

        let mut state = self.ctx.state();
        state.color_writes = ColorWrites::channel(channel);
        state.blend = BlendMode::Opaque;
        match shading {
            ShadingTechnique::LightVolume { volume, to_world, sphere_adjust } => {
                state.flags.remove(StateFlags::DEPTH_WRITE);
                state.flags.insert(StateFlags::DEPTH_TEST);
                state.depth_func = DepthFunc::LessEqual;
                self.ctx.set_state(self.device, state);
                self.draw_light_volume(volume, &to_world, sphere_adjust);
            }
            ShadingTechnique::Fullscreen => {
                state.flags.remove(StateFlags::DEPTH_WRITE | StateFlags::DEPTH_TEST);
                self.ctx.set_state(self.device, state);
                self.ctx.pers_flags.remove(PersFlags::MIRROR_CULL);
                self.ctx.set_cull(self.device, CullMode::Back, true);
                self.device.draw_fullscreen_triangle(0.0);
            }
        }

        self.device.end_pass();
        self.device.end_technique();
    }

    fn draw_light_volume(&mut self, volume: UnitVolume, to_world: &Mat4, sphere_adjust: Vec4) {
        let Some(mesh) = self.meshes.handle(volume) else {
            log::warn!("No unit mesh for {volume:?}; skipping light volume");
            return;
        };
        if !self.bind_volume(ShaderPass::Main, mesh, self.meshes.format(volume)) {
            return;
        }
        let basis = self.view.screen_to_world_basis();
        self.device.set_constants(params::SCREEN_TO_WORLD_BASIS, &basis);
        self.device.set_matrix(params::UNIT_VOLUME_TO_WORLD, to_world);
        self.device.set_vector(params::SPHERE_ADJUST, sphere_adjust);
        self.device.set_matrix(params::VIEW_PROJ, &self.view.view_proj);
        self.device.draw_indexed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::LightFlags;

    #[test]
    fn fullscreen_unless_volumes_requested() {
        let light = Light::new(LightId(0), Vec3::ZERO, 2.0);
        let frustum = ShadowFrustum::omni(Vec3::ZERO, 0.1, 2.0);
        let shading = ShadingTechnique::select(&light, &frustum, 0, false, UnitVolume::Projector(0));
        assert_eq!(shading, ShadingTechnique::Fullscreen);
        assert_eq!(shading.technique(), Technique::ShadowMaskGen);
    }

    #[test]
    fn area_lights_use_the_box() {
        let mut light = Light::new(LightId(0), Vec3::ZERO, 2.0).with_flags(LightFlags::AREA);
        light.area_width = 1.0;
        light.area_height = 1.0;
        let frustum = ShadowFrustum::omni(Vec3::ZERO, 0.1, 2.0);
        let shading = ShadingTechnique::select(&light, &frustum, 0, true, UnitVolume::Projector(0));
        assert!(matches!(
            shading,
            ShadingTechnique::LightVolume { volume: UnitVolume::Box, sphere_adjust, .. } if sphere_adjust == Vec4::ZERO
        ));
        assert_eq!(shading.technique(), Technique::ShadowMaskGenVolume);
    }

    #[test]
    fn shadow_projection_is_camera_relative() {
        let texgen = Mat4::from_translation(Vec3::new(0.0, 0.0, 4.0));
        let projection = light_shadow_projection(texgen, Vec3::new(1.0, 2.0, 3.0), 10.0);
        let point = projection * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((point - Vec4::new(1.0, 2.0, 0.7, 1.0)).abs().max_element() < 1e-5);
    }
}
