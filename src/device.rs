use glam::{Mat4, Vec4};

use crate::error::DeviceError;
use crate::frustum::DepthTextureId;
use crate::light::ScissorRect;
use crate::mesh::VolumeMesh;
use crate::render_state::{
    CullMode, RenderState, ShaderFlags, ShaderPass, StencilState, Technique, VertexFormat,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub u32);

/// Shader constant names shared with the shadow mask shaders.
pub mod params {
    pub const VIEW_PROJ: &str = "ViewProj";
    pub const UNIT_VOLUME_TO_WORLD: &str = "UnitVolumeToWorld";
    pub const LIGHT_POS_RADIUS: &str = "LightPosRadius";
    pub const SPHERE_ADJUST: &str = "SphereAdjust";
    pub const SHADOW_TEX_GEN: &str = "ShadowTexGen";
    pub const SHADOW_TEX_GEN_HQ: &str = "ShadowTexGenHQ";
    pub const PREV_SHADOW_TEX_GEN: &str = "PrevShadowTexGen";
    pub const BLEND_PARAMS: &str = "BlendParams";
    pub const SHADOW_PARAMS: &str = "ShadowParams";
    pub const SCREEN_TO_WORLD_BASIS: &str = "ScreenToWorldBasis";
    pub const GENERAL_PARAMS: &str = "GeneralParams";
    pub const LIGHT_SHADOW_PROJ: &str = "LightShadowProj";
    pub const SCREEN_SCALE: &str = "ScreenScale";
    pub const LIGHT_POS: &str = "LightPos";
    pub const STENCIL_REF_RESOLVE: &str = "StencilRefResolve";
    pub const DEBUG_CASCADE_COLOR: &str = "DebugCascadeColor";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DeviceCaps {
    /// Rasterizer depth clipping can be switched off per draw.
    pub depth_clip_control: bool,
    /// Depth-stencil targets can be sampled as textures.
    pub stencil_texture_sampling: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    ShadowMaskSlice(u32),
    /// Scene diffuse target, used by the cascade debug overlay.
    SceneDiffuse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShadowMapSource {
    Pool,
    Depth(DepthTextureId),
    Clouds,
}

/// Command surface the shadow mask stages drive.
///
/// Implementations record or execute the calls; the stages never read device state back.
pub trait GraphicsDevice {
    fn caps(&self) -> DeviceCaps;

    fn set_render_state(&mut self, state: &RenderState);
    fn set_stencil_state(&mut self, state: &StencilState);
    fn set_cull_mode(&mut self, mode: CullMode);
    fn set_depth_clip(&mut self, enabled: bool);
    fn set_scissor(&mut self, rect: Option<ScissorRect>);

    fn begin_technique(&mut self, technique: Technique, flags: ShaderFlags);
    fn end_technique(&mut self);
    fn begin_pass(&mut self, pass: ShaderPass);
    fn end_pass(&mut self);
    /// Binds the input layout for the active pass. Fails when the pass expects another layout.
    fn bind_vertex_format(&mut self, format: VertexFormat) -> Result<(), DeviceError>;

    fn create_mesh(&mut self, mesh: &VolumeMesh) -> Result<MeshHandle, DeviceError>;
    fn bind_mesh(&mut self, mesh: MeshHandle) -> Result<(), DeviceError>;
    fn set_constants(&mut self, name: &'static str, values: &[Vec4]);
    fn bind_shadow_map(&mut self, slot: u32, source: ShadowMapSource, comparison: bool);

    /// Draws the bound mesh.
    fn draw_indexed(&mut self);
    /// Draws a triangle covering the viewport at depth `depth`.
    fn draw_fullscreen_triangle(&mut self, depth: f32);

    fn clear_stencil(&mut self, value: u8);
    fn clear_color(&mut self, target: RenderTarget, color: Vec4);
    fn push_render_target(&mut self, target: RenderTarget);
    fn pop_render_target(&mut self);

    fn set_vector(&mut self, name: &'static str, value: Vec4) {
        self.set_constants(name, &[value]);
    }

    fn set_matrix(&mut self, name: &'static str, value: &Mat4) {
        let columns: [Vec4; 4] = bytemuck::cast(*value);
        self.set_constants(name, &columns);
    }
}
