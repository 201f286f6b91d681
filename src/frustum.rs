use glam::{Mat4, Vec3, Vec4};

/// Cascades supported by the interleaved stencil reference scheme.
pub const MAX_CASCADES: u32 = 9;

/// Field of view of one omni cube face, widened so neighbouring faces overlap.
pub const OMNI_FACE_FOV_DEG: f32 = 93.0;

pub const CUBE_SIDES: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrustumType {
    Nearest,
    GsmDynamic,
    GsmDynamicDistance,
    GsmCached,
    HeightMapAo,
    PerObject,
}

impl FrustumType {
    /// Dynamic cascades form the leading run of a sun light's frustums.
    pub fn is_dynamic_cascade(self) -> bool {
        matches!(self, FrustumType::GsmDynamic | FrustumType::GsmDynamicDistance)
    }

    pub fn is_cached(self) -> bool {
        matches!(self, FrustumType::GsmCached | FrustumType::HeightMapAo)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthTextureId(pub u32);

#[derive(Clone, Debug)]
pub struct ShadowFrustum {
    pub frustum_type: FrustumType,
    /// World to shadow clip space, depth in `[0, 1]`.
    pub light_view_proj: Mat4,
    pub light_position: Vec3,
    pub near_plane: f32,
    pub far_plane: f32,
    pub omni: bool,
    pub lod: u32,
    pub blend_frustum: bool,
    /// Fraction of the cascade, from its edge inwards, blended with the previous cascade.
    pub blend_value: f32,
    pub additive_blend: bool,
    pub depth_const_bias: f32,
    pub texture_size: u32,
    pub hw_pcf_compare: bool,
    pub use_shadow_pool: bool,
    pub depth_texture: Option<DepthTextureId>,
    /// One bit per cube side that needs shadow generation.
    pub gen_mask: u8,
    /// Neighbouring cascade, only set while a blend sequence runs.
    pub prev_frustum: Option<usize>,
}

impl ShadowFrustum {
    pub fn new(frustum_type: FrustumType, light_view_proj: Mat4) -> Self {
        Self {
            frustum_type,
            light_view_proj,
            light_position: Vec3::ZERO,
            near_plane: 0.1,
            far_plane: 100.0,
            omni: false,
            lod: 0,
            blend_frustum: false,
            blend_value: 0.0,
            additive_blend: false,
            depth_const_bias: 0.0005,
            texture_size: 1024,
            hw_pcf_compare: true,
            use_shadow_pool: false,
            depth_texture: None,
            gen_mask: 1,
            prev_frustum: None,
        }
    }

    pub fn cascade(lod: u32, light_view_proj: Mat4, depth_texture: DepthTextureId) -> Self {
        Self { lod, depth_texture: Some(depth_texture), ..Self::new(FrustumType::GsmDynamic, light_view_proj) }
    }

    /// Pooled frustum of a point light rendering all six cube sides.
    pub fn omni(position: Vec3, near_plane: f32, far_plane: f32) -> Self {
        Self {
            light_position: position,
            near_plane,
            far_plane,
            omni: true,
            use_shadow_pool: true,
            gen_mask: 0x3F,
            ..Self::new(FrustumType::PerObject, Mat4::IDENTITY)
        }
    }

    /// Synthetic frustum used to composite cloud shadows.
    pub fn clouds() -> Self {
        Self { additive_blend: true, ..Self::new(FrustumType::GsmDynamic, Mat4::IDENTITY) }
    }

    pub fn side_count(&self) -> u32 {
        if self.omni {
            CUBE_SIDES
        } else {
            1
        }
    }

    /// Blend fraction and its reciprocal remap factor.
    pub fn blend_params(&self) -> (f32, f32) {
        let blend = self.blend_value.clamp(0.0, 0.99);
        (blend, 1.0 / (1.0 - blend))
    }

    pub fn renders_side(&self, side: u32) -> bool {
        self.gen_mask & (1 << side) != 0
    }

    /// World to clip transform of one side. Non-omni frustums only have side 0.
    ///
    /// Cube faces are rendered mirrored on x, so volumes built from them need mirror culling.
    pub fn face_view_proj(&self, side: u32) -> Mat4 {
        if !self.omni {
            return self.light_view_proj;
        }
        let projection = Mat4::perspective_rh(OMNI_FACE_FOV_DEG.to_radians(), 1.0, self.near_plane, self.far_plane);
        Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0)) * projection * cube_face_view(self.light_position, side)
    }

    /// Texture-space transform: clip xy remapped to `[0, 1]` with y pointing down.
    pub fn shadow_texgen(&self, side: u32) -> Mat4 {
        let scale_bias = Mat4::from_cols(
            Vec4::new(0.5, 0.0, 0.0, 0.0),
            Vec4::new(0.0, -0.5, 0.0, 0.0),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            Vec4::new(0.5, 0.5, 0.0, 1.0),
        );
        scale_bias * self.face_view_proj(side)
    }

    /// True when `point` projects inside the frustum's clip volume.
    pub fn contains_point(&self, point: Vec3) -> bool {
        let clip = self.light_view_proj * point.extend(1.0);
        if clip.w.abs() <= f32::EPSILON {
            return false;
        }
        let ndc = clip.truncate() / clip.w;
        ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0 && (0.0..=1.0).contains(&ndc.z)
    }
}

/// View matrix looking down one of the six cube axes (+X, -X, +Y, -Y, +Z, -Z).
pub fn cube_face_view(position: Vec3, side: u32) -> Mat4 {
    let (direction, up) = match side % CUBE_SIDES {
        0 => (Vec3::X, Vec3::Y),
        1 => (Vec3::NEG_X, Vec3::Y),
        2 => (Vec3::Y, Vec3::NEG_Z),
        3 => (Vec3::NEG_Y, Vec3::Z),
        4 => (Vec3::Z, Vec3::Y),
        _ => (Vec3::NEG_Z, Vec3::Y),
    };
    Mat4::look_to_rh(position, direction, up)
}

/// Perspective frustum enclosing a light's influence, looking along `direction`.
pub fn light_frustum(position: Vec3, direction: Vec3, radius: f32, fov_deg: f32) -> Mat4 {
    let up = if direction.abs().dot(Vec3::Y) > 0.99 { Vec3::Z } else { Vec3::Y };
    let near = (radius * 0.01).max(0.01);
    let far = radius.max(near * 2.0);
    let fov = fov_deg.clamp(1.0, 179.0).to_radians();
    Mat4::perspective_rh(fov, 1.0, near, far) * Mat4::look_to_rh(position, direction, up)
}
