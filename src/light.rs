use bitflags::bitflags;
use glam::{Mat3, Mat4, Vec2, Vec3};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct LightFlags: u32 {
        const CAST_SHADOW_MAPS = 1 << 0;
        const SUN = 1 << 1;
        const AREA = 1 << 2;
        const DEFERRED_CUBEMAP = 1 << 3;
        const PROJECTOR = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightId(pub u32);

impl LightId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Screen-space bounds of a light in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl ScissorRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn max_x(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub fn max_y(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    /// Inclusive overlap: rectangles that share an edge count as overlapping.
    pub fn overlaps(&self, other: &ScissorRect) -> bool {
        self.max_x() >= other.x && self.x <= other.max_x() && self.max_y() >= other.y && self.y <= other.max_y()
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.max_x() && y >= self.y && y < self.max_y()
    }

    /// Rect in render-target pixels, grown by one pixel to cover rounding.
    pub fn scaled(&self, factor: Vec2) -> ScissorRect {
        ScissorRect {
            x: (self.x as f32 * factor.x) as i32,
            y: (self.y as f32 * factor.y) as i32,
            width: (self.width as f32 * factor.x + 1.0) as i32,
            height: (self.height as f32 * factor.y + 1.0) as i32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightShape {
    Area,
    DeferredCubemap,
    Projector,
    Omni,
}

#[derive(Clone, Debug)]
pub struct Light {
    pub id: LightId,
    pub flags: LightFlags,
    pub position: Vec3,
    pub radius: f32,
    /// Orientation; column 0 is the projection direction.
    pub basis: Mat3,
    pub projector_near_plane: f32,
    pub frustum_angle_deg: f32,
    pub area_width: f32,
    pub area_height: f32,
    pub probe_extents: Vec3,
    pub projector_texture_replicated: bool,
    pub scissor: ScissorRect,
    pub mask_channel: Option<u32>,
    pub mask_slice: Option<u32>,
}

impl Light {
    pub fn new(id: LightId, position: Vec3, radius: f32) -> Self {
        Self {
            id,
            flags: LightFlags::CAST_SHADOW_MAPS,
            position,
            radius,
            basis: Mat3::IDENTITY,
            projector_near_plane: 0.0,
            frustum_angle_deg: 45.0,
            area_width: 0.0,
            area_height: 0.0,
            probe_extents: Vec3::ONE,
            projector_texture_replicated: false,
            scissor: ScissorRect::default(),
            mask_channel: None,
            mask_slice: None,
        }
    }

    pub fn with_flags(mut self, flags: LightFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_scissor(mut self, scissor: ScissorRect) -> Self {
        self.scissor = scissor;
        self
    }

    pub fn casts_shadows(&self) -> bool {
        self.flags.contains(LightFlags::CAST_SHADOW_MAPS)
    }

    /// Area lights only count as such with a non-degenerate emitter.
    pub fn is_area(&self) -> bool {
        self.flags.contains(LightFlags::AREA)
            && self.area_width != 0.0
            && self.area_height != 0.0
            && self.frustum_angle_deg != 0.0
    }

    pub fn shape(&self) -> LightShape {
        if self.is_area() {
            LightShape::Area
        } else if self.flags.contains(LightFlags::DEFERRED_CUBEMAP) {
            LightShape::DeferredCubemap
        } else if self.flags.contains(LightFlags::PROJECTOR) {
            LightShape::Projector
        } else {
            LightShape::Omni
        }
    }

    /// Omni volumes are rendered with flipped winding.
    pub fn requires_mirror_cull(&self) -> bool {
        !self.flags.intersects(LightFlags::PROJECTOR | LightFlags::AREA)
    }

    pub fn direction(&self) -> Vec3 {
        self.basis.x_axis.normalize_or_zero()
    }

    /// Unit box to world for an area light, expanded by `scale` around the emitter.
    pub fn area_light_matrix(&self, scale: Vec3) -> Mat4 {
        let half = Vec3::new(scale.x, self.area_width * 0.5 + scale.y, self.area_height * 0.5 + scale.z);
        Mat4::from_translation(self.position) * Mat4::from_mat3(self.basis) * Mat4::from_scale(half)
    }

    /// Unit box to world for a deferred cubemap probe.
    pub fn probe_box_matrix(&self) -> Mat4 {
        let rotation = Mat3::from_cols(
            self.basis.x_axis.normalize_or_zero() * self.probe_extents.x,
            self.basis.y_axis.normalize_or_zero() * self.probe_extents.y,
            self.basis.z_axis.normalize_or_zero() * self.probe_extents.z,
        );
        Mat4::from_translation(self.position) * Mat4::from_mat3(rotation)
    }
}
