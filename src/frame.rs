use glam::{Mat4, Vec2, Vec3, Vec4};
use std::ops::Range;

use crate::frustum::ShadowFrustum;
use crate::light::{Light, LightId};

#[derive(Clone, Copy, Debug)]
pub struct ViewParameters {
    pub view_proj: Mat4,
    pub camera_position: Vec3,
    pub near_plane: f32,
    pub far_plane: f32,
    /// Size of the shadow mask render target in pixels.
    pub mask_size: (u32, u32),
    /// Ratio between the mask target and the full-resolution light rects.
    pub downscale: Vec2,
}

impl Default for ViewParameters {
    fn default() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            camera_position: Vec3::ZERO,
            near_plane: 0.1,
            far_plane: 1000.0,
            mask_size: (1280, 720),
            downscale: Vec2::ONE,
        }
    }
}

impl ViewParameters {
    pub fn new(view: Mat4, projection: Mat4, mask_size: (u32, u32)) -> Self {
        let camera_position = view.inverse().w_axis.truncate();
        Self { view_proj: projection * view, camera_position, mask_size, ..Self::default() }
    }

    /// World-space vectors that rebuild a world position from a screen pixel and linear depth.
    pub fn screen_to_world_basis(&self) -> [Vec4; 3] {
        let inverse = self.view_proj.inverse();
        let unproject = |x: f32, y: f32| {
            let world = inverse * Vec4::new(x, y, 1.0, 1.0);
            world.truncate() / world.w
        };
        let top_left = unproject(-1.0, 1.0);
        let top_right = unproject(1.0, 1.0);
        let bottom_left = unproject(-1.0, -1.0);
        let (width, height) = (self.mask_size.0.max(1) as f32, self.mask_size.1.max(1) as f32);
        [
            ((top_right - top_left) / width).extend(1.0),
            ((bottom_left - top_left) / height).extend(1.0),
            (top_left - self.camera_position).extend(1.0),
        ]
    }
}

/// Lights and shadow frustums of one frame, addressed by index.
#[derive(Clone, Debug, Default)]
pub struct ShadowFrame {
    pub view: ViewParameters,
    pub lights: Vec<Light>,
    pub frustums: Vec<ShadowFrustum>,
    frustum_ranges: Vec<Range<usize>>,
    pub sun: Option<LightId>,
    /// Point and spot lights rendered into the shadow pool.
    pub pooled_lights: Vec<LightId>,
    /// Per-render-node frustums composited after the sun cascades.
    pub custom_frustums: Vec<usize>,
    pub cloud_shadows: bool,
}

impl ShadowFrame {
    pub fn new(view: ViewParameters) -> Self {
        Self { view, ..Self::default() }
    }

    pub fn add_light(&mut self, mut light: Light) -> LightId {
        let id = LightId(self.lights.len() as u32);
        light.id = id;
        self.lights.push(light);
        self.frustum_ranges.push(0..0);
        id
    }

    /// Appends `frustums` and records them as the contiguous range of `light`.
    pub fn add_frustums(&mut self, light: LightId, frustums: impl IntoIterator<Item = ShadowFrustum>) -> Range<usize> {
        let start = self.frustums.len();
        self.frustums.extend(frustums);
        let range = start..self.frustums.len();
        if let Some(slot) = self.frustum_ranges.get_mut(light.index()) {
            *slot = range.clone();
        }
        range
    }

    pub fn add_sun(&mut self, light: Light, cascades: impl IntoIterator<Item = ShadowFrustum>) -> LightId {
        let id = self.add_light(light);
        self.add_frustums(id, cascades);
        self.sun = Some(id);
        id
    }

    pub fn add_pooled_light(&mut self, light: Light, frustums: impl IntoIterator<Item = ShadowFrustum>) -> LightId {
        let id = self.add_light(light);
        self.add_frustums(id, frustums);
        self.pooled_lights.push(id);
        id
    }

    pub fn add_custom_frustum(&mut self, frustum: ShadowFrustum) -> usize {
        self.frustums.push(frustum);
        let index = self.frustums.len() - 1;
        self.custom_frustums.push(index);
        index
    }

    pub fn light(&self, id: LightId) -> Option<&Light> {
        self.lights.get(id.index())
    }

    pub fn light_mut(&mut self, id: LightId) -> Option<&mut Light> {
        self.lights.get_mut(id.index())
    }

    pub fn frustum_range(&self, id: LightId) -> Range<usize> {
        self.frustum_ranges.get(id.index()).cloned().unwrap_or(0..0)
    }

    pub fn first_frustum(&self, id: LightId) -> Option<&ShadowFrustum> {
        let range = self.frustum_range(id);
        if range.is_empty() {
            return None;
        }
        self.frustums.get(range.start)
    }

    pub fn first_frustum_mut(&mut self, id: LightId) -> Option<&mut ShadowFrustum> {
        let range = self.frustum_range(id);
        if range.is_empty() {
            return None;
        }
        self.frustums.get_mut(range.start)
    }

    /// Clears per-frame assignments written by the compositor.
    pub fn reset_mask_assignments(&mut self) {
        for light in &mut self.lights {
            light.mask_channel = None;
            light.mask_slice = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frustum::FrustumType;

    #[test]
    fn frustum_ranges_follow_insertion() {
        let mut frame = ShadowFrame::default();
        let a = frame.add_pooled_light(
            Light::new(LightId(0), Vec3::ZERO, 2.0),
            [ShadowFrustum::new(FrustumType::PerObject, Mat4::IDENTITY)],
        );
        let b = frame.add_pooled_light(Light::new(LightId(0), Vec3::ONE, 2.0), []);
        assert_eq!(frame.frustum_range(a), 0..1);
        assert!(frame.frustum_range(b).is_empty());
        assert!(frame.first_frustum(b).is_none());
        assert_eq!(frame.light(b).map(|light| light.id), Some(LightId(1)));
    }

    #[test]
    fn camera_position_from_view() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y);
        let params = ViewParameters::new(view, Mat4::perspective_rh(1.0, 1.0, 0.1, 50.0), (64, 64));
        assert!((params.camera_position - Vec3::new(0.0, 2.0, 5.0)).length() < 1e-4);
    }
}
