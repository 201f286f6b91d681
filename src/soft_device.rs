use glam::{Mat4, Vec2, Vec3, Vec4};
use std::collections::{HashMap, HashSet};

use crate::device::{params, DeviceCaps, GraphicsDevice, MeshHandle, RenderTarget, ShadowMapSource};
use crate::error::DeviceError;
use crate::light::ScissorRect;
use crate::mesh::VolumeMesh;
use crate::render_state::{
    BlendMode, ColorWrites, CullMode, RenderState, ShaderFlags, ShaderPass, ShadowGenPass, StateFlags,
    StencilState, Technique, VertexFormat,
};

const CLIP_EPSILON: f32 = 1e-5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawKind {
    Indexed(MeshHandle),
    Fullscreen,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DrawRecord {
    pub kind: DrawKind,
    pub technique: Option<Technique>,
    pub pass: Option<ShaderPass>,
    pub shader_flags: ShaderFlags,
    pub state: RenderState,
    pub stencil: StencilState,
    pub cull: CullMode,
    pub depth_clip: bool,
    pub target: Option<RenderTarget>,
    /// Fragments that passed both the stencil and the depth test.
    pub fragments: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    BeginTechnique(Technique, ShaderFlags),
    EndTechnique,
    BeginPass(ShaderPass),
    EndPass,
    VertexFormatRejected(ShaderPass),
    Draw(DrawRecord),
    ClearStencil(u8),
    ClearColor(RenderTarget),
    PushTarget(RenderTarget),
    PopTarget,
    Scissor(Option<ScissorRect>),
    BindShadowMap(u32, ShadowMapSource),
}

#[derive(Clone, Copy, Debug)]
struct ClipVertex {
    clip: Vec4,
}

#[derive(Clone, Copy, Debug)]
struct ScreenVertex {
    position: Vec2,
    depth: f32,
}

/// CPU implementation of [`GraphicsDevice`].
///
/// Rasterizes unit volumes against a scene depth buffer with an 8-bit stencil
/// buffer and RGBA float targets, and logs every command it receives.
pub struct SoftDevice {
    width: u32,
    height: u32,
    caps: DeviceCaps,
    scene_depth: Vec<f32>,
    stencil: Vec<u8>,
    targets: HashMap<RenderTarget, Vec<Vec4>>,
    target_stack: Vec<RenderTarget>,
    state: RenderState,
    stencil_state: StencilState,
    cull: CullMode,
    depth_clip: bool,
    scissor: Option<ScissorRect>,
    technique: Option<(Technique, ShaderFlags)>,
    pass: Option<ShaderPass>,
    meshes: Vec<VolumeMesh>,
    bound_mesh: Option<MeshHandle>,
    constants: HashMap<&'static str, Vec<Vec4>>,
    rejected_passes: HashSet<ShaderPass>,
    fail_mesh_creation: bool,
    log: Vec<DeviceCommand>,
}

impl SoftDevice {
    pub fn new(width: u32, height: u32, caps: DeviceCaps) -> Self {
        let pixels = (width * height) as usize;
        Self {
            width,
            height,
            caps,
            scene_depth: vec![1.0; pixels],
            stencil: vec![0; pixels],
            targets: HashMap::new(),
            target_stack: Vec::new(),
            state: RenderState::default(),
            stencil_state: StencilState::default(),
            cull: CullMode::Back,
            depth_clip: true,
            scissor: None,
            technique: None,
            pass: None,
            meshes: Vec::new(),
            bound_mesh: None,
            constants: HashMap::new(),
            rejected_passes: HashSet::new(),
            fail_mesh_creation: false,
            log: Vec::new(),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Fills the scene depth buffer from a per-pixel function.
    pub fn set_scene_depth(&mut self, mut depth: impl FnMut(u32, u32) -> f32) {
        for y in 0..self.height {
            for x in 0..self.width {
                let index = self.index(x, y);
                self.scene_depth[index] = depth(x, y);
            }
        }
    }

    /// Projects `world` through `view_proj` and stores the resulting depth at every pixel.
    pub fn set_scene_plane(&mut self, view_proj: Mat4, depth_of: impl Fn(Vec2) -> Option<Vec3>) {
        let (width, height) = (self.width as f32, self.height as f32);
        self.set_scene_depth(|x, y| {
            let ndc = Vec2::new((x as f32 + 0.5) / width * 2.0 - 1.0, 1.0 - (y as f32 + 0.5) / height * 2.0);
            depth_of(ndc)
                .map(|world| {
                    let clip = view_proj * world.extend(1.0);
                    (clip.z / clip.w).clamp(0.0, 1.0)
                })
                .unwrap_or(1.0)
        });
    }

    pub fn reject_vertex_format(&mut self, pass: impl Into<ShaderPass>) {
        self.rejected_passes.insert(pass.into());
    }

    pub fn fail_mesh_creation(&mut self, fail: bool) {
        self.fail_mesh_creation = fail;
    }

    pub fn stencil_at(&self, x: u32, y: u32) -> u8 {
        self.stencil[self.index(x, y)]
    }

    pub fn stencil_buffer(&self) -> &[u8] {
        &self.stencil
    }

    pub fn set_stencil_buffer(&mut self, mut value: impl FnMut(u32, u32) -> u8) {
        for y in 0..self.height {
            for x in 0..self.width {
                let index = self.index(x, y);
                self.stencil[index] = value(x, y);
            }
        }
    }

    pub fn target_pixel(&self, target: RenderTarget, x: u32, y: u32) -> Vec4 {
        self.targets.get(&target).map(|pixels| pixels[self.index(x, y)]).unwrap_or(Vec4::ZERO)
    }

    pub fn current_target(&self) -> Option<RenderTarget> {
        self.target_stack.last().copied()
    }

    pub fn target_depth(&self) -> usize {
        self.target_stack.len()
    }

    pub fn constant(&self, name: &str) -> Option<&[Vec4]> {
        self.constants.get(name).map(|values| values.as_slice())
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.log
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawRecord> {
        self.log.iter().filter_map(|command| match command {
            DeviceCommand::Draw(record) => Some(record),
            _ => None,
        })
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn render_state(&self) -> RenderState {
        self.state
    }

    pub fn cull_mode(&self) -> CullMode {
        self.cull
    }

    pub fn depth_clip(&self) -> bool {
        self.depth_clip
    }

    pub fn scissor(&self) -> Option<ScissorRect> {
        self.scissor
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    fn matrix(&self, name: &str) -> Mat4 {
        match self.constants.get(name) {
            Some(values) if values.len() >= 4 => Mat4::from_cols(values[0], values[1], values[2], values[3]),
            _ => Mat4::IDENTITY,
        }
    }

    fn fragment_color(&self) -> Vec4 {
        let vector = |name: &str| self.constants.get(name).and_then(|values| values.first().copied());
        if self.pass == Some(ShaderPass::ShadowGen(ShadowGenPass::StencilCullNonConvexResolve)) {
            return vector(params::STENCIL_REF_RESOLVE).unwrap_or(Vec4::ZERO);
        }
        if matches!(self.technique, Some((Technique::DebugShadowCascades, _))) {
            return vector(params::DEBUG_CASCADE_COLOR).unwrap_or(Vec4::ONE);
        }
        Vec4::ONE
    }

    fn clamps_far_plane(&self) -> bool {
        matches!(self.pass, Some(ShaderPass::ShadowGen(pass)) if pass.clamps_far_plane())
    }

    fn record_draw(&mut self, kind: DrawKind, fragments: u32) {
        let record = DrawRecord {
            kind,
            technique: self.technique.map(|(technique, _)| technique),
            pass: self.pass,
            shader_flags: self.technique.map(|(_, flags)| flags).unwrap_or_default(),
            state: self.state,
            stencil: self.stencil_state,
            cull: self.cull,
            depth_clip: self.depth_clip,
            target: self.current_target(),
            fragments,
        };
        self.log.push(DeviceCommand::Draw(record));
    }

    /// Runs stencil, depth and color for one covered pixel. Returns whether it passed both tests.
    fn shade_fragment(&mut self, x: u32, y: u32, depth: f32, color: Vec4) -> bool {
        if let Some(rect) = self.scissor {
            if !rect.contains(x as i32, y as i32) {
                return false;
            }
        }
        let index = self.index(x, y);
        let stencil_enabled = self.state.flags.contains(StateFlags::STENCIL);
        let stored = self.stencil[index];
        let stencil_passed = !stencil_enabled
            || self.stencil_state.func.passes(self.stencil_state.reference, stored, self.stencil_state.read_mask);
        let depth_passed = !stencil_passed
            || !self.state.flags.contains(StateFlags::DEPTH_TEST)
            || self.state.depth_func.passes(depth, self.scene_depth[index]);
        if stencil_enabled {
            self.stencil[index] = self.stencil_state.resolve(stored, stencil_passed, depth_passed);
        }
        if !(stencil_passed && depth_passed) {
            return false;
        }
        if self.state.flags.contains(StateFlags::DEPTH_WRITE) {
            self.scene_depth[index] = depth;
        }
        let writes = self.state.color_writes;
        let blend = self.state.blend;
        if let Some(target) = self.current_target() {
            if !writes.is_empty() {
                let pixels = self.targets.entry(target).or_insert_with(|| vec![Vec4::ZERO; self.stencil.len()]);
                let destination = &mut pixels[index];
                let blended = match blend {
                    BlendMode::Opaque => color,
                    BlendMode::Additive => *destination + color,
                    BlendMode::AdditiveMax => destination.max(color),
                };
                for channel in 0..4 {
                    if writes.channel_index(channel) {
                        destination[channel] = blended[channel];
                    }
                }
            }
        }
        true
    }

    fn rasterize_mesh(&mut self, handle: MeshHandle) -> Result<u32, DeviceError> {
        let mesh = self.meshes.get(handle.0 as usize).ok_or(DeviceError::UnknownMesh(handle))?;
        let transform = self.matrix(params::VIEW_PROJ) * self.matrix(params::UNIT_VOLUME_TO_WORLD);
        let clamp_far = self.clamps_far_plane();
        let triangles: Vec<[ClipVertex; 3]> = mesh
            .triangles()
            .map(|corners| {
                corners.map(|corner| {
                    let mut clip = transform * corner.extend(1.0);
                    if clamp_far {
                        clip.z = clip.z.min(clip.w);
                    }
                    ClipVertex { clip }
                })
            })
            .collect();
        let color = self.fragment_color();
        let mut fragments = 0;
        for triangle in triangles {
            fragments += self.rasterize_triangle(triangle, color);
        }
        Ok(fragments)
    }

    fn rasterize_triangle(&mut self, triangle: [ClipVertex; 3], color: Vec4) -> u32 {
        let mut polygon = triangle.to_vec();
        polygon = clip_polygon(&polygon, |v| v.clip.w - CLIP_EPSILON);
        if self.depth_clip {
            polygon = clip_polygon(&polygon, |v| v.clip.z);
        }
        if polygon.len() < 3 {
            return 0;
        }
        let (width, height) = (self.width as f32, self.height as f32);
        let screen: Vec<(ScreenVertex, Vec2)> = polygon
            .iter()
            .map(|v| {
                let ndc = v.clip.truncate() / v.clip.w;
                let position = Vec2::new((ndc.x + 1.0) * 0.5 * width, (1.0 - ndc.y) * 0.5 * height);
                (ScreenVertex { position, depth: ndc.z }, ndc.truncate())
            })
            .collect();

        // winding is decided once for the whole polygon in NDC, y up
        let mut ndc_area = 0.0;
        for i in 0..screen.len() {
            let a = screen[i].1;
            let b = screen[(i + 1) % screen.len()].1;
            ndc_area += a.x * b.y - b.x * a.y;
        }
        let front_facing = ndc_area > 0.0;
        let culled = match self.cull {
            CullMode::None => false,
            CullMode::Front => front_facing,
            CullMode::Back => !front_facing,
        };
        if culled || ndc_area == 0.0 {
            return 0;
        }

        let mut fragments = 0;
        for i in 1..screen.len() - 1 {
            fragments += self.fill_triangle([screen[0].0, screen[i].0, screen[i + 1].0], color);
        }
        fragments
    }

    fn fill_triangle(&mut self, mut vertices: [ScreenVertex; 3], color: Vec4) -> u32 {
        let mut area = edge(vertices[0].position, vertices[1].position, vertices[2].position);
        if area == 0.0 {
            return 0;
        }
        if area < 0.0 {
            vertices.swap(1, 2);
            area = -area;
        }
        let [v0, v1, v2] = vertices;
        let min = v0.position.min(v1.position).min(v2.position).floor().max(Vec2::ZERO);
        let extent = Vec2::new(self.width as f32, self.height as f32);
        let max = v0.position.max(v1.position).max(v2.position).ceil().min(extent);
        let edges = [(v1, v2), (v2, v0), (v0, v1)];
        let top_left = edges.map(|(a, b)| is_top_left(a.position, b.position));

        let mut fragments = 0;
        for y in min.y as u32..max.y as u32 {
            for x in min.x as u32..max.x as u32 {
                let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                let weights = edges.map(|(a, b)| edge(a.position, b.position, p));
                let inside = weights.iter().zip(top_left).all(|(&w, tl)| w > 0.0 || (w == 0.0 && tl));
                if !inside {
                    continue;
                }
                let mut depth = (weights[0] * v0.depth + weights[1] * v1.depth + weights[2] * v2.depth) / area;
                if self.depth_clip {
                    if depth > 1.0 {
                        continue;
                    }
                } else {
                    depth = depth.clamp(0.0, 1.0);
                }
                if self.shade_fragment(x, y, depth, color) {
                    fragments += 1;
                }
            }
        }
        fragments
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

fn is_top_left(a: Vec2, b: Vec2) -> bool {
    let d = b - a;
    (d.y == 0.0 && d.x > 0.0) || d.y < 0.0
}

fn clip_polygon(polygon: &[ClipVertex], distance: impl Fn(&ClipVertex) -> f32) -> Vec<ClipVertex> {
    let mut out = Vec::with_capacity(polygon.len() + 2);
    for i in 0..polygon.len() {
        let current = polygon[i];
        let next = polygon[(i + 1) % polygon.len()];
        let (dc, dn) = (distance(&current), distance(&next));
        if dc >= 0.0 {
            out.push(current);
        }
        if (dc >= 0.0) != (dn >= 0.0) {
            let t = dc / (dc - dn);
            out.push(ClipVertex { clip: current.clip.lerp(next.clip, t) });
        }
    }
    out
}

impl GraphicsDevice for SoftDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn set_render_state(&mut self, state: &RenderState) {
        self.state = *state;
    }

    fn set_stencil_state(&mut self, state: &StencilState) {
        self.stencil_state = *state;
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        self.cull = mode;
    }

    fn set_depth_clip(&mut self, enabled: bool) {
        self.depth_clip = enabled;
    }

    fn set_scissor(&mut self, rect: Option<ScissorRect>) {
        self.scissor = rect;
        self.log.push(DeviceCommand::Scissor(rect));
    }

    fn begin_technique(&mut self, technique: Technique, flags: ShaderFlags) {
        self.technique = Some((technique, flags));
        self.log.push(DeviceCommand::BeginTechnique(technique, flags));
    }

    fn end_technique(&mut self) {
        self.technique = None;
        self.pass = None;
        self.log.push(DeviceCommand::EndTechnique);
    }

    fn begin_pass(&mut self, pass: ShaderPass) {
        self.pass = Some(pass);
        self.log.push(DeviceCommand::BeginPass(pass));
    }

    fn end_pass(&mut self) {
        self.pass = None;
        self.log.push(DeviceCommand::EndPass);
    }

    fn bind_vertex_format(&mut self, format: VertexFormat) -> Result<(), DeviceError> {
        let pass = self.pass.unwrap_or(ShaderPass::Main);
        if self.rejected_passes.contains(&pass) {
            self.log.push(DeviceCommand::VertexFormatRejected(pass));
            return Err(DeviceError::VertexFormatMismatch { pass, format });
        }
        Ok(())
    }

    fn create_mesh(&mut self, mesh: &VolumeMesh) -> Result<MeshHandle, DeviceError> {
        if self.fail_mesh_creation {
            return Err(DeviceError::ResourceCreation {
                what: "volume mesh",
                reason: "creation disabled on soft device".to_string(),
            });
        }
        self.meshes.push(mesh.clone());
        Ok(MeshHandle(self.meshes.len() as u32 - 1))
    }

    fn bind_mesh(&mut self, mesh: MeshHandle) -> Result<(), DeviceError> {
        if mesh.0 as usize >= self.meshes.len() {
            return Err(DeviceError::UnknownMesh(mesh));
        }
        self.bound_mesh = Some(mesh);
        Ok(())
    }

    fn set_constants(&mut self, name: &'static str, values: &[Vec4]) {
        self.constants.insert(name, values.to_vec());
    }

    fn bind_shadow_map(&mut self, slot: u32, source: ShadowMapSource, _comparison: bool) {
        self.log.push(DeviceCommand::BindShadowMap(slot, source));
    }

    fn draw_indexed(&mut self) {
        let Some(handle) = self.bound_mesh else {
            log::warn!("soft device: draw without a bound mesh");
            return;
        };
        match self.rasterize_mesh(handle) {
            Ok(fragments) => self.record_draw(DrawKind::Indexed(handle), fragments),
            Err(err) => log::warn!("soft device: {err}"),
        }
    }

    fn draw_fullscreen_triangle(&mut self, depth: f32) {
        let color = self.fragment_color();
        let mut fragments = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.shade_fragment(x, y, depth, color) {
                    fragments += 1;
                }
            }
        }
        self.record_draw(DrawKind::Fullscreen, fragments);
    }

    fn clear_stencil(&mut self, value: u8) {
        let scissor = self.scissor;
        for y in 0..self.height {
            for x in 0..self.width {
                if scissor.map_or(true, |rect| rect.contains(x as i32, y as i32)) {
                    let index = self.index(x, y);
                    self.stencil[index] = value;
                }
            }
        }
        self.log.push(DeviceCommand::ClearStencil(value));
    }

    fn clear_color(&mut self, target: RenderTarget, color: Vec4) {
        let pixels = self.stencil.len();
        self.targets.insert(target, vec![color; pixels]);
        self.log.push(DeviceCommand::ClearColor(target));
    }

    fn push_render_target(&mut self, target: RenderTarget) {
        self.target_stack.push(target);
        self.log.push(DeviceCommand::PushTarget(target));
    }

    fn pop_render_target(&mut self) {
        if self.target_stack.pop().is_none() {
            log::warn!("soft device: render target stack underflow");
        }
        self.log.push(DeviceCommand::PopTarget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_state::{DepthFunc, StencilFunc, StencilOp};

    fn device() -> SoftDevice {
        SoftDevice::new(16, 16, DeviceCaps { depth_clip_control: true, stencil_texture_sampling: true })
    }

    #[test]
    fn box_back_faces_mark_where_scene_is_inside() {
        let mut dev = device();
        let view_proj = Mat4::orthographic_rh(-2.0, 2.0, -2.0, 2.0, 0.0, 10.0);
        dev.set_matrix(params::VIEW_PROJ, &view_proj);
        dev.set_matrix(params::UNIT_VOLUME_TO_WORLD, &Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)));
        // scene plane at z = -5 (inside the box), depth 0.5
        dev.set_scene_depth(|_, _| 0.5);
        let handle = dev.create_mesh(&VolumeMesh::unit_box()).expect("mesh");
        dev.bind_mesh(handle).expect("bind");
        dev.set_render_state(&RenderState::default().stencil_mark());
        dev.set_stencil_state(&StencilState::on_depth_fail(StencilFunc::Always, StencilOp::Replace, 7));
        dev.set_cull_mode(CullMode::Front);
        dev.draw_indexed();
        // box covers the center half of the screen
        assert_eq!(dev.stencil_at(8, 8), 7);
        assert_eq!(dev.stencil_at(0, 0), 0);
        let marked = dev.stencil_buffer().iter().filter(|&&s| s == 7).count();
        assert_eq!(marked, 64);
    }

    #[test]
    fn shared_edges_are_filled_once() {
        let mut dev = device();
        let handle = dev.create_mesh(&VolumeMesh::fullscreen_quad()).expect("mesh");
        dev.bind_mesh(handle).expect("bind");
        let mut state = RenderState::default();
        state.flags = StateFlags::STENCIL;
        dev.set_render_state(&state);
        dev.set_stencil_state(&StencilState::new(
            StencilFunc::Always,
            StencilOp::Keep,
            StencilOp::Keep,
            StencilOp::IncrSat,
            0,
        ));
        dev.set_cull_mode(CullMode::None);
        dev.set_matrix(params::UNIT_VOLUME_TO_WORLD, &Mat4::from_scale(Vec3::new(1.0, 1.0, 0.5)));
        dev.draw_indexed();
        assert!(dev.stencil_buffer().iter().all(|&s| s == 1));
    }

    #[test]
    fn fullscreen_triangle_respects_stencil_and_channel_mask() {
        let mut dev = device();
        dev.set_stencil_buffer(|x, _| if x < 8 { 3 } else { 0 });
        dev.push_render_target(RenderTarget::ShadowMaskSlice(0));
        let state = RenderState {
            flags: StateFlags::STENCIL,
            depth_func: DepthFunc::Always,
            color_writes: ColorWrites::G,
            blend: BlendMode::Opaque,
        };
        dev.set_render_state(&state);
        dev.set_stencil_state(&StencilState::keep(StencilFunc::Equal, 3));
        dev.draw_fullscreen_triangle(0.0);
        assert_eq!(dev.target_pixel(RenderTarget::ShadowMaskSlice(0), 2, 2), Vec4::new(0.0, 1.0, 0.0, 0.0));
        assert_eq!(dev.target_pixel(RenderTarget::ShadowMaskSlice(0), 12, 2), Vec4::ZERO);
        assert_eq!(dev.draws().count(), 1);
    }
}
