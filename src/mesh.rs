use glam::Vec3;
use std::collections::HashMap;

use crate::device::{GraphicsDevice, MeshHandle};
use crate::error::DeviceError;
use crate::render_state::VertexFormat;

/// Tessellation levels available for the projector meshes.
pub const PROJECTOR_LODS: u8 = 3;

#[derive(Clone, Debug)]
pub struct VolumeMesh {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub format: VertexFormat,
}

impl VolumeMesh {
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        Self { positions, indices, format: VertexFormat::P3F }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn triangles(&self) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        self.indices.chunks_exact(3).map(move |tri| {
            [self.positions[tri[0] as usize], self.positions[tri[1] as usize], self.positions[tri[2] as usize]]
        })
    }

    /// Box spanning `[-1, 1]` on every axis.
    pub fn unit_box() -> Self {
        let mut builder = GridBuilder::default();
        builder.box_faces(2, false);
        builder.finish()
    }

    /// Unit sphere built by subdividing an octahedron `subdivisions` times.
    pub fn unit_sphere(subdivisions: u32) -> Self {
        let mut positions = vec![Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];
        let mut triangles: Vec<[u32; 3]> = vec![
            [0, 2, 4],
            [2, 1, 4],
            [1, 3, 4],
            [3, 0, 4],
            [2, 0, 5],
            [1, 2, 5],
            [3, 1, 5],
            [0, 3, 5],
        ];
        let mut midpoints: HashMap<(u32, u32), u32> = HashMap::new();
        for _ in 0..subdivisions {
            let mut next = Vec::with_capacity(triangles.len() * 4);
            for [a, b, c] in triangles {
                let mut midpoint = |i: u32, j: u32| {
                    let key = (i.min(j), i.max(j));
                    *midpoints.entry(key).or_insert_with(|| {
                        let point = (positions[i as usize] + positions[j as usize]).normalize();
                        positions.push(point);
                        positions.len() as u32 - 1
                    })
                };
                let ab = midpoint(a, b);
                let bc = midpoint(b, c);
                let ca = midpoint(c, a);
                next.extend_from_slice(&[[a, ab, ca], [ab, b, bc], [ca, bc, c], [ab, bc, ca]]);
            }
            triangles = next;
        }
        Self::new(positions, triangles.into_iter().flatten().collect())
    }

    /// Clip-space frustum `x, y in [-1, 1]`, `z in [0, 1]`, `verts_per_edge` vertices per face edge.
    ///
    /// Wound so that it faces outwards once mapped through an inverse right-handed projection.
    pub fn unit_frustum(verts_per_edge: u32) -> Self {
        let mut builder = GridBuilder::default();
        builder.box_faces(verts_per_edge.max(2), true);
        builder.remap_depth_to_unit();
        builder.finish()
    }

    /// Eight-vertex clip-space frustum used by the cascade prepass.
    pub fn simple_frustum() -> Self {
        Self::unit_frustum(2)
    }

    /// Fullscreen quad at the far plane.
    pub fn fullscreen_quad() -> Self {
        let positions = vec![
            Vec3::new(-1.0, -1.0, 1.0),
            Vec3::new(1.0, -1.0, 1.0),
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(-1.0, 1.0, 1.0),
        ];
        Self { positions, indices: vec![0, 1, 2, 0, 2, 3], format: VertexFormat::P3FC4BT2F }
    }
}

#[derive(Default)]
struct GridBuilder {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
}

impl GridBuilder {
    fn box_faces(&mut self, verts_per_edge: u32, flip: bool) {
        // (normal, u, v) with u x v == normal
        let faces = [
            (Vec3::X, Vec3::Y, Vec3::Z),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X),
        ];
        for (normal, u, v) in faces {
            self.face(normal, u, v, verts_per_edge, flip);
        }
    }

    fn face(&mut self, normal: Vec3, u: Vec3, v: Vec3, verts_per_edge: u32, flip: bool) {
        let base = self.positions.len() as u32;
        let steps = verts_per_edge - 1;
        for j in 0..verts_per_edge {
            for i in 0..verts_per_edge {
                let s = i as f32 / steps as f32 * 2.0 - 1.0;
                let t = j as f32 / steps as f32 * 2.0 - 1.0;
                self.positions.push(normal + u * s + v * t);
            }
        }
        for j in 0..steps {
            for i in 0..steps {
                let p00 = base + j * verts_per_edge + i;
                let p10 = p00 + 1;
                let p01 = p00 + verts_per_edge;
                let p11 = p01 + 1;
                if flip {
                    self.indices.extend_from_slice(&[p00, p11, p10, p00, p01, p11]);
                } else {
                    self.indices.extend_from_slice(&[p00, p10, p11, p00, p11, p01]);
                }
            }
        }
    }

    fn remap_depth_to_unit(&mut self) {
        for position in &mut self.positions {
            position.z = position.z * 0.5 + 0.5;
        }
    }

    fn finish(self) -> VolumeMesh {
        VolumeMesh::new(self.positions, self.indices)
    }
}

/// Unit meshes the stencil passes draw, transformed per draw by a constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitVolume {
    /// Projector frustum, tessellation level `0..PROJECTOR_LODS`.
    Projector(u8),
    /// Denser projector frustum for reversed projectors.
    ClipProjector(u8),
    Sphere,
    Box,
    SimpleProjector,
    Quad,
}

impl UnitVolume {
    pub fn all() -> impl Iterator<Item = UnitVolume> {
        (0..PROJECTOR_LODS)
            .map(UnitVolume::Projector)
            .chain((0..PROJECTOR_LODS).map(UnitVolume::ClipProjector))
            .chain([UnitVolume::Sphere, UnitVolume::Box, UnitVolume::SimpleProjector, UnitVolume::Quad])
    }

    pub fn build(self) -> VolumeMesh {
        match self {
            UnitVolume::Projector(lod) => VolumeMesh::unit_frustum(11 + 10 * lod.min(PROJECTOR_LODS - 1) as u32),
            UnitVolume::ClipProjector(lod) => {
                VolumeMesh::unit_frustum(41 + 10 * lod.min(PROJECTOR_LODS - 1) as u32)
            }
            UnitVolume::Sphere => VolumeMesh::unit_sphere(2),
            UnitVolume::Box => VolumeMesh::unit_box(),
            UnitVolume::SimpleProjector => VolumeMesh::simple_frustum(),
            UnitVolume::Quad => VolumeMesh::fullscreen_quad(),
        }
    }
}

/// Device handles of every [`UnitVolume`].
#[derive(Clone, Debug, Default)]
pub struct UnitVolumeMeshes {
    handles: HashMap<UnitVolume, (MeshHandle, VertexFormat)>,
}

impl UnitVolumeMeshes {
    pub fn create(device: &mut dyn GraphicsDevice) -> Result<Self, DeviceError> {
        let mut handles = HashMap::new();
        for volume in UnitVolume::all() {
            let mesh = volume.build();
            let handle = device.create_mesh(&mesh)?;
            handles.insert(volume, (handle, mesh.format));
        }
        Ok(Self { handles })
    }

    pub fn handle(&self, volume: UnitVolume) -> Option<MeshHandle> {
        self.handles.get(&volume).map(|(handle, _)| *handle)
    }

    pub fn format(&self, volume: UnitVolume) -> VertexFormat {
        self.handles.get(&volume).map(|(_, format)| *format).unwrap_or(VertexFormat::P3F)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_volume(mesh: &VolumeMesh) -> f32 {
        mesh.triangles().map(|[a, b, c]| a.dot(b.cross(c))).sum::<f32>() / 6.0
    }

    #[test]
    fn box_is_closed_and_outward() {
        let mesh = VolumeMesh::unit_box();
        assert_eq!(mesh.triangle_count(), 12);
        assert!((signed_volume(&mesh) - 8.0).abs() < 1e-4);
    }

    #[test]
    fn sphere_winding_faces_out() {
        let mesh = VolumeMesh::unit_sphere(2);
        assert_eq!(mesh.triangle_count(), 8 * 16);
        let volume = signed_volume(&mesh);
        assert!(volume > 2.5 && volume < 4.19, "volume {volume}");
    }

    #[test]
    fn frustum_is_inverted_in_clip_space() {
        let mesh = VolumeMesh::unit_frustum(11);
        assert_eq!(mesh.triangle_count(), 6 * 10 * 10 * 2);
        assert!((signed_volume(&mesh) + 4.0).abs() < 1e-3);
        assert!(mesh.positions.iter().all(|p| (0.0..=1.0).contains(&p.z)));
    }

    #[test]
    fn simple_projector_has_eight_distinct_corners() {
        let mesh = VolumeMesh::simple_frustum();
        let mut corners: Vec<[i32; 3]> =
            mesh.positions.iter().map(|p| [p.x as i32, p.y as i32, (p.z * 2.0) as i32]).collect();
        corners.sort();
        corners.dedup();
        assert_eq!(corners.len(), 8);
    }
}
