//! Referential geometry handed to the engine at body creation.
//!
//! Shapes are immutable; current (spatial) configurations are derived from the
//! body state each step. Mass-property integrals use exact tetrahedral
//! decomposition against the coordinate origin.

use serde::{Deserialize, Serialize};

use crate::{Mat3, Vec3};

/// Axis-aligned bounding box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn from_points<'a, I>(points: I) -> Option<Aabb>
    where
        I: IntoIterator<Item = &'a Vec3>,
    {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut aabb = Aabb {
            min: first,
            max: first,
        };
        for p in iter {
            aabb.min = aabb.min.inf(p);
            aabb.max = aabb.max.sup(p);
        }
        Some(aabb)
    }

    pub fn inflated(mut self, margin: f64) -> Aabb {
        let m = Vec3::repeat(margin);
        self.min -= m;
        self.max += m;
        self
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
            && self.min.z <= other.max.z
            && other.min.z <= self.max.z
    }
}

/// Convex polyhedron given by vertices and planar faces.
///
/// Faces are stored with outward orientation (counter-clockwise seen from
/// outside); the constructor flips any face found pointing at the interior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConvexPolyhedron {
    vertices: Vec<Vec3>,
    faces: Vec<Vec<u32>>,
}

impl ConvexPolyhedron {
    pub fn new(vertices: Vec<Vec3>, mut faces: Vec<Vec<u32>>) -> Self {
        let interior = vertices.iter().sum::<Vec3>() / (vertices.len().max(1) as f64);
        for face in faces.iter_mut() {
            let n = newell_normal(face, &vertices);
            let p = vertices[face[0] as usize];
            if n.dot(&(p - interior)) < 0.0 {
                face.reverse();
            }
        }
        ConvexPolyhedron { vertices, faces }
    }

    /// Axis-aligned box spanning `min` to `max`.
    pub fn cuboid(min: Vec3, max: Vec3) -> Self {
        let (a, b) = (min, max);
        let vertices = vec![
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(b.x, b.y, b.z),
            Vec3::new(a.x, b.y, b.z),
        ];
        let faces = vec![
            vec![0, 3, 2, 1],
            vec![4, 5, 6, 7],
            vec![0, 1, 5, 4],
            vec![2, 3, 7, 6],
            vec![1, 2, 6, 5],
            vec![0, 4, 7, 3],
        ];
        ConvexPolyhedron::new(vertices, faces)
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn faces(&self) -> &[Vec<u32>] {
        &self.faces
    }

    /// Signed volume; positive for a well-formed outward-oriented hull.
    pub fn volume(&self) -> f64 {
        let mut vol = 0.0;
        self.for_each_tet(|a, b, c| vol += a.dot(&b.cross(&c)) / 6.0);
        vol
    }

    pub fn centroid(&self) -> Vec3 {
        let mut vol = 0.0;
        let mut first = Vec3::zeros();
        self.for_each_tet(|a, b, c| {
            let v = a.dot(&b.cross(&c)) / 6.0;
            vol += v;
            first += v / 4.0 * (a + b + c);
        });
        first / vol
    }

    /// Second moment `∫ Ξ Ξᵀ dV` about the centroid, unit density.
    pub fn euler_tensor(&self) -> Mat3 {
        let mut vol = 0.0;
        let mut second = Mat3::zeros();
        self.for_each_tet(|a, b, c| {
            let v = a.dot(&b.cross(&c)) / 6.0;
            vol += v;
            let s = a + b + c;
            second += v / 20.0
                * (a * a.transpose() + b * b.transpose() + c * c.transpose() + s * s.transpose());
        });
        let c = self.centroid();
        second - vol * c * c.transpose()
    }

    /// Visits the origin-anchored tetrahedron fan `(0, a, b, c)` of each face.
    fn for_each_tet<F: FnMut(Vec3, Vec3, Vec3)>(&self, mut f: F) {
        for face in &self.faces {
            let a = self.vertices[face[0] as usize];
            for w in face[1..].windows(2) {
                f(a, self.vertices[w[0] as usize], self.vertices[w[1] as usize]);
            }
        }
    }
}

pub(crate) fn newell_normal(face: &[u32], vertices: &[Vec3]) -> Vec3 {
    let mut n = Vec3::zeros();
    for i in 0..face.len() {
        let p = vertices[face[i] as usize];
        let q = vertices[face[(i + 1) % face.len()] as usize];
        n.x += (p.y - q.y) * (p.z + q.z);
        n.y += (p.z - q.z) * (p.x + q.x);
        n.z += (p.x - q.x) * (p.y + q.y);
    }
    n
}

/// Tetrahedral volume mesh for finite-element bodies.
///
/// Tetrahedra are reoriented to positive volume at construction so that the
/// boundary extraction below yields outward triangles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TetMesh {
    vertices: Vec<Vec3>,
    tets: Vec<[u32; 4]>,
}

impl TetMesh {
    pub fn new(vertices: Vec<Vec3>, mut tets: Vec<[u32; 4]>) -> Self {
        for tet in tets.iter_mut() {
            let [a, b, c, d] = *tet;
            let (pa, pb, pc, pd) = (
                vertices[a as usize],
                vertices[b as usize],
                vertices[c as usize],
                vertices[d as usize],
            );
            if (pb - pa).dot(&(pc - pa).cross(&(pd - pa))) < 0.0 {
                tet.swap(2, 3);
            }
        }
        TetMesh { vertices, tets }
    }

    /// Regular box mesh with six tetrahedra per cell (Kuhn subdivision).
    pub fn box_mesh(min: Vec3, max: Vec3, nx: usize, ny: usize, nz: usize) -> Self {
        let dims = [nx + 1, ny + 1, nz + 1];
        let idx = |i: usize, j: usize, k: usize| (i + dims[0] * (j + dims[1] * k)) as u32;
        let mut vertices = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    vertices.push(Vec3::new(
                        min.x + (max.x - min.x) * i as f64 / nx as f64,
                        min.y + (max.y - min.y) * j as f64 / ny as f64,
                        min.z + (max.z - min.z) * k as f64 / nz as f64,
                    ));
                }
            }
        }
        // Six path tetrahedra per cell, one per axis permutation.
        const PERMS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let mut tets = Vec::with_capacity(6 * nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    for perm in &PERMS {
                        let mut p = [i, j, k];
                        let mut tet = [idx(p[0], p[1], p[2]), 0, 0, 0];
                        for (t, &axis) in perm.iter().enumerate() {
                            p[axis] += 1;
                            tet[t + 1] = idx(p[0], p[1], p[2]);
                        }
                        tets.push(tet);
                    }
                }
            }
        }
        TetMesh::new(vertices, tets)
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn tets(&self) -> &[[u32; 4]] {
        &self.tets
    }

    /// Boundary triangles with outward orientation.
    pub fn surface_triangles(&self) -> Vec<[u32; 3]> {
        let mut count: ahash::AHashMap<[u32; 3], ([u32; 3], u32)> = ahash::AHashMap::new();
        for tet in &self.tets {
            let [a, b, c, d] = *tet;
            for tri in [[a, c, b], [a, b, d], [b, c, d], [a, d, c]] {
                let mut key = tri;
                key.sort_unstable();
                count
                    .entry(key)
                    .and_modify(|e| e.1 += 1)
                    .or_insert((tri, 1));
            }
        }
        let mut surface: Vec<[u32; 3]> = count
            .into_values()
            .filter_map(|(tri, n)| (n == 1).then_some(tri))
            .collect();
        surface.sort_unstable();
        surface
    }

    /// Vertex indices touching the boundary, ascending.
    pub fn surface_nodes(&self) -> Vec<u32> {
        let mut nodes: Vec<u32> = self
            .surface_triangles()
            .into_iter()
            .flatten()
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}
