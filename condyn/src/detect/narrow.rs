//! Narrow phase: point-sampled vertex-against-surface contacts.
//!
//! Each sample vertex of one body is tested against the faces of the other.
//! For a convex face set the signed gap is the maximum signed plane distance
//! and the maximizing face provides the normal; for a mesh boundary the
//! nearest surface triangle does. Edge-edge closest-feature pairs are not
//! generated; face sampling covers them on the shapes the engine supports.

use crate::shape::newell_normal;
use crate::{Mat3, Vec3};

/// A contact sample before anchors and materials are resolved. The face side
/// becomes the master, the vertex side the slave.
pub(crate) struct RawContact {
    /// Point on the master surface.
    pub point: Vec3,
    /// Outward master normal.
    pub normal: Vec3,
    pub gap: f64,
    pub area: f64,
    /// Face (or surface-triangle) index on the master.
    pub mfeat: u32,
    /// Sample vertex index on the slave.
    pub sfeat: u32,
    /// Barycentric attachment on the master triangle, for mesh masters.
    pub bary: Option<([u32; 3], [f64; 3])>,
}

pub(crate) enum FaceSet<'a> {
    Poly(&'a [Vec<u32>]),
    Tris(&'a [[u32; 3]]),
}

/// Tests every sample of the vertex side against the face side. Contacts
/// with `gap <= margin` are emitted; samples with a gap inside `(margin,
/// 2·margin]` count as sparsified.
pub(crate) fn sample_contacts(
    face_verts: &[Vec3],
    faces: &FaceSet,
    vert_points: &[Vec3],
    vert_samples: &[u32],
    margin: f64,
    out: &mut Vec<RawContact>,
) -> usize {
    let mut sparsified = 0;
    for &sample in vert_samples {
        let v = vert_points[sample as usize];
        let hit = match faces {
            FaceSet::Poly(polys) => max_plane_gap(face_verts, polys, v),
            FaceSet::Tris(tris) => nearest_triangle_gap(face_verts, tris, v),
        };
        let Some(hit) = hit else { continue };
        if hit.gap <= margin {
            out.push(RawContact {
                sfeat: sample,
                ..hit
            });
        } else if hit.gap <= 2.0 * margin {
            sparsified += 1;
        }
    }
    sparsified
}

/// Signed distance to a convex face set: max signed plane distance.
fn max_plane_gap(verts: &[Vec3], faces: &[Vec<u32>], v: Vec3) -> Option<RawContact> {
    let mut best: Option<(f64, usize, Vec3)> = None;
    for (fi, face) in faces.iter().enumerate() {
        let n = newell_normal(face, verts);
        let len = n.norm();
        if !(len > 0.0) {
            continue;
        }
        let n = n / len;
        let d = n.dot(&(v - verts[face[0] as usize]));
        if best.map_or(true, |(g, _, _)| d > g) {
            best = Some((d, fi, n));
        }
    }
    let (gap, fi, normal) = best?;
    Some(RawContact {
        point: v - gap * normal,
        normal,
        gap,
        area: face_area(&faces[fi], verts) / faces[fi].len() as f64,
        mfeat: fi as u32,
        sfeat: 0,
        bary: None,
    })
}

fn face_area(face: &[u32], verts: &[Vec3]) -> f64 {
    0.5 * newell_normal(face, verts).norm()
}

/// Signed distance to a mesh boundary: nearest surface triangle, signed by
/// its outward normal.
fn nearest_triangle_gap(verts: &[Vec3], tris: &[[u32; 3]], v: Vec3) -> Option<RawContact> {
    let mut best: Option<(f64, usize, Vec3, [f64; 3])> = None;
    for (ti, tri) in tris.iter().enumerate() {
        let (a, b, c) = (
            verts[tri[0] as usize],
            verts[tri[1] as usize],
            verts[tri[2] as usize],
        );
        let (p, bary) = closest_point_on_triangle(v, a, b, c);
        let d2 = (v - p).norm_squared();
        if best.map_or(true, |(bd, _, _, _)| d2 < bd) {
            best = Some((d2, ti, p, bary));
        }
    }
    let (d2, ti, p, bary) = best?;
    let tri = tris[ti];
    let (a, b, c) = (
        verts[tri[0] as usize],
        verts[tri[1] as usize],
        verts[tri[2] as usize],
    );
    let n = (b - a).cross(&(c - a));
    let nlen = n.norm();
    if !(nlen > 0.0) {
        return None;
    }
    let n = n / nlen;
    let sign = if n.dot(&(v - p)) < 0.0 { -1.0 } else { 1.0 };
    Some(RawContact {
        point: p,
        normal: n,
        gap: sign * d2.sqrt(),
        area: 0.5 * nlen / 3.0,
        mfeat: ti as u32,
        sfeat: 0,
        bary: Some((tri, bary)),
    })
}

/// Closest point on a triangle and its barycentric coordinates.
fn closest_point_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> (Vec3, [f64; 3]) {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return (a, [1.0, 0.0, 0.0]);
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return (b, [0.0, 1.0, 0.0]);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let t = d1 / (d1 - d3);
        return (a + t * ab, [1.0 - t, t, 0.0]);
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return (c, [0.0, 0.0, 1.0]);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let t = d2 / (d2 - d6);
        return (a + t * ac, [1.0 - t, 0.0, t]);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let t = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return (b + t * (c - b), [0.0, 1.0 - t, t]);
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    (a + ab * v + ac * w, [1.0 - v - w, v, w])
}

/// Orthonormal contact frame with the normal in the last column.
pub(crate) fn local_base(normal: Vec3) -> Mat3 {
    let n = normal.normalize();
    // Pick the axis least aligned with the normal for a stable tangent.
    let helper = if n.x.abs() <= n.y.abs() && n.x.abs() <= n.z.abs() {
        Vec3::x()
    } else if n.y.abs() <= n.z.abs() {
        Vec3::y()
    } else {
        Vec3::z()
    };
    let t1 = n.cross(&helper).normalize();
    let t2 = n.cross(&t1);
    Mat3::from_columns(&[t1, t2, n])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ConvexPolyhedron;
    use approx::assert_relative_eq;

    #[test]
    fn plane_gap_signs() {
        let hull = ConvexPolyhedron::cuboid(Vec3::zeros(), Vec3::repeat(1.0));
        let above = max_plane_gap(hull.vertices(), hull.faces(), Vec3::new(0.5, 0.5, 1.2)).unwrap();
        assert_relative_eq!(above.gap, 0.2, epsilon = 1e-12);
        assert_relative_eq!(above.normal.z, 1.0, epsilon = 1e-12);

        let inside = max_plane_gap(hull.vertices(), hull.faces(), Vec3::new(0.5, 0.5, 0.9)).unwrap();
        assert_relative_eq!(inside.gap, -0.1, epsilon = 1e-12);
    }

    #[test]
    fn triangle_closest_point_regions() {
        let (a, b, c) = (Vec3::zeros(), Vec3::x(), Vec3::y());
        // Interior projection.
        let (p, bary) = closest_point_on_triangle(Vec3::new(0.25, 0.25, 1.0), a, b, c);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-12);
        assert_relative_eq!(bary[0], 0.5, epsilon = 1e-12);
        // Vertex region.
        let (p, bary) = closest_point_on_triangle(Vec3::new(-1.0, -1.0, 0.0), a, b, c);
        assert_eq!(p, a);
        assert_eq!(bary, [1.0, 0.0, 0.0]);
        // Edge region.
        let (p, _) = closest_point_on_triangle(Vec3::new(0.5, -1.0, 0.0), a, b, c);
        assert_relative_eq!(p.x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn base_is_orthonormal_right_handed() {
        for n in [Vec3::z(), Vec3::new(1.0, 2.0, -0.5), Vec3::x()] {
            let base = local_base(n);
            let t1 = base.column(0);
            let t2 = base.column(1);
            let nn = base.column(2);
            assert_relative_eq!(t1.dot(&t2), 0.0, epsilon = 1e-12);
            assert_relative_eq!(t1.dot(&nn), 0.0, epsilon = 1e-12);
            assert_relative_eq!(base.determinant(), 1.0, epsilon = 1e-12);
        }
    }
}
