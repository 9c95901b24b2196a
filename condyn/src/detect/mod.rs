//! Per-step contact detection.
//!
//! Broad phase sweeps body bounding boxes; the narrow phase samples vertex
//! contacts against convex faces or mesh boundary triangles. The body whose
//! surface carries the hit face becomes the contact master; its outward
//! normal orients the local frame. Identical geometric input produces an
//! identical, sorted contact set.

mod broad;
mod narrow;

pub(crate) use narrow::local_base;

use crate::material::{SurfaceMaterial, SurfaceMaterialSet};
use crate::objects::{Body, BodyId, BodyRegistry, ContactAnchor, Kinematics};
use crate::shape::Aabb;
use crate::{Error, Mat3, Vec3};
use narrow::{FaceSet, RawContact};

/// A transient contact point. Reactions and local velocities live in the
/// assembled local-dynamics system, not here.
#[derive(Clone, Debug)]
pub struct Contact {
    pub master: BodyId,
    pub slave: BodyId,
    /// Spatial point on the master surface.
    pub point: Vec3,
    /// Local frame columns: two tangents, then the outward master normal.
    pub base: Mat3,
    /// Signed gap; negative means penetration.
    pub gap: f64,
    /// Tributary surface area of the sample.
    pub area: f64,
    pub surf: SurfaceMaterial,
    /// Face feature on the master, vertex feature on the slave.
    pub mfeat: u32,
    pub sfeat: u32,
    pub(crate) manchor: ContactAnchor,
    pub(crate) sanchor: ContactAnchor,
}

pub struct DetectionResult {
    pub contacts: Vec<Contact>,
    /// Near-miss samples dropped by the sparsification margin.
    pub sparsified: usize,
}

/// Spatial collision geometry of one body for this step.
struct Geometry<'a> {
    verts: Vec<Vec3>,
    /// Indices into `verts` used as contact samples.
    samples: Vec<u32>,
    faces: FaceSet<'a>,
    aabb: Aabb,
}

fn geometry(body: &Body) -> Option<Geometry<'_>> {
    let (verts, samples, faces) = match &body.kinematics {
        Kinematics::Obstacle => {
            let shape = body.hull.as_ref()?;
            let verts = shape.vertices().to_vec();
            let samples = (0..verts.len() as u32).collect();
            (verts, samples, FaceSet::Poly(shape.faces()))
        }
        Kinematics::Rigid(b) => {
            let shape = body.hull.as_ref()?;
            let verts = shape
                .vertices()
                .iter()
                .map(|x| b.center + b.rotation * (x - b.center_ref))
                .collect::<Vec<_>>();
            let samples = (0..verts.len() as u32).collect();
            (verts, samples, FaceSet::Poly(shape.faces()))
        }
        Kinematics::PseudoRigid(b) => {
            let shape = body.hull.as_ref()?;
            let verts = shape
                .vertices()
                .iter()
                .map(|x| b.center + b.def_grad * (x - b.center_ref))
                .collect::<Vec<_>>();
            let samples = (0..verts.len() as u32).collect();
            (verts, samples, FaceSet::Poly(shape.faces()))
        }
        Kinematics::FiniteElement(b) => (
            b.positions.clone(),
            b.surface_nodes().to_vec(),
            FaceSet::Tris(b.surface_tris()),
        ),
    };
    let aabb = Aabb::from_points(verts.iter())?;
    Some(Geometry {
        verts,
        samples,
        faces,
        aabb,
    })
}

/// Referential anchor of a slave sample vertex.
fn vertex_anchor(body: &Body, vertex: u32) -> ContactAnchor {
    match (&body.kinematics, &body.hull) {
        (Kinematics::Rigid(b), Some(shape)) => {
            ContactAnchor::Offset(shape.vertices()[vertex as usize] - b.center_ref)
        }
        (Kinematics::PseudoRigid(b), Some(shape)) => {
            ContactAnchor::Offset(shape.vertices()[vertex as usize] - b.center_ref)
        }
        (Kinematics::FiniteElement(_), _) => ContactAnchor::Nodes {
            nodes: [(vertex as usize, 1.0), (0, 0.0), (0, 0.0)],
            count: 1,
        },
        // Hull-backed kinds without a hull never yield samples.
        _ => ContactAnchor::Obstacle,
    }
}

/// Referential anchor of the master surface point.
fn face_anchor(body: &Body, raw: &RawContact) -> Result<ContactAnchor, Error> {
    if let Some((tri, bary)) = raw.bary {
        return Ok(ContactAnchor::Nodes {
            nodes: [
                (tri[0] as usize, bary[0]),
                (tri[1] as usize, bary[1]),
                (tri[2] as usize, bary[2]),
            ],
            count: 3,
        });
    }
    body.anchor_at(raw.point).ok_or(Error::DegenerateShape {
        label: body.label.clone(),
    })
}

/// Detects all contacts closer than `margin` between active bodies.
pub fn detect(
    registry: &BodyRegistry,
    surfaces: &SurfaceMaterialSet,
    margin: f64,
) -> Result<DetectionResult, Error> {
    let mut geoms: Vec<Option<Geometry>> = Vec::with_capacity(registry.len());
    let mut boxes = Vec::new();
    for (id, body) in registry.iter() {
        let geom = if body.active { geometry(body) } else { None };
        if let Some(g) = &geom {
            boxes.push((id, g.aabb.inflated(margin)));
        }
        geoms.push(geom);
    }

    let mut contacts = Vec::new();
    let mut sparsified = 0;
    let mut raw = Vec::new();

    for (a, b) in broad::overlapping_pairs(&boxes) {
        let body_a = registry.get(a);
        let body_b = registry.get(b);
        if body_a.is_obstacle() && body_b.is_obstacle() {
            continue;
        }
        let (Some(ga), Some(gb)) = (&geoms[a.0], &geoms[b.0]) else {
            continue;
        };
        // Both orientations: each body's surface plays the master once.
        for (master, mg, slave, sg) in [(a, ga, b, gb), (b, gb, a, ga)] {
            raw.clear();
            sparsified +=
                narrow::sample_contacts(&mg.verts, &mg.faces, &sg.verts, &sg.samples, margin, &mut raw);
            let surf = surfaces.lookup(registry.get(master).surface, registry.get(slave).surface);
            for rc in raw.drain(..) {
                let manchor = face_anchor(registry.get(master), &rc)?;
                let sanchor = vertex_anchor(registry.get(slave), rc.sfeat);
                contacts.push(Contact {
                    master,
                    slave,
                    point: rc.point,
                    base: local_base(rc.normal),
                    gap: rc.gap,
                    area: rc.area,
                    surf,
                    mfeat: rc.mfeat,
                    sfeat: rc.sfeat,
                    manchor,
                    sanchor,
                });
            }
        }
    }

    // One contact per (master, slave, slave vertex): keep the deepest.
    contacts.sort_by(|x, y| {
        (x.master, x.slave, x.sfeat)
            .cmp(&(y.master, y.slave, y.sfeat))
            .then(x.gap.total_cmp(&y.gap))
    });
    contacts.dedup_by(|b, a| a.master == b.master && a.slave == b.slave && a.sfeat == b.sfeat);

    log::debug!(
        "detection: {} contacts, {} sparsified",
        contacts.len(),
        sparsified
    );
    Ok(DetectionResult {
        contacts,
        sparsified,
    })
}
