//! Body registry and the per-kind kinematic models.
//!
//! Each body kind owns its configuration, velocity and inertia and knows how
//! to advance itself with the two-half-step leapfrog scheme: `step_begin`
//! advances the configuration to the mid-step and produces the free velocity,
//! the contact solve supplies average reaction forces through
//! `apply_contact_force`, and `step_end` commits the constrained velocity and
//! the end-step configuration. Obstacles never move.

pub mod fem;
pub mod pseudo_rigid;
pub mod rigid;

pub use fem::{FemBody, FemFormulation, ReducedModel};
pub use pseudo_rigid::{PseudoRigidBody, PseudoRigidScheme};
pub use rigid::{RigidBody, RigidScheme};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::material::BulkMaterial;
use crate::shape::{ConvexPolyhedron, TetMesh};
use crate::{Error, Mat3, Vec3};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BodyId(pub usize);

/// Referential attachment of a contact point to one body.
///
/// Built at detection time; consumed by the local-dynamics assembler and by
/// the constraint-force accumulation at `step_end`.
#[derive(Clone, Debug)]
pub(crate) enum ContactAnchor {
    Obstacle,
    /// Referential offset from the mass center.
    Offset(Vec3),
    /// Weighted mesh nodes (a single node for vertex-side contacts, up to
    /// three barycentric nodes for face-side contacts).
    Nodes {
        nodes: [(usize, f64); 3],
        count: u8,
    },
}

impl ContactAnchor {
    pub(crate) fn nodes(&self) -> &[(usize, f64)] {
        match self {
            ContactAnchor::Nodes { nodes, count } => &nodes[..*count as usize],
            _ => &[],
        }
    }
}

/// External point force: spatial direction applied at a referential point.
#[derive(Copy, Clone, Debug)]
pub struct PointForce {
    pub point: Vec3,
    pub force: Vec3,
}

pub enum Kinematics {
    Obstacle,
    Rigid(RigidBody),
    PseudoRigid(PseudoRigidBody),
    FiniteElement(FemBody),
}

pub struct Body {
    pub label: String,
    pub bulk: Arc<BulkMaterial>,
    pub surface: u32,
    pub active: bool,
    pub kinematics: Kinematics,
    pub point_forces: Vec<PointForce>,
    /// Obstacles and rigid/pseudo-rigid bodies collide through a convex hull;
    /// finite-element bodies collide through their mesh boundary.
    pub(crate) hull: Option<ConvexPolyhedron>,
}

impl Body {
    pub fn obstacle(label: impl Into<String>, shape: ConvexPolyhedron, surface: u32) -> Self {
        Body {
            label: label.into(),
            bulk: Arc::new(BulkMaterial::new(1.0, 0.0, 1.0)),
            surface,
            active: true,
            kinematics: Kinematics::Obstacle,
            point_forces: Vec::new(),
            hull: Some(shape),
        }
    }

    pub fn rigid(
        label: impl Into<String>,
        shape: ConvexPolyhedron,
        bulk: Arc<BulkMaterial>,
        surface: u32,
        scheme: RigidScheme,
    ) -> Result<Self, Error> {
        let label = label.into();
        let body = RigidBody::new(&shape, &bulk, scheme).ok_or(Error::DegenerateShape {
            label: label.clone(),
        })?;
        Ok(Body {
            label,
            bulk,
            surface,
            active: true,
            kinematics: Kinematics::Rigid(body),
            point_forces: Vec::new(),
            hull: Some(shape),
        })
    }

    pub fn pseudo_rigid(
        label: impl Into<String>,
        shape: ConvexPolyhedron,
        bulk: Arc<BulkMaterial>,
        surface: u32,
        scheme: PseudoRigidScheme,
    ) -> Result<Self, Error> {
        let label = label.into();
        let body = PseudoRigidBody::new(&shape, &bulk, scheme).ok_or(Error::DegenerateShape {
            label: label.clone(),
        })?;
        Ok(Body {
            label,
            bulk,
            surface,
            active: true,
            kinematics: Kinematics::PseudoRigid(body),
            point_forces: Vec::new(),
            hull: Some(shape),
        })
    }

    pub fn finite_element(
        label: impl Into<String>,
        mesh: TetMesh,
        bulk: Arc<BulkMaterial>,
        surface: u32,
        formulation: FemFormulation,
    ) -> Result<Self, Error> {
        let label = label.into();
        let body = FemBody::new(mesh, &bulk, formulation).map_err(|e| match e {
            fem::FemBuildError::Degenerate => Error::DegenerateShape {
                label: label.clone(),
            },
            fem::FemBuildError::ModelMismatch { expected, got } => {
                Error::ReducedModelMismatch { expected, got }
            }
        })?;
        Ok(Body {
            label,
            bulk,
            surface,
            active: true,
            kinematics: Kinematics::FiniteElement(body),
            point_forces: Vec::new(),
            hull: None,
        })
    }

    pub fn with_point_force(mut self, point: Vec3, force: Vec3) -> Self {
        self.point_forces.push(PointForce { point, force });
        self
    }

    pub fn is_obstacle(&self) -> bool {
        matches!(self.kinematics, Kinematics::Obstacle)
    }

    /// Mass; obstacles report zero (they never enter inertia contractions).
    pub fn mass(&self) -> f64 {
        match &self.kinematics {
            Kinematics::Obstacle => 0.0,
            Kinematics::Rigid(b) => b.mass,
            Kinematics::PseudoRigid(b) => b.mass,
            Kinematics::FiniteElement(b) => b.mass(),
        }
    }

    pub fn dofs(&self) -> usize {
        match &self.kinematics {
            Kinematics::Obstacle => 0,
            Kinematics::Rigid(_) => 6,
            Kinematics::PseudoRigid(_) => 12,
            Kinematics::FiniteElement(b) => b.dofs(),
        }
    }

    /// Stability bound of the explicit schemes; unbounded for rigid bodies
    /// and obstacles.
    pub fn critical_time_step(&self) -> f64 {
        match &self.kinematics {
            Kinematics::Obstacle | Kinematics::Rigid(_) => f64::MAX,
            Kinematics::PseudoRigid(b) => b.critical_time_step(),
            Kinematics::FiniteElement(b) => b.critical_time_step(),
        }
    }

    pub fn kinetic_energy(&self) -> f64 {
        match &self.kinematics {
            Kinematics::Obstacle => 0.0,
            Kinematics::Rigid(b) => b.kinetic_energy(),
            Kinematics::PseudoRigid(b) => b.kinetic_energy(),
            Kinematics::FiniteElement(b) => b.kinetic_energy(),
        }
    }

    pub fn internal_energy(&self) -> f64 {
        match &self.kinematics {
            Kinematics::Obstacle | Kinematics::Rigid(_) => 0.0,
            Kinematics::PseudoRigid(b) => b.internal_energy(),
            Kinematics::FiniteElement(b) => b.internal_energy(),
        }
    }

    pub fn step_begin(&mut self, h: f64, gravity: Vec3, quasistatic: bool) {
        let forces = &self.point_forces;
        match &mut self.kinematics {
            Kinematics::Obstacle => {}
            Kinematics::Rigid(b) => b.step_begin(h, gravity, forces, quasistatic),
            Kinematics::PseudoRigid(b) => b.step_begin(h, gravity, forces, quasistatic),
            Kinematics::FiniteElement(b) => b.step_begin(h, gravity, forces, quasistatic),
        }
    }

    pub fn step_end(&mut self, h: f64, quasistatic: bool) {
        match &mut self.kinematics {
            Kinematics::Obstacle => {}
            Kinematics::Rigid(b) => b.step_end(h, quasistatic),
            Kinematics::PseudoRigid(b) => b.step_end(h, quasistatic),
            Kinematics::FiniteElement(b) => b.step_end(h, quasistatic),
        }
    }

    /// Spatial velocity of the anchored point under the current velocity.
    pub(crate) fn point_velocity(&self, anchor: &ContactAnchor) -> Vec3 {
        match &self.kinematics {
            Kinematics::Obstacle => Vec3::zeros(),
            Kinematics::Rigid(b) => b.point_velocity(anchor, false),
            Kinematics::PseudoRigid(b) => b.point_velocity(anchor, false),
            Kinematics::FiniteElement(b) => b.point_velocity(anchor, false),
        }
    }

    /// Same, under the velocity saved at the start of the step.
    pub(crate) fn prev_point_velocity(&self, anchor: &ContactAnchor) -> Vec3 {
        match &self.kinematics {
            Kinematics::Obstacle => Vec3::zeros(),
            Kinematics::Rigid(b) => b.point_velocity(anchor, true),
            Kinematics::PseudoRigid(b) => b.point_velocity(anchor, true),
            Kinematics::FiniteElement(b) => b.point_velocity(anchor, true),
        }
    }

    /// Spatial `H M⁻¹ Hᵀ` contraction between two anchored points of this
    /// body. Zero for obstacles.
    pub(crate) fn inv_inertia_contraction(&self, a: &ContactAnchor, b: &ContactAnchor) -> Mat3 {
        match &self.kinematics {
            Kinematics::Obstacle => Mat3::zeros(),
            Kinematics::Rigid(body) => body.inv_inertia_contraction(a, b),
            Kinematics::PseudoRigid(body) => body.inv_inertia_contraction(a, b),
            Kinematics::FiniteElement(body) => body.inv_inertia_contraction(a, b),
        }
    }

    /// Accumulates an average spatial reaction force applied at the anchor.
    pub(crate) fn apply_contact_force(&mut self, anchor: &ContactAnchor, force: Vec3) {
        match &mut self.kinematics {
            Kinematics::Obstacle => {}
            Kinematics::Rigid(b) => b.apply_contact_force(anchor, force),
            Kinematics::PseudoRigid(b) => b.apply_contact_force(anchor, force),
            Kinematics::FiniteElement(b) => b.apply_contact_force(anchor, force),
        }
    }

    /// Flattened configuration and velocity for snapshot output.
    pub fn capture_state(&self) -> (Vec<f64>, Vec<f64>) {
        match &self.kinematics {
            Kinematics::Obstacle => (Vec::new(), Vec::new()),
            Kinematics::Rigid(b) => b.capture(),
            Kinematics::PseudoRigid(b) => b.capture(),
            Kinematics::FiniteElement(b) => b.capture(),
        }
    }

    /// Overwrites configuration and velocity from a captured state; a layout
    /// mismatch leaves the body untouched.
    pub fn restore_state(&mut self, conf: &[f64], velo: &[f64]) -> bool {
        match &mut self.kinematics {
            Kinematics::Obstacle => conf.is_empty() && velo.is_empty(),
            Kinematics::Rigid(b) => b.restore(conf, velo),
            Kinematics::PseudoRigid(b) => b.restore(conf, velo),
            Kinematics::FiniteElement(b) => b.restore(conf, velo),
        }
    }

    /// Maps a spatial point on this body back to its referential anchor.
    pub(crate) fn anchor_at(&self, spatial: Vec3) -> Option<ContactAnchor> {
        match &self.kinematics {
            Kinematics::Obstacle => Some(ContactAnchor::Obstacle),
            Kinematics::Rigid(b) => Some(ContactAnchor::Offset(
                b.rotation.transpose() * (spatial - b.center),
            )),
            Kinematics::PseudoRigid(b) => {
                let inv = b.def_grad.try_inverse()?;
                Some(ContactAnchor::Offset(inv * (spatial - b.center)))
            }
            // Mesh bodies anchor to surface nodes; the detector builds those
            // anchors directly from the hit triangle.
            Kinematics::FiniteElement(_) => None,
        }
    }
}

pub struct BodyRegistry {
    bodies: Vec<Body>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        BodyRegistry { bodies: Vec::new() }
    }

    pub fn add(&mut self, body: Body) -> BodyId {
        let id = BodyId(self.bodies.len());
        log::debug!(
            "registered body {:?} ({:?}, {} dofs)",
            id,
            body.label,
            body.dofs()
        );
        self.bodies.push(body);
        id
    }

    pub fn get(&self, id: BodyId) -> &Body {
        &self.bodies[id.0]
    }

    pub fn get_mut(&mut self, id: BodyId) -> &mut Body {
        &mut self.bodies[id.0]
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BodyId, &Body)> {
        self.bodies.iter().enumerate().map(|(i, b)| (BodyId(i), b))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BodyId, &mut Body)> {
        self.bodies
            .iter_mut()
            .enumerate()
            .map(|(i, b)| (BodyId(i), b))
    }
}

impl Default for BodyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rotation through the exponential map of a rotation vector.
pub(crate) fn expmap(omega: Vec3) -> Mat3 {
    let angle = omega.norm();
    if angle < 1e-15 {
        return Mat3::identity();
    }
    na::Rotation3::from_axis_angle(&na::Unit::new_unchecked(omega / angle), angle).into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::BulkMaterial;
    use crate::shape::ConvexPolyhedron;
    use approx::assert_relative_eq;

    fn unit_cube_body() -> Body {
        let bulk = BulkMaterial::new(1.0e9, 0.25, 1.0e3).validated().unwrap();
        Body::rigid(
            "cube",
            ConvexPolyhedron::cuboid(Vec3::repeat(-0.5), Vec3::repeat(0.5)),
            bulk,
            0,
            RigidScheme::Stabilized,
        )
        .unwrap()
    }

    #[test]
    fn expmap_rotates_about_axis() {
        let r = expmap(Vec3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
        let v = r * Vec3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(v.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rigid_cube_mass_properties() {
        let body = unit_cube_body();
        assert_relative_eq!(body.mass(), 1000.0, max_relative = 1e-10);
        if let Kinematics::Rigid(b) = &body.kinematics {
            // Unit cube inertia: m a² / 6 on the diagonal.
            assert_relative_eq!(b.inertia[(0, 0)], 1000.0 / 6.0, max_relative = 1e-9);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn free_fall_matches_gravity() {
        let mut body = unit_cube_body();
        let h = 1e-3;
        let g = Vec3::new(0.0, 0.0, -10.0);
        body.step_begin(h, g, false);
        body.step_end(h, false);
        if let Kinematics::Rigid(b) = &body.kinematics {
            assert_relative_eq!(b.linvel.z, -10.0 * h, max_relative = 1e-12);
        }
    }
}
