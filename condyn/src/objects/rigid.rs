//! Rigid body dynamics with referential angular velocity.
//!
//! Configuration is the rotation matrix plus the mass-center position; the
//! angular velocity lives in the referential frame where the inertia tensor J
//! is constant. Rotations advance through the exponential map.

use super::{expmap, ContactAnchor, PointForce};
use crate::material::BulkMaterial;
use crate::shape::ConvexPolyhedron;
use crate::{Mat3, Vec3};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RigidScheme {
    /// Explicit exponential-map update; drifts energy upward.
    Explicit,
    /// Auxiliary-momentum variant with a slight downward energy drift.
    Stabilized,
    /// Fixed-point solve for the end-step angular velocity.
    Implicit,
}

impl Default for RigidScheme {
    fn default() -> Self {
        RigidScheme::Stabilized
    }
}

pub struct RigidBody {
    pub scheme: RigidScheme,
    pub mass: f64,
    /// Referential inertia tensor about the mass center.
    pub inertia: Mat3,
    inv_inertia: Mat3,
    pub center_ref: Vec3,
    pub center: Vec3,
    pub rotation: Mat3,
    /// Referential angular velocity.
    pub angvel: Vec3,
    pub linvel: Vec3,
    angvel0: Vec3,
    linvel0: Vec3,
    /// Auxiliary momentum of the stabilized and implicit schemes.
    aux: Vec3,
    con_torque: Vec3,
    con_force: Vec3,
}

impl RigidBody {
    pub(crate) fn new(
        shape: &ConvexPolyhedron,
        bulk: &BulkMaterial,
        scheme: RigidScheme,
    ) -> Option<Self> {
        let volume = shape.volume();
        if !(volume > 1e-12) {
            return None;
        }
        let mass = bulk.density * volume;
        let euler = bulk.density * shape.euler_tensor();
        let inertia = Mat3::identity() * euler.trace() - euler;
        let inv_inertia = inertia.try_inverse()?;
        let center_ref = shape.centroid();
        Some(RigidBody {
            scheme,
            mass,
            inertia,
            inv_inertia,
            center_ref,
            center: center_ref,
            rotation: Mat3::identity(),
            angvel: Vec3::zeros(),
            linvel: Vec3::zeros(),
            angvel0: Vec3::zeros(),
            linvel0: Vec3::zeros(),
            aux: Vec3::zeros(),
            con_torque: Vec3::zeros(),
            con_force: Vec3::zeros(),
        })
    }

    pub fn set_velocity(&mut self, linear: Vec3, angular_ref: Vec3) {
        self.linvel = linear;
        self.angvel = angular_ref;
    }

    /// Referential torque and linear resultant of the applied loads at the
    /// given trial rotation.
    fn external_force(
        &self,
        gravity: Vec3,
        forces: &[PointForce],
        rotation: &Mat3,
    ) -> (Vec3, Vec3) {
        let mut spatorq = Vec3::zeros();
        let mut linforc = self.mass * gravity;
        for frc in forces {
            let arm = rotation * (frc.point - self.center_ref);
            spatorq += arm.cross(&frc.force);
            linforc += frc.force;
        }
        (rotation.transpose() * spatorq, linforc)
    }

    pub(crate) fn step_begin(
        &mut self,
        h: f64,
        gravity: Vec3,
        forces: &[PointForce],
        quasistatic: bool,
    ) {
        self.con_torque = Vec3::zeros();
        self.con_force = Vec3::zeros();
        self.angvel0 = self.angvel;
        self.linvel0 = self.linvel;

        if quasistatic {
            // Predicted end-step configuration drives the force evaluation;
            // the velocity is rebuilt from scratch every step.
            let dr = expmap(h * self.angvel);
            let rot = self.rotation * dr;
            let (torque, linforc) = self.external_force(gravity, forces, &rot);
            let w1 = self.inv_inertia
                * (dr.transpose() * (self.inertia * self.angvel) + h * torque);
            let torque_eff = torque - w1.cross(&(self.inertia * w1));
            self.angvel = h * (self.inv_inertia * torque_eff);
            self.linvel = (h / self.mass) * linforc;
            return;
        }

        let half = 0.5 * h;
        let dr = expmap(half * self.angvel);
        self.rotation *= dr;
        self.center += half * self.linvel;

        let (torque, linforc) = self.external_force(gravity, forces, &self.rotation);

        if self.scheme != RigidScheme::Explicit {
            // A = exp[-(h/2)W(t)] J W(t) + h T(t+h/2)
            self.aux = dr.transpose() * (self.inertia * self.angvel) + h * torque;
        }

        let w05 = self.inv_inertia
            * (dr.transpose() * (self.inertia * self.angvel) + half * torque);
        let torque_eff = torque - w05.cross(&(self.inertia * w05));

        self.angvel += h * (self.inv_inertia * torque_eff);
        self.linvel += (h / self.mass) * linforc;
    }

    pub(crate) fn step_end(&mut self, h: f64, quasistatic: bool) {
        let half = 0.5 * h;

        self.angvel += h * (self.inv_inertia * self.con_torque);
        self.linvel += (h / self.mass) * self.con_force;

        if quasistatic {
            self.center += h * self.linvel;
            self.rotation *= expmap(h * self.angvel);
            return;
        }

        self.center += half * self.linvel;

        let mut dr = Mat3::identity();
        if self.scheme != RigidScheme::Implicit {
            dr = expmap(half * self.angvel);
            self.rotation *= dr; // R(t+h) = R(t+h/2) exp[(h/2) W(t+h)]
        }

        if self.scheme != RigidScheme::Explicit {
            self.aux += h * self.con_torque;

            if self.scheme == RigidScheme::Stabilized {
                self.angvel = self.inv_inertia * (dr.transpose() * self.aux);
            } else if let Some(dr) = solve_momentum(half, &self.inertia, &mut self.angvel, self.aux)
            {
                self.rotation *= dr;
            } else {
                log::warn!("implicit angular update did not converge; keeping explicit velocity");
                self.rotation *= expmap(half * self.angvel);
            }
        }
    }

    pub(crate) fn point_velocity(&self, anchor: &ContactAnchor, prev: bool) -> Vec3 {
        let (w, v) = if prev {
            (self.angvel0, self.linvel0)
        } else {
            (self.angvel, self.linvel)
        };
        match anchor {
            ContactAnchor::Offset(xi) => v + self.rotation * w.cross(xi),
            _ => v,
        }
    }

    pub(crate) fn inv_inertia_contraction(&self, a: &ContactAnchor, b: &ContactAnchor) -> Mat3 {
        let (xa, xb) = match (a, b) {
            (ContactAnchor::Offset(xa), ContactAnchor::Offset(xb)) => (*xa, *xb),
            _ => return Mat3::zeros(),
        };
        let rot = &self.rotation;
        rot * skew(xa) * self.inv_inertia * skew(xb).transpose() * rot.transpose()
            + Mat3::identity() / self.mass
    }

    pub(crate) fn apply_contact_force(&mut self, anchor: &ContactAnchor, force: Vec3) {
        if let ContactAnchor::Offset(xi) = anchor {
            self.con_torque += xi.cross(&(self.rotation.transpose() * force));
        }
        self.con_force += force;
    }

    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.linvel.norm_squared()
            + 0.5 * self.angvel.dot(&(self.inertia * self.angvel))
    }

    /// Snapshot layout: rotation (column-major) + center; angvel + linvel.
    pub(crate) fn capture(&self) -> (Vec<f64>, Vec<f64>) {
        let mut conf = Vec::with_capacity(12);
        conf.extend(self.rotation.iter());
        conf.extend(self.center.iter());
        let mut velo = Vec::with_capacity(6);
        velo.extend(self.angvel.iter());
        velo.extend(self.linvel.iter());
        (conf, velo)
    }

    pub(crate) fn restore(&mut self, conf: &[f64], velo: &[f64]) -> bool {
        if conf.len() != 12 || velo.len() != 6 {
            return false;
        }
        self.rotation = Mat3::from_column_slice(&conf[..9]);
        self.center = Vec3::from_column_slice(&conf[9..]);
        self.angvel = Vec3::from_column_slice(&velo[..3]);
        self.linvel = Vec3::from_column_slice(&velo[3..]);
        true
    }
}

pub(crate) fn skew(v: Vec3) -> Mat3 {
    Mat3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Solves `exp[hW] J W = G` for the angular velocity by fixed-point
/// iteration, returning `exp[hW]` on convergence.
fn solve_momentum(h: f64, inertia: &Mat3, angvel: &mut Vec3, momentum: Vec3) -> Option<Mat3> {
    let inv = inertia.try_inverse()?;
    let mut w = *angvel;
    let level = 1e-12 * h.max(1e-30);
    for _ in 0..64 {
        let dr = expmap(h * w);
        let residual = dr * (inertia * w) - momentum;
        if !residual.iter().all(|x| x.is_finite()) {
            return None;
        }
        if residual.amax() <= level {
            *angvel = w;
            return Some(dr);
        }
        w = inv * (dr.transpose() * momentum);
    }
    // Accept the last iterate; the residual level is far below the
    // discretization error of the step itself.
    let dr = expmap(h * w);
    if w.iter().all(|x| x.is_finite()) {
        *angvel = w;
        Some(dr)
    } else {
        None
    }
}
