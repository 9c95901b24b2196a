//! Pseudo-rigid body: translation plus a single homogeneous deformation
//! gradient F (12 degrees of freedom).
//!
//! The internal force derives from the Saint Venant-Kirchhoff law; the
//! generalized mass couples the rows of F through the referential Euler
//! tensor, so the inverse-mass action is a right-multiplication by its
//! inverse. Deformation velocities are flattened row-major (`3k + j`) where a
//! 9-vector view is needed.

use super::{ContactAnchor, PointForce};
use crate::material::BulkMaterial;
use crate::shape::ConvexPolyhedron;
use crate::{Mat3, Vec3};

type Mat9 = na::SMatrix<f64, 9, 9>;
type Vec9 = na::SVector<f64, 9>;
type Lu9 = na::LU<f64, na::Const<9>, na::Const<9>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PseudoRigidScheme {
    Explicit,
    /// Linearly implicit deformation update; tangent taken at the reference
    /// configuration and factorized once per step size.
    Limited,
    /// Implicit deformation update with the tangent rebuilt at the mid-step
    /// configuration.
    Implicit,
}

impl Default for PseudoRigidScheme {
    fn default() -> Self {
        PseudoRigidScheme::Explicit
    }
}

pub struct PseudoRigidBody {
    pub scheme: PseudoRigidScheme,
    pub mass: f64,
    /// Referential Euler tensor `ρ ∫ Ξ Ξᵀ dV`.
    euler: Mat3,
    inv_euler: Mat3,
    pub center_ref: Vec3,
    pub center: Vec3,
    pub def_grad: Mat3,
    pub linvel: Vec3,
    pub def_vel: Mat3,
    linvel0: Vec3,
    def_vel0: Mat3,
    ref_volume: f64,
    lambda: f64,
    mu: f64,
    /// Factorized deformation operator of the current step, when the scheme
    /// is not explicit (also carries the step size it was built for).
    op: Option<(f64, Lu9)>,
    con_force: Vec3,
    con_def: Mat3,
}

impl PseudoRigidBody {
    pub(crate) fn new(
        shape: &ConvexPolyhedron,
        bulk: &BulkMaterial,
        scheme: PseudoRigidScheme,
    ) -> Option<Self> {
        let volume = shape.volume();
        if !(volume > 1e-12) {
            return None;
        }
        let euler = bulk.density * shape.euler_tensor();
        let inv_euler = euler.try_inverse()?;
        let center_ref = shape.centroid();
        Some(PseudoRigidBody {
            scheme,
            mass: bulk.density * volume,
            euler,
            inv_euler,
            center_ref,
            center: center_ref,
            def_grad: Mat3::identity(),
            linvel: Vec3::zeros(),
            def_vel: Mat3::zeros(),
            linvel0: Vec3::zeros(),
            def_vel0: Mat3::zeros(),
            ref_volume: volume,
            lambda: bulk.lambda(),
            mu: bulk.mu(),
            op: None,
            con_force: Vec3::zeros(),
            con_def: Mat3::zeros(),
        })
    }

    pub fn set_velocity(&mut self, linear: Vec3, deformation: Mat3) {
        self.linvel = linear;
        self.def_vel = deformation;
    }

    /// First Piola-Kirchhoff stress of the Saint Venant-Kirchhoff law.
    fn first_pk(&self, f: &Mat3) -> Mat3 {
        let e = 0.5 * (f.transpose() * f - Mat3::identity());
        let s = self.lambda * e.trace() * Mat3::identity() + 2.0 * self.mu * e;
        f * s
    }

    /// Directional derivative of `V₀ P(F)` along `df`.
    fn tangent_apply(&self, f: &Mat3, df: &Mat3) -> Mat3 {
        let e = 0.5 * (f.transpose() * f - Mat3::identity());
        let s = self.lambda * e.trace() * Mat3::identity() + 2.0 * self.mu * e;
        let de = 0.5 * (df.transpose() * f + f.transpose() * df);
        let ds = self.lambda * de.trace() * Mat3::identity() + 2.0 * self.mu * de;
        self.ref_volume * (df * s + f * ds)
    }

    /// Deformation-space stiffness at `f`, flattened to the 9-vector layout.
    fn stiffness(&self, f: &Mat3) -> Mat9 {
        let mut k = Mat9::zeros();
        for col in 0..9 {
            let mut basis = Mat3::zeros();
            basis[(col / 3, col % 3)] = 1.0;
            k.set_column(col, &vec9(&self.tangent_apply(f, &basis)));
        }
        k
    }

    /// Generalized mass over the deformation dofs, same layout.
    fn mass9(&self) -> Mat9 {
        let mut m = Mat9::zeros();
        for k in 0..3 {
            for j in 0..3 {
                for jj in 0..3 {
                    m[(3 * k + j, 3 * k + jj)] = self.euler[(j, jj)];
                }
            }
        }
        m
    }

    /// External + internal generalized force at the current configuration.
    fn force(&self, gravity: Vec3, forces: &[PointForce]) -> (Mat3, Vec3) {
        let mut def = Mat3::zeros();
        let mut lin = self.mass * gravity;
        for frc in forces {
            let arm = frc.point - self.center_ref;
            def += frc.force * arm.transpose();
            lin += frc.force;
        }
        def -= self.first_pk(&self.def_grad) * self.ref_volume;
        (def, lin)
    }

    /// Applies the inverse of the deformation operator built for this step;
    /// falls back to the plain mass inverse.
    fn solve_def(&self, rhs: &Mat3) -> Mat3 {
        match &self.op {
            Some((_, lu)) => match lu.solve(&vec9(rhs)) {
                Some(x) => unvec9(&x),
                None => rhs * self.inv_euler,
            },
            None => rhs * self.inv_euler,
        }
    }

    pub(crate) fn step_begin(
        &mut self,
        h: f64,
        gravity: Vec3,
        forces: &[PointForce],
        quasistatic: bool,
    ) {
        self.con_force = Vec3::zeros();
        self.con_def = Mat3::zeros();
        self.linvel0 = self.linvel;
        self.def_vel0 = self.def_vel;

        if quasistatic {
            // Scaled static tangent: (λmax/4) M + h² K at the current
            // configuration.
            let m9 = self.mass9();
            let k9 = self.stiffness(&self.def_grad);
            let eigmax = power_iteration(&m9, &k9).max(f64::MIN_POSITIVE);
            self.op = Some((h, (0.25 * eigmax * m9 + h * h * k9).lu()));
            let (fdef, flin) = self.force(gravity, forces);
            self.def_vel = h * self.solve_def(&fdef);
            self.linvel = (h / self.mass) * flin;
            return;
        }

        let half = 0.5 * h;
        self.def_grad += half * self.def_vel;
        self.center += half * self.linvel;

        // The reference tangent of the limited scheme only depends on the
        // step size; keep the factorization across steps.
        let reusable = matches!(&self.op, Some((hh, _)) if *hh == h);
        self.op = match self.scheme {
            PseudoRigidScheme::Explicit => None,
            PseudoRigidScheme::Limited if reusable => self.op.take(),
            PseudoRigidScheme::Limited => {
                let a = self.mass9() + 0.25 * h * h * self.stiffness(&Mat3::identity());
                Some((h, a.lu()))
            }
            PseudoRigidScheme::Implicit => {
                let a = self.mass9() + 0.25 * h * h * self.stiffness(&self.def_grad);
                Some((h, a.lu()))
            }
        };

        let (fdef, flin) = self.force(gravity, forces);
        self.def_vel += h * self.solve_def(&fdef);
        self.linvel += (h / self.mass) * flin;
    }

    pub(crate) fn step_end(&mut self, h: f64, quasistatic: bool) {
        self.def_vel += h * self.solve_def(&self.con_def);
        self.linvel += (h / self.mass) * self.con_force;

        let adv = if quasistatic { h } else { 0.5 * h };
        self.def_grad += adv * self.def_vel;
        self.center += adv * self.linvel;
    }

    pub(crate) fn point_velocity(&self, anchor: &ContactAnchor, prev: bool) -> Vec3 {
        let (l, v) = if prev {
            (self.def_vel0, self.linvel0)
        } else {
            (self.def_vel, self.linvel)
        };
        match anchor {
            ContactAnchor::Offset(xi) => v + l * xi,
            _ => v,
        }
    }

    pub(crate) fn inv_inertia_contraction(&self, a: &ContactAnchor, b: &ContactAnchor) -> Mat3 {
        let (xa, xb) = match (a, b) {
            (ContactAnchor::Offset(xa), ContactAnchor::Offset(xb)) => (*xa, *xb),
            _ => return Mat3::zeros(),
        };
        (1.0 / self.mass + xa.dot(&(self.inv_euler * xb))) * Mat3::identity()
    }

    pub(crate) fn apply_contact_force(&mut self, anchor: &ContactAnchor, force: Vec3) {
        if let ContactAnchor::Offset(xi) = anchor {
            self.con_def += force * xi.transpose();
        }
        self.con_force += force;
    }

    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.linvel.norm_squared()
            + 0.5 * (self.def_vel * self.euler * self.def_vel.transpose()).trace()
    }

    pub fn internal_energy(&self) -> f64 {
        let e = 0.5 * (self.def_grad.transpose() * self.def_grad - Mat3::identity());
        self.ref_volume
            * (0.5 * self.lambda * e.trace() * e.trace()
                + self.mu * (e.transpose() * e).trace())
    }

    /// Snapshot layout: F (column-major) + center; def_vel + linvel.
    pub(crate) fn capture(&self) -> (Vec<f64>, Vec<f64>) {
        let mut conf = Vec::with_capacity(12);
        conf.extend(self.def_grad.iter());
        conf.extend(self.center.iter());
        let mut velo = Vec::with_capacity(12);
        velo.extend(self.def_vel.iter());
        velo.extend(self.linvel.iter());
        (conf, velo)
    }

    pub(crate) fn restore(&mut self, conf: &[f64], velo: &[f64]) -> bool {
        if conf.len() != 12 || velo.len() != 12 {
            return false;
        }
        self.def_grad = Mat3::from_column_slice(&conf[..9]);
        self.center = Vec3::from_column_slice(&conf[9..]);
        self.def_vel = Mat3::from_column_slice(&velo[..9]);
        self.linvel = Vec3::from_column_slice(&velo[9..]);
        true
    }

    pub fn critical_time_step(&self) -> f64 {
        let m9 = self.mass9();
        let k9 = self.stiffness(&self.def_grad);
        let eigmax = power_iteration(&m9, &k9);
        if eigmax > 0.0 {
            2.0 / eigmax.sqrt()
        } else {
            f64::MAX
        }
    }
}

fn vec9(m: &Mat3) -> Vec9 {
    let mut v = Vec9::zeros();
    for k in 0..3 {
        for j in 0..3 {
            v[3 * k + j] = m[(k, j)];
        }
    }
    v
}

fn unvec9(v: &Vec9) -> Mat3 {
    let mut m = Mat3::zeros();
    for k in 0..3 {
        for j in 0..3 {
            m[(k, j)] = v[3 * k + j];
        }
    }
    m
}

/// Largest eigenvalue of `M⁻¹ K` by power iteration.
fn power_iteration(m9: &Mat9, k9: &Mat9) -> f64 {
    let lu = (*m9).lu();
    let mut x = Vec9::repeat(1.0);
    let mut eig = 0.0;
    for _ in 0..50 {
        let y = match lu.solve(&(k9 * x)) {
            Some(y) => y,
            None => return 0.0,
        };
        let norm = y.norm();
        if !(norm > 0.0) || !norm.is_finite() {
            return 0.0;
        }
        eig = norm / x.norm();
        x = y / norm;
    }
    eig
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cube(scheme: PseudoRigidScheme) -> PseudoRigidBody {
        let bulk = BulkMaterial::new(1.0e7, 0.25, 1.0e3);
        let shape = ConvexPolyhedron::cuboid(Vec3::repeat(-0.5), Vec3::repeat(0.5));
        PseudoRigidBody::new(&shape, &bulk, scheme).unwrap()
    }

    #[test]
    fn reference_configuration_is_stress_free() {
        let body = cube(PseudoRigidScheme::Explicit);
        assert_relative_eq!(body.first_pk(&Mat3::identity()).norm(), 0.0, epsilon = 1e-12);
        assert_eq!(body.internal_energy(), 0.0);
    }

    #[test]
    fn small_oscillation_stays_bounded() {
        let mut body = cube(PseudoRigidScheme::Explicit);
        let h = 0.25 * body.critical_time_step();
        body.def_grad[(0, 0)] = 1.001;
        let e0 = body.internal_energy();
        assert!(e0 > 0.0);
        for _ in 0..200 {
            body.step_begin(h, Vec3::zeros(), &[], false);
            body.step_end(h, false);
        }
        let total = body.internal_energy() + body.kinetic_energy();
        assert!(total < 4.0 * e0, "explicit scheme blew up: {total} vs {e0}");
        assert!((body.def_grad[(0, 0)] - 1.0).abs() < 0.01);
    }

    #[test]
    fn limited_scheme_damps_stiff_modes() {
        let mut body = cube(PseudoRigidScheme::Limited);
        // Step far beyond the explicit stability bound.
        let h = 4.0 * body.critical_time_step();
        body.def_grad[(0, 0)] = 1.001;
        let e0 = body.internal_energy();
        for _ in 0..100 {
            body.step_begin(h, Vec3::zeros(), &[], false);
            body.step_end(h, false);
        }
        assert!(body.internal_energy() + body.kinetic_energy() <= 2.0 * e0);
    }

    #[test]
    fn critical_step_positive() {
        let body = cube(PseudoRigidScheme::Explicit);
        let hc = body.critical_time_step();
        assert!(hc > 0.0 && hc < 1.0);
    }
}
