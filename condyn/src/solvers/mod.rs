//! Contact solve strategies.
//!
//! All strategies operate on the assembled [`LocalDynamics`] and share one
//! convergence vocabulary: a relative reaction-change residual and a merit
//! function measuring the spurious momentum left by inexact reactions. The
//! Gauss-Seidel strategy sweeps diagonal block solvers, the Newton strategy
//! linearizes the whole contact set at once, and the hybrid strategy chains
//! the two.

pub mod gauss_seidel;
pub mod hybrid;
pub mod newton;

pub(crate) mod diagonal;
pub(crate) mod linsolve;

pub use diagonal::DiagSolverKind;
pub use gauss_seidel::{GaussSeidel, GaussSeidelParams};
pub use hybrid::{Hybrid, HybridParams};
pub use newton::{Newton, NewtonParams};

use std::time::Duration;

use crate::assembly::LocalDynamics;
use crate::partition::DomainSet;
use crate::timing::SolveTimings;
use crate::{Error, Vec3};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Converged,
    IterationLimit,
    /// A monitor aborted the solve.
    Interrupted,
}

/// Outcome of a contact solve.
#[derive(Copy, Clone, Debug)]
pub struct SolveInfo {
    pub iterations: u32,
    /// Relative reaction-change residual at the last iteration.
    pub residual: f64,
    /// Merit value at the returned reactions.
    pub merit: f64,
    pub status: Status,
}

/// Per-iteration progress handed to a [`Monitor`].
#[derive(Copy, Clone, Debug)]
pub struct IterationStats {
    pub iteration: u32,
    pub residual: f64,
    /// Strategies that track the merit per iteration report it here.
    pub merit: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    Abort,
}

/// Reaction to a diverging solve.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep the best reactions found and carry on.
    Continue,
    /// Fail the step with [`Error::NonConvergence`].
    Exit,
    /// Ask the monitor whether to continue.
    Delegate,
}

/// Observer of solver progress. The default implementation never interferes.
pub trait Monitor {
    fn inspect(&mut self, _stats: &IterationStats) -> Control {
        Control::Continue
    }

    /// Consulted under [`FailurePolicy::Delegate`] when a solve diverges.
    fn on_failure(&mut self, _info: &SolveInfo) -> Control {
        Control::Abort
    }
}

pub struct NullMonitor;

impl Monitor for NullMonitor {}

/// A strategy resolving all contact reactions of one step.
pub trait ContactSolver {
    fn solve(
        &mut self,
        ldy: &mut LocalDynamics,
        domains: Option<&DomainSet>,
        monitor: &mut dyn Monitor,
    ) -> Result<SolveInfo, Error>;

    /// Sub-phase durations of the most recent solve.
    fn timings(&self) -> SolveTimings {
        SolveTimings::default()
    }

    /// Wall time each domain spent sweeping in the most recent solve; empty
    /// for strategies that do not sweep per domain.
    fn domain_load(&self) -> &[Duration] {
        &[]
    }
}

/// Orthogonal projection onto the friction cone.
pub(crate) fn project_cone(fri: f64, tau: Vec3) -> Vec3 {
    let tan = (tau.x * tau.x + tau.y * tau.y).sqrt();
    if fri * tan < -tau.z {
        Vec3::zeros()
    } else if tan <= fri * tau.z {
        tau
    } else {
        let coef = (tan - fri * tau.z) / (1.0 + fri * fri);
        Vec3::new(
            tau.x - coef * (tau.x / tan),
            tau.y - coef * (tau.y / tan),
            tau.z - coef * fri,
        )
    }
}

/// Outward normal of the friction cone at a trial point, on the real cone
/// boundary; zero inside the cone, radial inside the polar cone.
fn cone_normal(r: Vec3, fri: f64) -> Vec3 {
    let dot = r.x * r.x + r.y * r.y;
    let len = dot.sqrt();

    if len == 0.0 || len <= fri * r.z {
        Vec3::zeros()
    } else if fri * len + r.z < 0.0 {
        let full = (dot + r.z * r.z).sqrt();
        if full == 0.0 {
            Vec3::zeros()
        } else {
            r / full
        }
    } else {
        let scale = 1.0 / (1.0 + fri * fri).sqrt();
        scale * Vec3::new(r.x / len, r.y / len, -fri)
    }
}

/// Normal ray from the cone towards a trial point.
fn cone_ray(fri: f64, s: Vec3) -> Vec3 {
    let n = cone_normal(s, fri);
    s.dot(&n) * n
}

/// Constraint satisfaction merit: approximate spurious momentum left by the
/// current reactions, normalized by the free-motion energy. When `update_u`
/// is set the local velocities are refreshed from the reactions first.
pub(crate) fn merit(ldy: &mut LocalDynamics, update_u: bool) -> f64 {
    if update_u {
        ldy.update_velocities();
    }

    let mut up_sum = 0.0;
    for dia in &ldy.blocks {
        let (fri, res, gap) = (dia.friction(), dia.restitution(), dia.gap());
        let u = dia.u;

        if ldy.dynamic && gap > 0.0 {
            // Open dynamic contact carries no reaction regardless of U.
            continue;
        }

        let udash = if ldy.dynamic {
            u.z + res * dia.v.z.min(0.0)
        } else {
            gap.max(0.0) / ldy.h + u.z
        };

        let q = Vec3::new(u.x, u.y, udash + fri * (u.x * u.x + u.y * u.y).sqrt());
        let p = q + cone_ray(fri, dia.r - q);
        up_sum += (dia.a_inv * p).dot(&p);
    }

    0.5 * up_sum / ldy.free_energy
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cone_normal_vanishes_inside_the_cone() {
        assert_eq!(cone_normal(Vec3::new(0.1, 0.0, 1.0), 0.5), Vec3::zeros());
        assert_eq!(cone_normal(Vec3::zeros(), 0.5), Vec3::zeros());
    }

    #[test]
    fn cone_normal_is_radial_inside_the_polar_cone() {
        let r = Vec3::new(0.1, 0.0, -1.0);
        let n = cone_normal(r, 0.5);
        assert_relative_eq!(n, r / r.norm(), epsilon = 1e-12);
    }

    #[test]
    fn cone_normal_is_unit_on_the_mantle() {
        let fri = 0.5;
        // Outside the cone, outside the polar cone.
        let n = cone_normal(Vec3::new(1.0, 0.0, 0.5), fri);
        assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-12);
        // Orthogonal to the mantle generator (fri, 0, 1).
        assert_relative_eq!(n.dot(&Vec3::new(fri, 0.0, 1.0)), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn cone_ray_projects_nothing_for_feasible_points() {
        assert_eq!(cone_ray(0.5, Vec3::new(0.0, 0.0, 2.0)), Vec3::zeros());
    }
}
