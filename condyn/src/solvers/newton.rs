//! Semismooth Newton over the whole contact set.
//!
//! The solver drives the stacked projection residual
//! `Φ_i(R) = R_i - Π_μ(R_i - ρ_i q_i(U))` to zero, where `Π_μ` projects onto
//! the friction cone and `q` carries the dashed normal velocity and the
//! friction-weighted slip. Newton directions come from a matrix-free
//! BiCGSTAB solve with finite-difference Jacobian products, damped by a
//! backtracking line search on `|Φ|`. Convergence is declared on the merit
//! function, not on the step size.

use std::time::Instant;

use super::linsolve::BiCgStab;
use super::{
    merit, project_cone, ContactSolver, Control, FailurePolicy, IterationStats, Monitor,
    SolveInfo, Status,
};
use crate::assembly::LocalDynamics;
use crate::partition::DomainSet;
use crate::timing::SolveTimings;
use crate::{relative_error, Error, Vec3};

#[derive(Copy, Clone, Debug)]
pub struct NewtonParams {
    /// Merit value ending the iteration.
    pub meritval: f64,
    /// Relative step size below which the iteration has stalled out.
    pub epsilon: f64,
    pub max_iter: u32,
    /// Inner linear iterations per Newton step.
    pub lin_max_iter: u32,
    /// Relative tolerance of the inner solve; loose solves are enough.
    pub lin_epsilon: f64,
    /// Line-search shrink factor in (0, 1).
    pub backtrack: f64,
    /// Scale of the finite-difference Jacobian probes.
    pub fd_step: f64,
    pub failure: FailurePolicy,
}

impl Default for NewtonParams {
    fn default() -> Self {
        NewtonParams {
            meritval: 1e-8,
            epsilon: 1e-14,
            max_iter: 100,
            lin_max_iter: 25,
            lin_epsilon: 0.25,
            backtrack: 0.5,
            fd_step: 1e-7,
            failure: FailurePolicy::Continue,
        }
    }
}

impl NewtonParams {
    pub fn with_meritval(mut self, meritval: f64) -> Self {
        self.meritval = meritval;
        self
    }

    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_lin_max_iter(mut self, lin_max_iter: u32) -> Self {
        self.lin_max_iter = lin_max_iter;
        self
    }

    pub fn with_failure(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }
}

pub struct Newton {
    pub params: NewtonParams,
    timings: SolveTimings,
}

fn vec3_at(x: &[f64], i: usize) -> Vec3 {
    Vec3::new(x[3 * i], x[3 * i + 1], x[3 * i + 2])
}

fn set_vec3(x: &mut [f64], i: usize, v: Vec3) {
    x[3 * i] = v.x;
    x[3 * i + 1] = v.y;
    x[3 * i + 2] = v.z;
}

/// Stacked projection residual at the reactions `r`.
fn residual(ldy: &LocalDynamics, r: &[f64], out: &mut [f64]) {
    for (i, dia) in ldy.blocks.iter().enumerate() {
        let ri = vec3_at(r, i);
        let phi = if ldy.dynamic && dia.gap() > 0.0 {
            ri
        } else {
            let mut u = dia.b + dia.w * ri;
            for o in &dia.adj {
                u += o.w * vec3_at(r, o.block);
            }
            let fri = dia.friction();
            let udash = if ldy.dynamic {
                u.z + dia.restitution() * dia.v.z.min(0.0)
            } else {
                dia.gap().max(0.0) / ldy.h + u.z
            };
            let slip = (u.x * u.x + u.y * u.y).sqrt();
            let q = Vec3::new(u.x, u.y, udash + fri * slip);
            ri - project_cone(fri, ri - dia.rho * q)
        };
        set_vec3(out, i, phi);
    }
}

fn norm(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum::<f64>().sqrt()
}

impl Newton {
    pub fn new(params: NewtonParams) -> Self {
        Newton {
            params,
            timings: SolveTimings::default(),
        }
    }

    fn load(ldy: &mut LocalDynamics, r: &[f64]) {
        for (i, dia) in ldy.blocks.iter_mut().enumerate() {
            dia.r = vec3_at(r, i);
        }
    }

    fn timed_merit(&mut self, ldy: &mut LocalDynamics) -> f64 {
        let begin = Instant::now();
        let m = merit(ldy, true);
        self.timings.merit += begin.elapsed();
        m
    }

    /// Applies the failure policy when the iteration ended at its cap.
    fn finish(
        &self,
        monitor: &mut dyn Monitor,
        info: SolveInfo,
    ) -> Result<SolveInfo, Error> {
        if info.status == Status::IterationLimit {
            match self.params.failure {
                FailurePolicy::Continue => {
                    log::debug!(
                        "newton stopped at the iteration cap: merit {:.3e} after {} iterations",
                        info.merit,
                        info.iterations
                    );
                }
                FailurePolicy::Exit => {
                    log::warn!(
                        "newton diverged: merit {:.3e} after {} iterations",
                        info.merit,
                        info.iterations
                    );
                    return Err(Error::NonConvergence {
                        iterations: info.iterations,
                        residual: info.residual,
                    });
                }
                FailurePolicy::Delegate => {
                    if monitor.on_failure(&info) == Control::Abort {
                        return Ok(SolveInfo {
                            status: Status::Interrupted,
                            ..info
                        });
                    }
                }
            }
        }
        Ok(info)
    }
}

impl ContactSolver for Newton {
    /// Domain partitions are accepted for interface parity; the Newton
    /// iteration itself runs over the global contact set.
    fn solve(
        &mut self,
        ldy: &mut LocalDynamics,
        _domains: Option<&DomainSet>,
        monitor: &mut dyn Monitor,
    ) -> Result<SolveInfo, Error> {
        self.timings = SolveTimings::default();
        let n = ldy.blocks.len();
        let size = 3 * n;
        let mut r = vec![0.0; size];
        for (i, dia) in ldy.blocks.iter().enumerate() {
            set_vec3(&mut r, i, dia.r);
        }

        let mut f = vec![0.0; size];
        let mut f_cand = vec![0.0; size];
        let mut cand = vec![0.0; size];
        let mut probe = vec![0.0; size];
        let mut f_probe = vec![0.0; size];
        let mut rhs = vec![0.0; size];
        let mut dir = vec![0.0; size];
        let mut linear = BiCgStab::new(size, self.params.lin_max_iter, self.params.lin_epsilon);

        let mut iterations = 0;
        let mut step_residual = f64::INFINITY;
        let status = loop {
            Self::load(ldy, &r);
            let m = self.timed_merit(ldy);
            if m <= self.params.meritval {
                break Status::Converged;
            }
            if iterations >= self.params.max_iter {
                break Status::IterationLimit;
            }

            residual(ldy, &r, &mut f);
            let f_norm = norm(&f);
            let r_norm = norm(&r);

            for (b, fi) in rhs.iter_mut().zip(&f) {
                *b = -fi;
            }
            dir.fill(0.0);
            let fd = self.params.fd_step;
            let lin_begin = Instant::now();
            linear.solve(
                |v, out| {
                    let v_norm = norm(v);
                    if v_norm == 0.0 {
                        out.fill(0.0);
                        return;
                    }
                    let eps = fd * (1.0 + r_norm) / v_norm;
                    for i in 0..size {
                        probe[i] = r[i] + eps * v[i];
                    }
                    residual(ldy, &probe, &mut f_probe);
                    for i in 0..size {
                        out[i] = (f_probe[i] - f[i]) / eps;
                    }
                },
                &mut dir,
                &mut rhs,
            );
            self.timings.linear += lin_begin.elapsed();

            // Backtracking on |Φ|; a failed search still takes the damped
            // step, the merit check above decides what it was worth.
            let search_begin = Instant::now();
            let mut theta = 1.0;
            let mut f_cand_norm;
            loop {
                for i in 0..size {
                    cand[i] = r[i] + theta * dir[i];
                }
                residual(ldy, &cand, &mut f_cand);
                f_cand_norm = norm(&f_cand);
                if f_cand_norm <= (1.0 - 0.25 * theta) * f_norm || theta < 1e-6 {
                    break;
                }
                theta *= self.params.backtrack;
            }
            self.timings.line_search += search_begin.elapsed();
            if theta < 1e-6 {
                log::warn!("newton line search stalled at merit {:.3e}", m);
            }

            step_residual = relative_error(
                theta * theta * dir.iter().map(|d| d * d).sum::<f64>(),
                cand.iter().map(|c| c * c).sum::<f64>(),
            );
            r.copy_from_slice(&cand);
            iterations += 1;

            // A vanishing step means the iteration has stalled; the merit
            // check at the top of the loop reports what was achieved.
            if step_residual <= self.params.epsilon {
                Self::load(ldy, &r);
                let m = self.timed_merit(ldy);
                let status = if m <= self.params.meritval {
                    Status::Converged
                } else {
                    Status::IterationLimit
                };
                return self.finish(
                    monitor,
                    SolveInfo {
                        iterations,
                        residual: step_residual,
                        merit: m,
                        status,
                    },
                );
            }

            let stats = IterationStats {
                iteration: iterations,
                residual: step_residual,
                merit: Some(m),
            };
            if monitor.inspect(&stats) == Control::Abort {
                Self::load(ldy, &r);
                let m = self.timed_merit(ldy);
                return Ok(SolveInfo {
                    iterations,
                    residual: step_residual,
                    merit: m,
                    status: Status::Interrupted,
                });
            }
        };

        Self::load(ldy, &r);
        let final_merit = self.timed_merit(ldy);
        let info = SolveInfo {
            iterations,
            residual: if step_residual.is_finite() {
                step_residual
            } else {
                0.0
            },
            merit: final_merit,
            status,
        };
        log::debug!(
            "newton: {} iterations, merit {:.3e}, status {:?}",
            info.iterations,
            info.merit,
            info.status
        );
        self.finish(monitor, info)
    }

    fn timings(&self) -> SolveTimings {
        self.timings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::assemble;
    use crate::detect;
    use crate::material::{BulkMaterial, SurfaceMaterial, SurfaceMaterialSet};
    use crate::objects::{Body, BodyRegistry, RigidScheme};
    use crate::shape::ConvexPolyhedron;
    use crate::solvers::gauss_seidel::{GaussSeidel, GaussSeidelParams};
    use crate::solvers::NullMonitor;
    use approx::assert_relative_eq;

    fn resting_cube(friction: f64) -> LocalDynamics {
        let mut reg = BodyRegistry::new();
        let bulk = BulkMaterial::new(1.0e9, 0.25, 1.0e3).validated().unwrap();
        reg.add(Body::obstacle(
            "floor",
            ConvexPolyhedron::cuboid(Vec3::new(-5.0, -5.0, -1.0), Vec3::new(5.0, 5.0, 0.0)),
            0,
        ));
        reg.add(
            Body::rigid(
                "cube",
                ConvexPolyhedron::cuboid(Vec3::new(-0.5, -0.5, 0.0), Vec3::new(0.5, 0.5, 1.0)),
                bulk,
                0,
                RigidScheme::Stabilized,
            )
            .unwrap(),
        );
        let surfaces = SurfaceMaterialSet::new(SurfaceMaterial::new(friction, 0.0));

        let h = 1e-3;
        let g = Vec3::new(0.0, 0.0, -10.0);
        for (_, body) in reg.iter_mut() {
            body.step_begin(h, g, false);
        }
        let found = detect::detect(&reg, &surfaces, 1e-3).unwrap();
        assemble(&reg, found.contacts, h, true).unwrap()
    }

    #[test]
    fn empty_contact_set_converges_immediately() {
        let mut ldy = LocalDynamics {
            blocks: Vec::new(),
            h: 1e-3,
            dynamic: true,
            free_energy: 1.0,
        };
        let mut newton = Newton::new(NewtonParams::default());
        let info = newton.solve(&mut ldy, None, &mut NullMonitor).unwrap();
        assert_eq!(info.status, Status::Converged);
        assert_eq!(info.iterations, 0);
    }

    #[test]
    fn resting_cube_converges_to_small_merit() {
        let mut ldy = resting_cube(0.4);
        let mut newton = Newton::new(NewtonParams::default().with_meritval(1e-10));
        let info = newton.solve(&mut ldy, None, &mut NullMonitor).unwrap();
        assert_eq!(info.status, Status::Converged);
        assert!(info.merit <= 1e-10);
        let total: f64 = ldy.blocks.iter().map(|d| d.r.z).sum();
        assert_relative_eq!(total, 1.0e4, max_relative = 1e-4);
        // The inner linear solves were timed.
        assert!(newton.timings().linear > std::time::Duration::ZERO);
    }

    #[test]
    fn exit_policy_raises_on_iteration_limit() {
        let mut ldy = resting_cube(0.4);
        let mut newton = Newton::new(
            NewtonParams::default()
                .with_meritval(1e-30)
                .with_max_iter(1)
                .with_failure(FailurePolicy::Exit),
        );
        assert!(matches!(
            newton.solve(&mut ldy, None, &mut NullMonitor),
            Err(Error::NonConvergence { .. })
        ));
    }

    #[test]
    fn delegate_policy_consults_the_monitor() {
        let mut ldy = resting_cube(0.4);
        let mut newton = Newton::new(
            NewtonParams::default()
                .with_meritval(1e-30)
                .with_max_iter(1)
                .with_failure(FailurePolicy::Delegate),
        );
        // The null monitor's failure answer is to abort.
        let info = newton.solve(&mut ldy, None, &mut NullMonitor).unwrap();
        assert_eq!(info.status, Status::Interrupted);
    }

    #[test]
    fn newton_and_gauss_seidel_agree() {
        let mut by_newton = resting_cube(0.3);
        Newton::new(NewtonParams::default().with_meritval(1e-12))
            .solve(&mut by_newton, None, &mut NullMonitor)
            .unwrap();

        let mut by_gs = resting_cube(0.3);
        GaussSeidel::new(GaussSeidelParams::default().with_epsilon(1e-12))
            .solve(&mut by_gs, None, &mut NullMonitor)
            .unwrap();

        for (a, b) in by_newton.blocks.iter().zip(&by_gs.blocks) {
            assert_relative_eq!(a.r, b.r, epsilon = 1e-4, max_relative = 1e-4);
        }
    }
}
