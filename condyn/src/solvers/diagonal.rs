//! Single-contact Signorini-Coulomb solvers.
//!
//! Each solver resolves one 3x3 block `U = B + W R` against the contact law,
//! with the normal velocity dashed by restitution (dynamic) or by the gap
//! rate (quasi-static). The fixed-point variants iterate a projection onto
//! the friction cone with the spectral step `rho`; the semismooth variant
//! solves the linearized complementarity system directly and also refreshes
//! the persistent local velocity `u` incrementally.

use crate::assembly::DiagBlock;
use crate::{Mat3, Vec3};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiagSolverKind {
    ProjectedGradient,
    DeSaxceFeng,
    SemismoothNewton,
}

/// Outcome of one diagonal solve.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DiagOutcome {
    Converged(u32),
    /// Iteration cap hit with the error still above tolerance.
    Diverged(u32),
    /// Singular or non-finite linearization.
    Failed,
}

/// Dashed normal velocity: restitution on the approach velocity in dynamics,
/// gap closure rate in quasi-statics.
fn dashed_normal(dynamic: bool, step: f64, restitution: f64, gap: f64, u: Vec3, v: Vec3) -> f64 {
    if dynamic {
        u.z + restitution * v.z.min(0.0)
    } else {
        gap.max(0.0) / step + u.z
    }
}

/// Open dynamic contact: no reaction, free local velocity.
fn open_contact(dia: &mut DiagBlock, b: Vec3) {
    dia.r = Vec3::zeros();
    dia.u = b;
}

pub(crate) fn solve(
    kind: DiagSolverKind,
    epsilon: f64,
    maxiter: u32,
    dynamic: bool,
    step: f64,
    dia: &mut DiagBlock,
    b: Vec3,
) -> DiagOutcome {
    match kind {
        DiagSolverKind::ProjectedGradient => {
            projected_gradient(epsilon, maxiter, dynamic, step, dia, b)
        }
        DiagSolverKind::DeSaxceFeng => de_saxce_feng(epsilon, maxiter, dynamic, step, dia, b),
        DiagSolverKind::SemismoothNewton => {
            semismooth_newton(epsilon, maxiter, dynamic, step, dia, b)
        }
    }
}

fn projected_gradient(
    epsilon: f64,
    maxiter: u32,
    dynamic: bool,
    step: f64,
    dia: &mut DiagBlock,
    b: Vec3,
) -> DiagOutcome {
    let (friction, restitution, gap) = (dia.friction(), dia.restitution(), dia.gap());
    if dynamic && gap > 0.0 {
        open_contact(dia, b);
        return DiagOutcome::Converged(0);
    }

    let mut iter = 0;
    loop {
        let r0 = dia.r;

        dia.u = b + dia.w * dia.r;
        let un = dashed_normal(dynamic, step, restitution, gap, dia.u, dia.v);

        let mut r = dia.r - dia.rho * Vec3::new(dia.u.x, dia.u.y, un);

        r.z = r.z.max(0.0);
        let tan = (r.x * r.x + r.y * r.y).sqrt();
        if tan >= friction * r.z {
            let scale = if tan > 0.0 { friction * r.z / tan } else { tan };
            r.x *= scale;
            r.y *= scale;
        }
        dia.r = r;

        let error = crate::relative_error((r - r0).norm_squared(), r.norm_squared());
        iter += 1;
        if iter >= maxiter || error <= epsilon {
            break if error <= epsilon {
                DiagOutcome::Converged(iter)
            } else {
                DiagOutcome::Diverged(iter)
            };
        }
    }
}

fn de_saxce_feng(
    epsilon: f64,
    maxiter: u32,
    dynamic: bool,
    step: f64,
    dia: &mut DiagBlock,
    b: Vec3,
) -> DiagOutcome {
    let (friction, restitution, gap) = (dia.friction(), dia.restitution(), dia.gap());
    if dynamic && gap > 0.0 {
        open_contact(dia, b);
        return DiagOutcome::Converged(0);
    }

    let mut iter = 0;
    loop {
        let r0 = dia.r;

        dia.u = b + dia.w * dia.r;
        let un = dashed_normal(dynamic, step, restitution, gap, dia.u, dia.v);

        // Bipotential augmentation: the normal prediction carries the
        // friction-weighted tangential slip rate.
        let slip = (dia.u.x * dia.u.x + dia.u.y * dia.u.y).sqrt();
        let tau = dia.r - dia.rho * Vec3::new(dia.u.x, dia.u.y, un + friction * slip);

        dia.r = super::project_cone(friction, tau);

        let error = crate::relative_error((dia.r - r0).norm_squared(), dia.r.norm_squared());
        iter += 1;
        if iter >= maxiter || error <= epsilon {
            break if error <= epsilon {
                DiagOutcome::Converged(iter)
            } else {
                DiagOutcome::Diverged(iter)
            };
        }
    }
}

fn semismooth_newton(
    epsilon: f64,
    maxiter: u32,
    dynamic: bool,
    step: f64,
    dia: &mut DiagBlock,
    b: Vec3,
) -> DiagOutcome {
    let (friction, restitution, gap) = (dia.friction(), dia.restitution(), dia.gap());
    if dynamic && gap > 0.0 {
        open_contact(dia, b);
        return DiagOutcome::Converged(0);
    }

    let w = dia.w;
    let mut rho = dia.rho;
    let divi = maxiter / 10;
    let mut iter = 0;
    loop {
        let r = dia.r;
        let u = dia.u;
        let un = dashed_normal(dynamic, step, restitution, gap, u, dia.v);

        let d = r - rho * Vec3::new(u.x, u.y, un);

        // Residual of the persistent velocity: RES = W R + B - U.
        let res = b + w * r - u;

        let (a, rhs);
        if d.z >= 0.0 {
            let norm = (d.x * d.x + d.y * d.y).sqrt();
            let lim = friction * d.z.max(0.0);

            if norm >= lim {
                // Frictional slip.
                if lim > 0.0 {
                    let len = (r.x * r.x + r.y * r.y).sqrt();
                    let den = lim.max(len) * norm;
                    let e = lim / norm;
                    let beta = if len == 0.0 {
                        1.0
                    } else {
                        let alfa = (r.x * d.x + r.y * d.y) / (len * norm);
                        let delta = (len / lim).min(1.0);
                        // Relax when the slip direction flips.
                        if alfa < 0.0 {
                            1.0 / (1.0 - alfa * delta)
                        } else {
                            1.0
                        }
                    };

                    let f00 = (r.x * d.x) / den;
                    let f10 = (r.y * d.x) / den;
                    let f01 = (r.x * d.y) / den;
                    let f11 = (r.y * d.y) / den;

                    let m00 = e * (1.0 - f00);
                    let m10 = -e * f10;
                    let m01 = -e * f01;
                    let m11 = e * (1.0 - f11);

                    let h00 = 1.0 - beta * m00;
                    let h10 = -beta * m10;
                    let h01 = -beta * m01;
                    let h11 = 1.0 - beta * m11;

                    a = Mat3::new(
                        h00 + rho * (m00 * w[(0, 0)] + m01 * w[(1, 0)]),
                        h01 + rho * (m00 * w[(0, 1)] + m01 * w[(1, 1)]),
                        rho * (m00 * w[(0, 2)] + m01 * w[(1, 2)]) - friction * (d.x / norm),
                        h10 + rho * (m10 * w[(0, 0)] + m11 * w[(1, 0)]),
                        h11 + rho * (m10 * w[(0, 1)] + m11 * w[(1, 1)]),
                        rho * (m10 * w[(0, 2)] + m11 * w[(1, 2)]) - friction * (d.y / norm),
                        w[(2, 0)],
                        w[(2, 1)],
                        w[(2, 2)],
                    );
                    rhs = Vec3::new(
                        friction * (d.x / norm) * r.z - r.x - rho * (m00 * res.x + m01 * res.y),
                        friction * (d.y / norm) * r.z - r.y - rho * (m10 * res.x + m11 * res.y),
                        -un - res.z,
                    );
                } else {
                    // Degenerate cone: homogeneous tangential tractions.
                    a = Mat3::new(
                        1.0,
                        0.0,
                        0.0,
                        0.0,
                        1.0,
                        0.0,
                        w[(2, 0)],
                        w[(2, 1)],
                        w[(2, 2)],
                    );
                    rhs = Vec3::new(-r.x - res.x, -r.y - res.y, -un - res.z);
                }
            } else {
                // Frictional stick.
                a = Mat3::new(
                    w[(0, 0)],
                    w[(0, 1)],
                    w[(0, 2)] + u.x / d.z,
                    w[(1, 0)],
                    w[(1, 1)],
                    w[(1, 2)] + u.y / d.z,
                    w[(2, 0)],
                    w[(2, 1)],
                    w[(2, 2)],
                );
                rhs = Vec3::new(
                    -(1.0 + rho * u.z / d.z) * u.x - res.x,
                    -(1.0 + rho * u.z / d.z) * u.y - res.y,
                    -un - res.z,
                );
            }
        } else {
            // Open contact: drive the reaction to zero.
            a = Mat3::identity();
            rhs = -r;
        }

        let delta = match a.lu().solve(&rhs) {
            Some(d) if d.iter().all(|x| x.is_finite()) => d,
            _ => return DiagOutcome::Failed,
        };

        dia.r += delta;
        dia.u += res + w * delta;

        let error = crate::relative_error((dia.r - r).norm_squared(), dia.r.norm_squared());
        iter += 1;

        if divi > 0 && iter % divi == 0 {
            rho *= 10.0;
            if rho.is_infinite() {
                return DiagOutcome::Failed;
            }
        }

        if iter >= maxiter || error <= epsilon {
            break if error <= epsilon {
                DiagOutcome::Converged(iter)
            } else {
                DiagOutcome::Diverged(iter)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Contact;
    use crate::material::SurfaceMaterial;
    use crate::objects::{BodyId, ContactAnchor};
    use approx::assert_relative_eq;

    // Unit-mass point pressed onto a plane: W = h/m I, B points down.
    fn block(gap: f64, friction: f64, restitution: f64, b: Vec3) -> (DiagBlock, Vec3) {
        let w = Mat3::identity() * 1e-3;
        let dia = DiagBlock {
            contact: Contact {
                master: BodyId(0),
                slave: BodyId(1),
                point: Vec3::zeros(),
                base: Mat3::identity(),
                gap,
                area: 1.0,
                surf: SurfaceMaterial::new(friction, restitution),
                mfeat: 0,
                sfeat: 0,
                manchor: ContactAnchor::Obstacle,
                sanchor: ContactAnchor::Offset(Vec3::zeros()),
            },
            w,
            a_inv: w.try_inverse().unwrap(),
            rho: 1.0 / 1e-3,
            v: b,
            b,
            r: Vec3::zeros(),
            u: b,
            adj: Vec::new(),
        };
        (dia, b)
    }

    fn check_law(dia: &DiagBlock, b: Vec3) {
        // U must be consistent with R.
        assert_relative_eq!(dia.u, b + dia.w * dia.r, epsilon = 1e-8);
        // Inside the cone.
        let tan = (dia.r.x * dia.r.x + dia.r.y * dia.r.y).sqrt();
        assert!(dia.r.z >= -1e-12);
        assert!(tan <= dia.friction() * dia.r.z + 1e-8);
    }

    fn solvers() -> [DiagSolverKind; 3] {
        [
            DiagSolverKind::ProjectedGradient,
            DiagSolverKind::DeSaxceFeng,
            DiagSolverKind::SemismoothNewton,
        ]
    }

    #[test]
    fn open_contact_carries_no_reaction() {
        for kind in solvers() {
            let (mut dia, b) = block(0.1, 0.3, 0.0, Vec3::new(0.0, 0.0, -0.01));
            let out = solve(kind, 1e-10, 100, true, 1e-3, &mut dia, b);
            assert_eq!(out, DiagOutcome::Converged(0));
            assert_eq!(dia.r, Vec3::zeros());
        }
    }

    #[test]
    fn normal_impact_without_restitution_stops_the_point() {
        for kind in solvers() {
            let (mut dia, b) = block(0.0, 0.0, 0.0, Vec3::new(0.0, 0.0, -0.01));
            let out = solve(kind, 1e-12, 1000, true, 1e-3, &mut dia, b);
            assert!(matches!(out, DiagOutcome::Converged(_)), "{:?}: {:?}", kind, out);
            check_law(&dia, b);
            assert_relative_eq!(dia.u.z, 0.0, epsilon = 1e-8);
            assert_relative_eq!(dia.r.z, 10.0, max_relative = 1e-6);
        }
    }

    #[test]
    fn full_restitution_reflects_the_normal_velocity() {
        for kind in solvers() {
            let (mut dia, b) = block(0.0, 0.0, 1.0, Vec3::new(0.0, 0.0, -0.01));
            let out = solve(kind, 1e-12, 1000, true, 1e-3, &mut dia, b);
            assert!(matches!(out, DiagOutcome::Converged(_)));
            check_law(&dia, b);
            // V.z = -0.01 approaches; U.z must come out at +0.01.
            assert_relative_eq!(dia.u.z, 0.01, epsilon = 1e-8);
        }
    }

    #[test]
    fn tangential_pull_saturates_the_cone() {
        for kind in solvers() {
            // Strong tangential free velocity with modest friction: slip.
            let (mut dia, b) = block(0.0, 0.2, 0.0, Vec3::new(0.05, 0.0, -0.01));
            let out = solve(kind, 1e-12, 2000, true, 1e-3, &mut dia, b);
            assert!(matches!(out, DiagOutcome::Converged(_)), "{:?}: {:?}", kind, out);
            check_law(&dia, b);
            let tan = (dia.r.x * dia.r.x + dia.r.y * dia.r.y).sqrt();
            assert_relative_eq!(tan, dia.friction() * dia.r.z, max_relative = 1e-6);
            // Friction opposes the slip direction.
            assert!(dia.r.x < 0.0);
            // Slip persists.
            assert!(dia.u.x > 0.0);
        }
    }

    #[test]
    fn sticking_contact_cancels_tangential_velocity() {
        for kind in solvers() {
            // Small tangential velocity under high friction: stick.
            let (mut dia, b) = block(0.0, 1.5, 0.0, Vec3::new(0.002, 0.0, -0.01));
            let out = solve(kind, 1e-12, 2000, true, 1e-3, &mut dia, b);
            assert!(matches!(out, DiagOutcome::Converged(_)), "{:?}: {:?}", kind, out);
            check_law(&dia, b);
            assert_relative_eq!(dia.u.x, 0.0, epsilon = 1e-7);
            assert_relative_eq!(dia.u.z, 0.0, epsilon = 1e-7);
        }
    }

    #[test]
    fn quasistatic_law_pushes_the_gap_closed() {
        for kind in solvers() {
            let (mut dia, b) = block(-0.001, 0.0, 0.0, Vec3::new(0.0, 0.0, 0.0));
            let out = solve(kind, 1e-12, 1000, false, 1e-3, &mut dia, b);
            assert!(matches!(out, DiagOutcome::Converged(_)));
            check_law(&dia, b);
            // Negative gap adds nothing to the dashed velocity here; contact
            // holds with zero normal velocity.
            assert_relative_eq!(dia.u.z, 0.0, epsilon = 1e-8);
        }
    }
}
