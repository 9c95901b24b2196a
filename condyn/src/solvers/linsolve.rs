//! Matrix-free linear solves for the implicit integrators and the Newton
//! strategy.

/// Outcome of one linear solve.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct LinSolveResult {
    pub iterations: u32,
    /// Absolute residual norm `|b - Ax|`.
    pub residual: f64,
    /// Residual relative to `|b|`.
    pub error: f64,
    pub converged: bool,
}

/// BiConjugate Gradient STABilized solver for non-symmetric systems.
///
/// Workspace vectors are owned so repeated solves of the same size do not
/// reallocate. The operator is a matvec closure; the solver restarts with a
/// fresh shadow residual whenever the Krylov directions degenerate.
#[allow(non_snake_case)]
pub(crate) struct BiCgStab {
    pub max_iter: u32,
    pub tol: f64,
    r0s: na::DVector<f64>,
    rhs: na::DVector<f64>,
    p: na::DVector<f64>,
    Ar: na::DVector<f64>,
    Ap: na::DVector<f64>,
}

impl BiCgStab {
    pub fn new(size: usize, max_iter: u32, tol: f64) -> Self {
        let r0s = na::DVector::zeros(size);
        let Ar = r0s.clone();
        BiCgStab {
            max_iter,
            tol: tol.max(f64::EPSILON),
            rhs: r0s.clone(),
            p: r0s.clone(),
            Ap: Ar.clone(),
            Ar,
            r0s,
        }
    }

    /// Solves `Ax = b` with the product `Ax` provided by `matvec`. On return
    /// `x` holds the solution and `b` the final residual.
    #[allow(non_snake_case)]
    pub fn solve<F>(&mut self, mut matvec: F, x: &mut [f64], b: &mut [f64]) -> LinSolveResult
    where
        F: FnMut(&[f64], &mut [f64]),
    {
        let BiCgStab {
            max_iter,
            tol,
            ref mut r0s,
            ref mut rhs,
            ref mut p,
            ref mut Ar,
            ref mut Ap,
        } = *self;

        debug_assert_eq!(b.len(), x.len());
        debug_assert_eq!(p.len(), x.len());

        rhs.as_mut_slice().copy_from_slice(b);
        let b_norm_sq = rhs.norm_squared();

        let mut x: na::DVectorViewMut<f64> = x.into();
        let mut r: na::DVectorViewMut<f64> = b.into();

        if b_norm_sq == 0.0 {
            x.fill(0.0);
            return LinSolveResult {
                iterations: 0,
                residual: 0.0,
                error: 0.0,
                converged: true,
            };
        }

        let tol_sq = b_norm_sq * tol * tol;
        let eps_sq = f64::EPSILON * f64::EPSILON;

        // r0 = b - A x0
        matvec(x.as_slice(), p.as_mut_slice());
        r.axpy(-1.0, p, 1.0);

        // Shadow residual; any vector with (r0s, r) != 0 works.
        r0s.as_mut_slice().copy_from_slice(r.as_slice());
        let mut r0s_norm_sq = r0s.norm_squared();

        p.as_mut_slice().copy_from_slice(r.as_slice());
        matvec(p.as_slice(), Ap.as_mut_slice());

        let mut rho = 1.0;
        let mut alpha = 1.0;
        let mut w = 1.0;

        let mut iterations = 0;
        loop {
            let r_norm_sq = r.norm_squared();
            if r_norm_sq <= tol_sq || iterations >= max_iter {
                let residual = r_norm_sq.sqrt();
                break LinSolveResult {
                    iterations,
                    residual,
                    error: residual / b_norm_sq.sqrt(),
                    converged: r_norm_sq <= tol_sq,
                };
            }

            let mut rho_new = r0s.dot(&r);

            // Restart when r drifts orthogonal to the shadow residual.
            if rho_new.abs() <= eps_sq * r0s_norm_sq {
                matvec(x.as_slice(), r.as_mut_slice());
                r.axpy(1.0, rhs, -1.0);
                r0s.as_mut_slice().copy_from_slice(r.as_slice());
                rho_new = r0s.norm_squared();
                r0s_norm_sq = rho_new;
                log::trace!("bicgstab restart, rho = {:.3e}", rho_new);
            }

            let beta = (rho_new / rho) * (alpha / w);
            rho = rho_new;

            // p = r + beta (p - w Ap)
            p.axpy(-w, Ap, 1.0);
            p.axpy(1.0, &r, beta);

            matvec(p.as_slice(), Ap.as_mut_slice());

            let mut r0sAp = r0s.dot(Ap);
            if r0sAp.abs() <= eps_sq * r0s_norm_sq {
                matvec(x.as_slice(), r.as_mut_slice());
                r.axpy(1.0, rhs, -1.0);
                r0s.as_mut_slice().copy_from_slice(r.as_slice());
                r0sAp = r0s.norm_squared();
                r0s_norm_sq = r0sAp;
                log::trace!("bicgstab restart, r0sAp = {:.3e}", r0sAp);
            }

            alpha = rho / r0sAp;

            // s = r - alpha Ap
            r.axpy(-alpha, Ap, 1.0);

            matvec(r.as_slice(), Ar.as_mut_slice());

            let Ar_norm_sq = Ar.norm_squared();
            w = if Ar_norm_sq > 0.0 {
                r.dot(Ar) / Ar_norm_sq
            } else {
                0.0
            };

            // x = x + alpha p + w s
            x.axpy(alpha, p, 1.0);
            x.axpy(w, &r, 1.0);

            // r = s - w As
            r.axpy(-w, Ar, 1.0);

            iterations += 1;
        }
    }
}
