//! Hybrid contact solve: Gauss-Seidel smoothing around Newton refinement.
//!
//! A few cheap sweeps put the reactions into the Newton basin, the Newton
//! stage grinds the merit down, and a short post-smooth distributes whatever
//! local error the global step left behind. Rounds repeat until the merit
//! target holds or the round budget runs out.

use super::gauss_seidel::{GaussSeidel, GaussSeidelParams};
use super::newton::{Newton, NewtonParams};
use super::{merit, ContactSolver, Control, FailurePolicy, Monitor, SolveInfo, Status};
use crate::assembly::LocalDynamics;
use crate::partition::DomainSet;
use crate::timing::SolveTimings;
use crate::Error;

#[derive(Copy, Clone, Debug)]
pub struct HybridParams {
    /// Gauss-Seidel refinement sweeps before each Newton stage.
    pub refine: u32,
    /// Gauss-Seidel sweeps after each Newton stage.
    pub postsmooth: u32,
    pub rounds: u32,
    /// Merit value ending the outer loop.
    pub meritval: f64,
    /// Applied when the round budget runs out above the merit target.
    pub failure: FailurePolicy,
    pub gauss_seidel: GaussSeidelParams,
    pub newton: NewtonParams,
}

impl Default for HybridParams {
    fn default() -> Self {
        HybridParams {
            refine: 10,
            postsmooth: 5,
            rounds: 3,
            meritval: 1e-8,
            failure: FailurePolicy::Continue,
            gauss_seidel: GaussSeidelParams::default(),
            newton: NewtonParams::default(),
        }
    }
}

impl HybridParams {
    pub fn with_meritval(mut self, meritval: f64) -> Self {
        self.meritval = meritval;
        self
    }

    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_smoothing(mut self, refine: u32, postsmooth: u32) -> Self {
        self.refine = refine;
        self.postsmooth = postsmooth;
        self
    }

    pub fn with_failure(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }
}

pub struct Hybrid {
    pub params: HybridParams,
    timings: SolveTimings,
}

impl Hybrid {
    pub fn new(params: HybridParams) -> Self {
        Hybrid {
            params,
            timings: SolveTimings::default(),
        }
    }

    fn smoother(&self, sweeps: u32) -> GaussSeidel {
        // Smoothing runs a fixed sweep count; divergence there is expected
        // and must not abort the round.
        GaussSeidel::new(
            self.params
                .gauss_seidel
                .with_max_iter(sweeps)
                .with_epsilon(0.0)
                .with_failure(FailurePolicy::Continue),
        )
    }
}

impl ContactSolver for Hybrid {
    fn solve(
        &mut self,
        ldy: &mut LocalDynamics,
        domains: Option<&DomainSet>,
        monitor: &mut dyn Monitor,
    ) -> Result<SolveInfo, Error> {
        let meritval = self.params.meritval;
        // Inner stages hit their caps by design; the configured policy is
        // applied once, on the outer outcome.
        let mut newton = Newton::new(
            self.params
                .newton
                .with_meritval(meritval)
                .with_failure(FailurePolicy::Continue),
        );
        self.timings = SolveTimings::default();

        let mut iterations = 0;
        let mut residual = 0.0;
        let mut status = Status::IterationLimit;
        for round in 0..self.params.rounds {
            if self.params.refine > 0 {
                let mut gs = self.smoother(self.params.refine);
                let info = gs.solve(ldy, domains, monitor)?;
                self.timings.accumulate(&gs.timings());
                iterations += info.iterations;
                residual = info.residual;
                if info.status == Status::Interrupted {
                    status = Status::Interrupted;
                    break;
                }
            }

            let info = newton.solve(ldy, domains, monitor)?;
            self.timings.accumulate(&newton.timings());
            iterations += info.iterations;
            residual = info.residual;
            if info.status == Status::Interrupted {
                status = Status::Interrupted;
                break;
            }

            if self.params.postsmooth > 0 {
                let mut gs = self.smoother(self.params.postsmooth);
                let info = gs.solve(ldy, domains, monitor)?;
                self.timings.accumulate(&gs.timings());
                iterations += info.iterations;
                residual = info.residual;
                if info.status == Status::Interrupted {
                    status = Status::Interrupted;
                    break;
                }
            }

            let m = merit(ldy, true);
            log::debug!("hybrid round {}: merit {:.3e}", round, m);
            if m <= meritval {
                status = Status::Converged;
                break;
            }
        }

        let final_merit = merit(ldy, true);
        if status != Status::Interrupted && final_merit <= meritval {
            status = Status::Converged;
        }
        let info = SolveInfo {
            iterations,
            residual,
            merit: final_merit,
            status,
        };
        if info.status == Status::IterationLimit {
            match self.params.failure {
                FailurePolicy::Continue => {
                    log::debug!(
                        "hybrid stopped at the round cap: merit {:.3e} after {} iterations",
                        info.merit,
                        info.iterations
                    );
                }
                FailurePolicy::Exit => {
                    log::warn!(
                        "hybrid diverged: merit {:.3e} after {} iterations",
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

    fn timings(&self) -> SolveTimings {
        self.timings
    }
}
