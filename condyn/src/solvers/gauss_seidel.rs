//! Block Gauss-Seidel over the contact set.
//!
//! Each sweep visits every diagonal block, folds the latest neighbour
//! reactions into the local free velocity and re-solves the single-contact
//! problem. Sweeps optionally alternate direction. With a domain partition
//! the sweep runs one rayon task per domain; cross-domain neighbours are read
//! from a start-of-sweep snapshot, so domain boundaries relax Jacobi-style
//! while the interior stays Gauss-Seidel.

use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::diagonal::{self, DiagOutcome, DiagSolverKind};
use super::{
    merit, ContactSolver, Control, FailurePolicy, IterationStats, Monitor, SolveInfo, Status,
};
use crate::assembly::{DiagBlock, LocalDynamics};
use crate::partition::DomainSet;
use crate::timing::SolveTimings;
use crate::{relative_error, Error, Vec3};

#[derive(Copy, Clone, Debug)]
pub struct GaussSeidelParams {
    /// Relative reaction-change tolerance.
    pub epsilon: f64,
    pub max_iter: u32,
    pub diag_epsilon: f64,
    pub diag_max_iter: u32,
    pub diag_solver: DiagSolverKind,
    pub failure: FailurePolicy,
    /// Alternate sweep direction every iteration.
    pub reverse: bool,
    pub record_history: bool,
}

impl Default for GaussSeidelParams {
    fn default() -> Self {
        GaussSeidelParams {
            epsilon: 1e-4,
            max_iter: 1000,
            diag_epsilon: 1e-6,
            diag_max_iter: 100,
            diag_solver: DiagSolverKind::SemismoothNewton,
            failure: FailurePolicy::Continue,
            reverse: false,
            record_history: false,
        }
    }
}

impl GaussSeidelParams {
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_diag_solver(mut self, kind: DiagSolverKind) -> Self {
        self.diag_solver = kind;
        self
    }

    pub fn with_diag_epsilon(mut self, epsilon: f64) -> Self {
        self.diag_epsilon = epsilon;
        self
    }

    pub fn with_diag_max_iter(mut self, max_iter: u32) -> Self {
        self.diag_max_iter = max_iter;
        self
    }

    pub fn with_failure(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_history(mut self, record: bool) -> Self {
        self.record_history = record;
        self
    }
}

pub struct GaussSeidel {
    pub params: GaussSeidelParams,
    /// Relative error after each sweep, when history recording is on.
    pub error_history: Vec<f64>,
    timings: SolveTimings,
    /// Wall time per domain, summed over the parallel sweeps.
    domain_times: Vec<Duration>,
}

/// Accumulated result of one sweep.
#[derive(Copy, Clone, Default)]
struct SweepTally {
    errup: f64,
    errlo: f64,
    diverged: u32,
    failed: u32,
    diagonal: Duration,
}

impl SweepTally {
    fn merge(mut self, other: SweepTally) -> SweepTally {
        self.errup += other.errup;
        self.errlo += other.errlo;
        self.diverged += other.diverged;
        self.failed += other.failed;
        self.diagonal += other.diagonal;
        self
    }

    fn troubled(&self) -> bool {
        self.diverged > 0 || self.failed > 0
    }
}

/// Re-solves one block against an effective free velocity; on a failed or
/// diverged diagonal solve the previous reaction is kept.
fn relax(
    params: &GaussSeidelParams,
    dia: &mut DiagBlock,
    b_eff: Vec3,
    dynamic: bool,
    h: f64,
    tally: &mut SweepTally,
) {
    let r0 = dia.r;
    let begin = Instant::now();
    let out = diagonal::solve(
        params.diag_solver,
        params.diag_epsilon,
        params.diag_max_iter,
        dynamic,
        h,
        dia,
        b_eff,
    );
    tally.diagonal += begin.elapsed();
    match out {
        DiagOutcome::Converged(_) => {}
        DiagOutcome::Diverged(_) => {
            tally.diverged += 1;
            dia.r = r0;
        }
        DiagOutcome::Failed => {
            tally.failed += 1;
            dia.r = r0;
        }
    }

    tally.errup += (dia.r - r0).norm_squared();
    tally.errlo += dia.r.norm_squared();
}

impl GaussSeidel {
    pub fn new(params: GaussSeidelParams) -> Self {
        GaussSeidel {
            params,
            error_history: Vec::new(),
            timings: SolveTimings::default(),
            domain_times: Vec::new(),
        }
    }

    fn sweep_serial(&self, ldy: &mut LocalDynamics, backward: bool) -> SweepTally {
        let (dynamic, h) = (ldy.dynamic, ldy.h);
        let n = ldy.blocks.len();
        let mut tally = SweepTally::default();
        let order: Box<dyn Iterator<Item = usize>> = if backward {
            Box::new((0..n).rev())
        } else {
            Box::new(0..n)
        };
        for i in order {
            let b_eff = {
                let dia = &ldy.blocks[i];
                let mut b = dia.b;
                for o in &dia.adj {
                    b += o.w * ldy.blocks[o.block].r;
                }
                b
            };
            relax(
                &self.params,
                &mut ldy.blocks[i],
                b_eff,
                dynamic,
                h,
                &mut tally,
            );
        }
        tally
    }

    /// Relaxes one domain chunk in place. Neighbours already updated in this
    /// sweep are read fresh, all others from the snapshot.
    fn domain_sweep(
        params: &GaussSeidelParams,
        chunk: &mut [DiagBlock],
        start: usize,
        snapshot: &[Vec3],
        dynamic: bool,
        h: f64,
        backward: bool,
    ) -> SweepTally {
        let mut tally = SweepTally::default();
        let n = chunk.len();
        if backward {
            for k in (0..n).rev() {
                let (head, fresh) = chunk.split_at_mut(k + 1);
                let dia = &mut head[k];
                let mut b = dia.b;
                for o in &dia.adj {
                    let r = if o.block > start + k && o.block < start + n {
                        fresh[o.block - start - k - 1].r
                    } else {
                        snapshot[o.block]
                    };
                    b += o.w * r;
                }
                relax(params, dia, b, dynamic, h, &mut tally);
            }
        } else {
            for k in 0..n {
                let (done, rest) = chunk.split_at_mut(k);
                let dia = &mut rest[0];
                let mut b = dia.b;
                for o in &dia.adj {
                    let r = if o.block >= start && o.block < start + k {
                        done[o.block - start].r
                    } else {
                        snapshot[o.block]
                    };
                    b += o.w * r;
                }
                relax(params, dia, b, dynamic, h, &mut tally);
            }
        }
        tally
    }

    fn sweep_parallel(
        &mut self,
        ldy: &mut LocalDynamics,
        set: &DomainSet,
        backward: bool,
    ) -> (SweepTally, f64) {
        let (dynamic, h) = (ldy.dynamic, ldy.h);
        let exchange = Instant::now();
        let snapshot: Vec<Vec3> = ldy.blocks.iter().map(|d| d.r).collect();
        let ranges = set.ranges().to_vec();

        let mut chunks: Vec<(&mut [DiagBlock], usize)> = Vec::with_capacity(ranges.len());
        let mut rest = ldy.blocks.as_mut_slice();
        for r in &ranges {
            let (chunk, tail) = rest.split_at_mut(r.len());
            chunks.push((chunk, r.start));
            rest = tail;
        }
        self.timings.communication += exchange.elapsed();

        let params = &self.params;
        let per_domain: Vec<(SweepTally, f64, Duration)> = chunks
            .into_par_iter()
            .map(|(chunk, start)| {
                let begin = Instant::now();
                let tally =
                    Self::domain_sweep(params, chunk, start, &snapshot, dynamic, h, backward);
                // The global residual is the worst domain's residual.
                (
                    tally,
                    relative_error(tally.errup, tally.errlo),
                    begin.elapsed(),
                )
            })
            .collect();

        self.domain_times.resize(per_domain.len(), Duration::ZERO);
        let mut merged = SweepTally::default();
        let mut worst = 0.0f64;
        for (d, (tally, err, spent)) in per_domain.into_iter().enumerate() {
            merged = merged.merge(tally);
            worst = worst.max(err);
            self.domain_times[d] += spent;
        }
        (merged, worst)
    }

    /// Applies the failure policy to a troubled sweep. Failed rows already
    /// kept their previous reactions; only abort decisions remain.
    fn handle_trouble(
        &self,
        ldy: &mut LocalDynamics,
        tally: &SweepTally,
        iterations: u32,
        error: f64,
        monitor: &mut dyn Monitor,
    ) -> Result<Control, Error> {
        log::warn!(
            "gauss-seidel sweep {}: {} diverged, {} failed diagonal blocks",
            iterations,
            tally.diverged,
            tally.failed
        );
        match self.params.failure {
            FailurePolicy::Continue => Ok(Control::Continue),
            FailurePolicy::Exit => Err(Error::NonConvergence {
                iterations,
                residual: error,
            }),
            FailurePolicy::Delegate => {
                let info = SolveInfo {
                    iterations,
                    residual: error,
                    merit: merit(ldy, true),
                    status: Status::IterationLimit,
                };
                Ok(monitor.on_failure(&info))
            }
        }
    }
}

impl ContactSolver for GaussSeidel {
    fn solve(
        &mut self,
        ldy: &mut LocalDynamics,
        domains: Option<&DomainSet>,
        monitor: &mut dyn Monitor,
    ) -> Result<SolveInfo, Error> {
        self.error_history.clear();
        self.timings = SolveTimings::default();
        self.domain_times.clear();
        // The semismooth diagonal solver relaxes the persistent velocity.
        ldy.update_velocities();

        let mut iterations = 0;
        let mut error;
        loop {
            let backward = self.params.reverse && iterations % 2 == 1;
            let sweep_begin = Instant::now();
            let tally = match domains {
                Some(set) if set.num_domains() > 1 => {
                    let (tally, worst) = self.sweep_parallel(ldy, set, backward);
                    error = worst;
                    tally
                }
                _ => {
                    let tally = self.sweep_serial(ldy, backward);
                    error = relative_error(tally.errup, tally.errlo);
                    tally
                }
            };
            self.timings.sweeps += sweep_begin.elapsed();
            self.timings.diagonal += tally.diagonal;
            iterations += 1;
            if self.params.record_history {
                self.error_history.push(error);
            }

            if tally.troubled()
                && self.handle_trouble(ldy, &tally, iterations, error, monitor)? == Control::Abort
            {
                return Ok(SolveInfo {
                    iterations,
                    residual: error,
                    merit: merit(ldy, true),
                    status: Status::Interrupted,
                });
            }

            let stats = IterationStats {
                iteration: iterations,
                residual: error,
                merit: None,
            };
            if monitor.inspect(&stats) == Control::Abort {
                return Ok(SolveInfo {
                    iterations,
                    residual: error,
                    merit: merit(ldy, true),
                    status: Status::Interrupted,
                });
            }

            if error <= self.params.epsilon || iterations >= self.params.max_iter {
                break;
            }
        }

        let converged = error <= self.params.epsilon;
        let merit_begin = Instant::now();
        let final_merit = merit(ldy, true);
        self.timings.merit += merit_begin.elapsed();
        let info = SolveInfo {
            iterations,
            residual: error,
            merit: final_merit,
            status: if converged {
                Status::Converged
            } else {
                Status::IterationLimit
            },
        };
        if !converged {
            match self.params.failure {
                FailurePolicy::Continue => {
                    log::debug!(
                        "gauss-seidel stopped at the sweep limit: residual {:.3e} after {} sweeps",
                        error,
                        iterations
                    );
                }
                FailurePolicy::Exit => {
                    log::warn!(
                        "gauss-seidel diverged: residual {:.3e} after {} sweeps",
                        error,
                        iterations
                    );
                    return Err(Error::NonConvergence {
                        iterations,
                        residual: error,
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
        log::debug!(
            "gauss-seidel: {} sweeps, residual {:.3e}, merit {:.3e}",
            info.iterations,
            info.residual,
            info.merit
        );
        Ok(info)
    }

    fn timings(&self) -> SolveTimings {
        self.timings
    }

    fn domain_load(&self) -> &[Duration] {
        &self.domain_times
    }
}
