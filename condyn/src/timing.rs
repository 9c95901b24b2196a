//! Per-step phase timings.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Sub-phase durations of one contact solve. Strategies fill the fields they
/// exercise and leave the rest at zero.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct SolveTimings {
    /// Gauss-Seidel sweep loops, diagonal solves included.
    pub sweeps: Duration,
    /// Single-contact diagonal solves within the sweeps.
    pub diagonal: Duration,
    /// Inner linear solves of the Newton strategy.
    pub linear: Duration,
    pub line_search: Duration,
    /// Merit function evaluations.
    pub merit: Duration,
    /// Interface snapshot exchange between parallel sweep barriers.
    pub communication: Duration,
}

impl SolveTimings {
    pub fn accumulate(&mut self, other: &SolveTimings) {
        self.sweeps += other.sweeps;
        self.diagonal += other.diagonal;
        self.linear += other.linear;
        self.line_search += other.line_search;
        self.merit += other.merit;
        self.communication += other.communication;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct Timings {
    pub detection: Duration,
    pub assembly: Duration,
    pub partitioning: Duration,
    pub solve: Duration,
    pub solve_detail: SolveTimings,
    /// Interface reaction exchange of the parallel solve.
    pub communication: Duration,
    pub integration: Duration,
    pub output: Duration,
    pub total: Duration,
}

impl Timings {
    pub fn clear(&mut self) {
        *self = Timings::default();
    }

    /// Folds another step's timings into this one.
    pub fn accumulate(&mut self, other: &Timings) {
        self.detection += other.detection;
        self.assembly += other.assembly;
        self.partitioning += other.partitioning;
        self.solve += other.solve;
        self.solve_detail.accumulate(&other.solve_detail);
        self.communication += other.communication;
        self.integration += other.integration;
        self.output += other.output;
        self.total += other.total;
    }
}

impl Display for Timings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Timings (ms):")?;
        writeln!(f, "  Detection time:     {}", self.detection.as_millis())?;
        writeln!(f, "  Assembly time:      {}", self.assembly.as_millis())?;
        writeln!(f, "  Partitioning time:  {}", self.partitioning.as_millis())?;
        writeln!(f, "  Solve time:         {}", self.solve.as_millis())?;
        writeln!(f, "    Sweeps:           {}", self.solve_detail.sweeps.as_millis())?;
        writeln!(f, "    Diagonal solves:  {}", self.solve_detail.diagonal.as_millis())?;
        writeln!(f, "    Linear solves:    {}", self.solve_detail.linear.as_millis())?;
        writeln!(f, "    Line search:      {}", self.solve_detail.line_search.as_millis())?;
        writeln!(f, "    Merit:            {}", self.solve_detail.merit.as_millis())?;
        writeln!(f, "  Communication time: {}", self.communication.as_millis())?;
        writeln!(f, "  Integration time:   {}", self.integration.as_millis())?;
        writeln!(f, "  Output time:        {}", self.output.as_millis())?;
        writeln!(f, "  Total step time     {}", self.total.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_phases() {
        let mut a = Timings {
            detection: Duration::from_millis(2),
            solve: Duration::from_millis(10),
            ..Default::default()
        };
        let b = Timings {
            detection: Duration::from_millis(3),
            total: Duration::from_millis(20),
            ..Default::default()
        };
        a.accumulate(&b);
        assert_eq!(a.detection, Duration::from_millis(5));
        assert_eq!(a.solve, Duration::from_millis(10));
        assert_eq!(a.total, Duration::from_millis(20));
        a.clear();
        assert_eq!(a, Timings::default());
    }

    #[test]
    fn accumulate_sums_solve_sub_phases() {
        let mut a = Timings::default();
        a.solve_detail.sweeps = Duration::from_millis(4);
        a.communication = Duration::from_millis(1);
        let mut b = Timings::default();
        b.solve_detail.sweeps = Duration::from_millis(6);
        b.solve_detail.linear = Duration::from_millis(2);
        b.communication = Duration::from_millis(2);
        a.accumulate(&b);
        assert_eq!(a.solve_detail.sweeps, Duration::from_millis(10));
        assert_eq!(a.solve_detail.linear, Duration::from_millis(2));
        assert_eq!(a.communication, Duration::from_millis(3));
    }
}
