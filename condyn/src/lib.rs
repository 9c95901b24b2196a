//! Constraint-based multibody contact dynamics.
//!
//! Per step the engine detects contacts between bodies, assembles the local
//! (Delassus) dynamics of the contact set, resolves all reactions at once
//! under a Signorini-Coulomb law, and advances each body with a two-half-step
//! leapfrog integrator. Rigid, pseudo-rigid and finite-element bodies are
//! supported, alongside motionless obstacles.

pub mod assembly;
pub mod detect;
pub mod history;
pub mod material;
pub mod objects;
pub mod output;
pub mod partition;
pub mod shape;
pub mod sim;
pub mod solvers;
pub mod timing;

pub use self::assembly::{DiagBlock, LocalDynamics};
pub use self::detect::Contact;
pub use self::history::{History, SeriesKey};
pub use self::material::{BulkMaterial, SurfaceMaterial, SurfaceMaterialSet};
pub use self::objects::{
    Body, BodyId, BodyRegistry, FemFormulation, Kinematics, PseudoRigidScheme, ReducedModel,
    RigidScheme,
};
pub use self::output::{FileSink, MemorySink, Snapshot, StateSink};
pub use self::partition::DomainSet;
pub use self::shape::{Aabb, ConvexPolyhedron, TetMesh};
pub use self::sim::{RunMode, RunSummary, SimKind, SimParams, Simulation, StepReport};
pub use self::solvers::{
    ContactSolver, Control, DiagSolverKind, FailurePolicy, GaussSeidel, GaussSeidelParams, Hybrid,
    HybridParams, IterationStats, Monitor, Newton, NewtonParams, NullMonitor, SolveInfo, Status,
};
pub use self::timing::{SolveTimings, Timings};

pub(crate) type Vec3 = na::Vector3<f64>;
pub(crate) type Mat3 = na::Matrix3<f64>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid parameter: {name:?}")]
    InvalidParameter { name: String },
    #[error("Degenerate shape on body {label:?}")]
    DegenerateShape { label: String },
    #[error("Reduced model dimension mismatch: expected {expected}, got {got}")]
    ReducedModelMismatch { expected: usize, got: usize },
    #[error("Singular local operator between bodies {master:?} and {slave:?}")]
    SingularLocalOperator { master: BodyId, slave: BodyId },
    #[error("Solver failed to converge: residual {residual} after {iterations} iterations")]
    NonConvergence { iterations: u32, residual: f64 },
    #[error("Domain communication mismatch: {detail}")]
    CommunicationMismatch { detail: String },
    #[error("Replay requested but no recorded frames are available")]
    NoRecordedFrames,
    #[error("File I/O error")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Snapshot encoding error")]
    Encode {
        #[from]
        source: bincode::Error,
    },
}

/// Relative error metric used by every solve strategy:
/// `sqrt(up) / sqrt(max(lo, 1))`.
pub(crate) fn relative_error(up: f64, lo: f64) -> f64 {
    up.sqrt() / lo.max(1.0).sqrt()
}
