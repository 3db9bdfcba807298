//! Solver backends for node subproblems and the bundle master problem.

mod branch_bound;
mod conic;
mod traits;

pub use conic::ClarabelBackend;
pub use traits::{SolveOutcome, SolveStatus, SolverBackend, SolverConfig};
