//! # sdm-algo: Scenario Decomposition Coordinators
//!
//! Solves multistage stochastic programs by splitting them into one
//! subproblem per scenario-tree node and coordinating the pieces.
//!
//! ## Methods
//!
//! | Mode | Coordination | Bound |
//! |------|--------------|-------|
//! | [`Mode::Admm`] | Consensus ADMM / progressive hedging | none |
//! | [`Mode::Bundle`] | Lagrangian dual, proximal bundle master | valid lower bound |
//!
//! ### Architecture
//!
//! - **[`SubproblemRegistry`]**: per-node or per-stage builders, run once
//! - **[`ConsensusLayer`]**: coupling groups and constraints derived from
//!   the tree and the declared slots
//! - **[`UpdateRule`]**: the master algorithm ([`AdmmRule`], [`BundleRule`])
//! - **[`SolverBackend`]**: pluggable subproblem solver
//!   ([`ClarabelBackend`] by default)
//! - **[`Coordinator`]**: parallel solve phase, barrier, update, trace
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sdm_algo::{BuilderTarget, ClarabelBackend, Coordinator, CoordinatorConfig, SubproblemRegistry};
//! use sdm_core::{Model, Subproblem};
//!
//! let mut registry = SubproblemRegistry::new();
//! registry.register_fn(BuilderTarget::Stage(1), |ctx| {
//!     let mut model = Model::new();
//!     let x = model.add_var("x", 0.0, 10.0);
//!     model.add_linear_cost(x, ctx.realization.scalar("cost").unwrap_or(1.0));
//!     Ok(Subproblem::new(model).with_input("x", vec![x]))
//! });
//!
//! let mut coordinator = Coordinator::new(
//!     &tree,
//!     registry,
//!     Arc::new(ClarabelBackend),
//!     CoordinatorConfig::admm(10.0),
//! )?;
//! let report = coordinator.run();
//! println!("{} after {} iterations", report.status, report.iterations);
//! ```

pub mod admm;
pub mod backend;
pub mod bundle;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod registry;
pub mod rule;
pub mod state;

pub use admm::AdmmRule;
pub use backend::{ClarabelBackend, SolveOutcome, SolveStatus, SolverBackend, SolverConfig};
pub use bundle::{Bundle, BundleRule};
pub use config::{load_config, BundleConfig, CoordinatorConfig, Mode};
pub use consensus::{ConsensusLayer, CouplingConstraint, CouplingGroup, Participant};
pub use coordinator::Coordinator;
pub use registry::{
    BuildContext, BuilderTarget, CoordinationTerm, NodeSolve, SubproblemBuilder,
    SubproblemRegistry,
};
pub use rule::{UpdateContext, UpdateOutcome, UpdateRule};
pub use state::{
    CoordinationReport, CoordinationStatus, Cut, DualState, FailureReport, IterationRecord,
    NodeSolution, Phase, PhaseTimes, StepKind,
};
