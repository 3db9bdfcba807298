//! # sdm-core: Scenario Decomposition Core Types
//!
//! Provides the data structures shared by every part of the scenario
//! decomposition workspace.
//!
//! ## Design Philosophy
//!
//! A multistage stochastic program is stored as a **scenario tree** whose
//! nodes carry realization data. Each node is later turned into a small
//! subproblem by a user-supplied builder; the coordinators in `sdm-algo`
//! reconcile those subproblems through consensus (nonanticipativity)
//! constraints.
//!
//! - **Arena tree**: nodes live in a `Vec` and are addressed by [`NodeId`]
//! - **Opaque models**: a [`Model`] is only ever built, augmented and
//!   submitted to a solver backend
//! - **Typed slots**: coupling variables are declared once as [`VarId`]
//!   handles on a [`Subproblem`]
//!
//! ## Quick Start
//!
//! ```rust
//! use sdm_core::*;
//!
//! let tree = ScenarioTree::two_stage(
//!     Realization::new(),
//!     vec![
//!         (Realization::new().with_scalar("demand", 80.0), 0.5),
//!         (Realization::new().with_scalar("demand", 120.0), 0.5),
//!     ],
//! )
//! .unwrap();
//! tree.validate().unwrap();
//!
//! let mut model = Model::new();
//! let order = model.add_var("order", 0.0, 200.0);
//! model.add_linear_cost(order, 1.0);
//! let sub = Subproblem::new(model).with_input("order", vec![order]);
//! assert_eq!(sub.input("order"), Some(&[order][..]));
//! ```

pub mod error;
pub mod model;
pub mod realization;
pub mod subproblem;
pub mod tree;

pub use error::{SdmError, SdmResult};
pub use model::{ConstraintId, LinearConstraint, Model, Objective, Sense, VarId, Variable};
pub use realization::{Param, Realization};
pub use subproblem::{SlotKey, SlotSide, Subproblem};
pub use tree::{Node, NodeId, ScenarioTree, PROBABILITY_TOLERANCE};
