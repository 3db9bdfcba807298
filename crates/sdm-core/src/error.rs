//! Unified error types for scenario decomposition
//!
//! [`SdmError`] covers every failure the coordinators can report: tree
//! construction problems, builder contract violations, per-node solver
//! outcomes and numerical trouble in the master updates. Reaching the
//! iteration cap is deliberately absent: it is a terminal status, not an
//! error.
//!
//! # Example
//!
//! ```ignore
//! use sdm_core::{SdmError, SdmResult};
//!
//! fn build_tree() -> SdmResult<ScenarioTree> {
//!     let mut tree = ScenarioTree::new();
//!     let root = tree.create_root(Realization::new())?;
//!     tree.add_child(root, Realization::new(), 1.0)?;
//!     Ok(tree)
//! }
//! ```

use thiserror::Error;

use crate::tree::NodeId;

/// Unified error type for all decomposition operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdmError {
    /// Tree shape violates an invariant (second root, missing root, bad sums)
    #[error("Invalid tree state: {0}")]
    InvalidTreeState(String),

    /// A node identifier that the tree does not contain
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    /// Conditional probability outside (0, 1]
    #[error("Invalid probability {probability}: must lie in (0, 1]")]
    InvalidProbability { probability: f64 },

    /// A builder returned slots that do not line up with its parent
    #[error("Builder contract violated at node {node}: {message}")]
    BuilderContractViolation { node: NodeId, message: String },

    /// Backend failure, time limit, or phase timeout
    #[error("Solver error{}: {message}", node.map(|n| format!(" at node {n}")).unwrap_or_default())]
    SolverError {
        node: Option<NodeId>,
        message: String,
    },

    /// Node subproblem has no feasible point
    #[error("Subproblem at node {node} is infeasible")]
    Infeasible { node: NodeId },

    /// Node subproblem objective is unbounded below
    #[error("Subproblem at node {node} is unbounded")]
    Unbounded { node: NodeId },

    /// Master problem ill-conditioned or penalty diverging
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Configuration rejected before solving
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// I/O errors (kept as text so the error stays `Clone`)
    #[error("I/O error: {0}")]
    Io(String),

    /// Parsing/deserialization errors
    #[error("Parse error: {0}")]
    Parse(String),
}

impl SdmError {
    /// Node the error is attributed to, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            SdmError::UnknownNode(node)
            | SdmError::BuilderContractViolation { node, .. }
            | SdmError::Infeasible { node }
            | SdmError::Unbounded { node } => Some(*node),
            SdmError::SolverError { node, .. } => *node,
            _ => None,
        }
    }

    /// True for errors that must abort before any subproblem is solved.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            SdmError::InvalidTreeState(_)
                | SdmError::UnknownNode(_)
                | SdmError::InvalidProbability { .. }
                | SdmError::BuilderContractViolation { .. }
                | SdmError::InvalidConfig(_)
        )
    }
}

/// Convenience type alias for Results using SdmError.
pub type SdmResult<T> = Result<T, SdmError>;

impl From<std::io::Error> for SdmError {
    fn from(err: std::io::Error) -> Self {
        SdmError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SdmError {
    fn from(err: serde_json::Error) -> Self {
        SdmError::Parse(err.to_string())
    }
}

impl From<anyhow::Error> for SdmError {
    fn from(err: anyhow::Error) -> Self {
        SdmError::Parse(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SdmError::Infeasible {
            node: NodeId::new(3),
        };
        assert!(err.to_string().contains("node 3"));
        assert!(err.to_string().contains("infeasible"));
    }

    #[test]
    fn test_solver_error_display_without_node() {
        let err = SdmError::SolverError {
            node: None,
            message: "phase timeout".into(),
        };
        assert_eq!(err.to_string(), "Solver error: phase timeout");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SdmError = io_err.into();
        assert!(matches!(err, SdmError::Io(_)));
    }

    #[test]
    fn test_node_attribution() {
        let node = NodeId::new(7);
        assert_eq!(SdmError::Unbounded { node }.node(), Some(node));
        assert_eq!(SdmError::NumericalInstability("x".into()).node(), None);
    }

    #[test]
    fn test_setup_errors() {
        assert!(SdmError::InvalidProbability { probability: 1.5 }.is_setup_error());
        assert!(!SdmError::Infeasible {
            node: NodeId::new(0)
        }
        .is_setup_error());
    }
}
