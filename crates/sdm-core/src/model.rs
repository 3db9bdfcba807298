//! Solver-ready subproblem models.
//!
//! A [`Model`] is the opaque object the coordinators hand to a solver
//! backend: bounded (optionally integer) variables, linear constraints and
//! a convex quadratic objective. It is intentionally small; builders fill
//! it in, the registry appends coordination terms, and backends translate
//! it into their own representation.
//!
//! The objective is
//!
//! ```text
//!   constant + Σ c_i x_i + Σ q_ij x_i x_j
//! ```
//!
//! where each quadratic entry multiplies the plain product `x_i x_j` (no
//! implicit one-half).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SdmError, SdmResult};
use crate::tree::NodeId;

/// Column index of a model variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(usize);

impl VarId {
    #[inline]
    pub fn new(value: usize) -> Self {
        VarId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Row index of a model constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintId(usize);

impl ConstraintId {
    #[inline]
    pub fn new(value: usize) -> Self {
        ConstraintId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub integer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    /// `terms <= rhs`
    Le,
    /// `terms >= rhs`
    Ge,
    /// `terms == rhs`
    Eq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConstraint {
    pub name: String,
    pub terms: Vec<(VarId, f64)>,
    pub sense: Sense,
    pub rhs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub constant: f64,
    pub linear: Vec<(VarId, f64)>,
    pub quadratic: Vec<(VarId, VarId, f64)>,
}

impl Objective {
    /// Evaluate at a full primal vector.
    pub fn evaluate(&self, x: &[f64]) -> f64 {
        let lin: f64 = self.linear.iter().map(|(v, c)| c * x[v.value()]).sum();
        let quad: f64 = self
            .quadratic
            .iter()
            .map(|(i, j, q)| q * x[i.value()] * x[j.value()])
            .sum();
        self.constant + lin + quad
    }
}

/// A minimization model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub variables: Vec<Variable>,
    pub constraints: Vec<LinearConstraint>,
    pub objective: Objective,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a continuous variable with bounds (use infinities for free).
    pub fn add_var(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> VarId {
        self.push_var(name.into(), lower, upper, false)
    }

    /// Add an integer variable with bounds.
    pub fn add_int_var(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> VarId {
        self.push_var(name.into(), lower, upper, true)
    }

    pub fn add_binary(&mut self, name: impl Into<String>) -> VarId {
        self.push_var(name.into(), 0.0, 1.0, true)
    }

    fn push_var(&mut self, name: String, lower: f64, upper: f64, integer: bool) -> VarId {
        let id = VarId::new(self.variables.len());
        self.variables.push(Variable {
            name,
            lower,
            upper,
            integer,
        });
        id
    }

    pub fn add_constraint(
        &mut self,
        name: impl Into<String>,
        terms: Vec<(VarId, f64)>,
        sense: Sense,
        rhs: f64,
    ) -> ConstraintId {
        let id = ConstraintId::new(self.constraints.len());
        self.constraints.push(LinearConstraint {
            name: name.into(),
            terms,
            sense,
            rhs,
        });
        id
    }

    pub fn add_linear_cost(&mut self, var: VarId, coefficient: f64) {
        self.objective.linear.push((var, coefficient));
    }

    pub fn add_quadratic_cost(&mut self, i: VarId, j: VarId, coefficient: f64) {
        self.objective.quadratic.push((i, j, coefficient));
    }

    pub fn add_constant_cost(&mut self, value: f64) {
        self.objective.constant += value;
    }

    pub fn num_vars(&self) -> usize {
        self.variables.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn var(&self, id: VarId) -> Option<&Variable> {
        self.variables.get(id.value())
    }

    pub fn has_integers(&self) -> bool {
        self.variables.iter().any(|v| v.integer)
    }

    pub fn has_quadratic(&self) -> bool {
        !self.objective.quadratic.is_empty()
    }

    /// Check variable references and bounds; `node` is used for attribution.
    pub fn validate(&self, node: NodeId) -> SdmResult<()> {
        let n = self.variables.len();
        let violation = |message: String| SdmError::BuilderContractViolation { node, message };

        for var in &self.variables {
            if var.lower.is_nan() || var.upper.is_nan() || var.lower > var.upper {
                return Err(violation(format!(
                    "variable '{}' has invalid bounds [{}, {}]",
                    var.name, var.lower, var.upper
                )));
            }
        }
        for con in &self.constraints {
            if let Some((v, _)) = con.terms.iter().find(|(v, _)| v.value() >= n) {
                return Err(violation(format!(
                    "constraint '{}' references unknown variable {}",
                    con.name, v
                )));
            }
        }
        let bad_obj = self.objective.linear.iter().any(|(v, _)| v.value() >= n)
            || self
                .objective
                .quadratic
                .iter()
                .any(|(i, j, _)| i.value() >= n || j.value() >= n);
        if bad_obj {
            return Err(violation(
                "objective references an unknown variable".to_string(),
            ));
        }
        Ok(())
    }

    /// Largest constraint or bound violation at `x` (zero when feasible).
    pub fn max_violation(&self, x: &[f64]) -> f64 {
        let mut worst: f64 = 0.0;
        for (var, &value) in self.variables.iter().zip(x) {
            worst = worst.max(var.lower - value).max(value - var.upper);
        }
        for con in &self.constraints {
            let lhs: f64 = con.terms.iter().map(|(v, c)| c * x[v.value()]).sum();
            let viol = match con.sense {
                Sense::Le => lhs - con.rhs,
                Sense::Ge => con.rhs - lhs,
                Sense::Eq => (lhs - con.rhs).abs(),
            };
            worst = worst.max(viol);
        }
        worst
    }
}
