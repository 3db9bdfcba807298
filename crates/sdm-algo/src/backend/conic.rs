//! Clarabel backend for LP and convex QP subproblems.
//!
//! Clarabel solves the conic program
//!
//! ```text
//!   minimize    (1/2)x'Px + q'x
//!   subject to  Ax + s = b
//!               s ∈ K (product of cones)
//! ```
//!
//! A [`Model`] maps onto it directly: equality rows go into a zero cone,
//! `<=` rows, negated `>=` rows and finite variable bounds go into one
//! nonnegative cone. Integer variables are handled by
//! [`super::branch_bound`] on top of the continuous relaxation solved here.

use std::collections::BTreeMap;

use clarabel::{
    algebra::CscMatrix,
    solver::{DefaultSettingsBuilder, IPSolver, SolverStatus, SupportedConeT},
};
use sdm_core::{Model, Sense};
use web_time::Instant;

use super::branch_bound;
use super::traits::{SolveOutcome, SolveStatus, SolverBackend, SolverConfig};

/// Slack allowed when presolve compares tightened bounds.
const BOUND_TOLERANCE: f64 = 1e-9;

/// Clarabel backend for LP and QP problems.
///
/// Clarabel is a pure-Rust interior-point solver that's always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClarabelBackend;

impl SolverBackend for ClarabelBackend {
    fn id(&self) -> &str {
        "clarabel"
    }

    fn supports_integers(&self) -> bool {
        true
    }

    fn solve(&self, model: &Model, config: &SolverConfig) -> SolveOutcome {
        let start = Instant::now();
        let bounds: Vec<(f64, f64)> = model
            .variables
            .iter()
            .map(|v| (v.lower, v.upper))
            .collect();

        if model.has_integers() {
            return branch_bound::solve(model, bounds, config, start);
        }

        let mut outcome = solve_relaxation(model, &bounds, config, config.timeout_seconds);
        if outcome.status == SolveStatus::Optimal {
            outcome.objective = model.objective.evaluate(&outcome.primal);
        }
        outcome
    }
}

/// Tighten bounds with singleton rows; `None` when they cross.
///
/// Singleton rows stay in the model, so this only sharpens infeasibility
/// detection and gives branch-and-bound honest starting bounds.
pub(crate) fn presolve_bounds(model: &Model, bounds: &[(f64, f64)]) -> Option<Vec<(f64, f64)>> {
    let mut tightened = bounds.to_vec();
    for con in &model.constraints {
        let [(var, coef)] = con.terms.as_slice() else {
            continue;
        };
        if coef.abs() < f64::EPSILON {
            continue;
        }
        let j = var.value();
        let value = con.rhs / coef;
        // `coef * x (sense) rhs`: a negative coefficient flips the inequality
        let (upper, lower) = match (con.sense, *coef > 0.0) {
            (Sense::Eq, _) => (Some(value), Some(value)),
            (Sense::Le, true) | (Sense::Ge, false) => (Some(value), None),
            (Sense::Le, false) | (Sense::Ge, true) => (None, Some(value)),
        };
        if let Some(ub) = upper {
            tightened[j].1 = tightened[j].1.min(ub);
        }
        if let Some(lb) = lower {
            tightened[j].0 = tightened[j].0.max(lb);
        }
    }

    let crossing = tightened.iter().any(|(lb, ub)| {
        *lb > *ub + BOUND_TOLERANCE * (1.0 + lb.abs().max(ub.abs()).min(1e12))
    });
    if crossing {
        None
    } else {
        Some(tightened)
    }
}

/// Solve the continuous relaxation of `model` under the given bounds.
///
/// The returned objective is Clarabel's; callers that need the constant
/// term re-evaluate with [`sdm_core::Objective::evaluate`].
pub(crate) fn solve_relaxation(
    model: &Model,
    bounds: &[(f64, f64)],
    config: &SolverConfig,
    time_limit: f64,
) -> SolveOutcome {
    if presolve_bounds(model, bounds).is_none() {
        return SolveOutcome::failed(SolveStatus::Infeasible, "variable bounds cross in presolve");
    }
    match invoke_clarabel(model, bounds, config, time_limit) {
        Ok(outcome) => outcome,
        Err(message) => SolveOutcome::failed(SolveStatus::Error, message),
    }
}

fn invoke_clarabel(
    model: &Model,
    bounds: &[(f64, f64)],
    config: &SolverConfig,
    time_limit: f64,
) -> Result<SolveOutcome, String> {
    let n_var = model.num_vars();

    // ------------------------------------------------------------------
    // Objective: P holds the upper triangle of the Hessian, so a diagonal
    // term q·x² contributes 2q and an off-diagonal q·xᵢxⱼ contributes q.
    // ------------------------------------------------------------------
    let mut p_entries: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for &(i, j, q) in &model.objective.quadratic {
        let (i, j) = (i.value(), j.value());
        if i == j {
            *p_entries.entry((i, i)).or_insert(0.0) += 2.0 * q;
        } else {
            let (row, col) = (i.min(j), i.max(j));
            *p_entries.entry((col, row)).or_insert(0.0) += q;
        }
    }
    let mut p_col_ptr = Vec::with_capacity(n_var + 1);
    let mut p_row_idx = Vec::with_capacity(p_entries.len());
    let mut p_values = Vec::with_capacity(p_entries.len());
    let mut entries = p_entries.into_iter().peekable();
    for col in 0..n_var {
        p_col_ptr.push(p_row_idx.len());
        while let Some(&((c, row), value)) = entries.peek() {
            if c != col {
                break;
            }
            p_row_idx.push(row);
            p_values.push(value);
            entries.next();
        }
    }
    p_col_ptr.push(p_row_idx.len());

    let mut obj = vec![0.0; n_var];
    for &(v, c) in &model.objective.linear {
        obj[v.value()] += c;
    }

    // ------------------------------------------------------------------
    // Constraint rows, accumulated column-wise. Equalities first so that
    // the zero cone precedes the nonnegative cone.
    // ------------------------------------------------------------------
    let mut columns: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_var];
    let mut rhs = Vec::new();
    // (row, sign) for each model constraint, to map duals back
    let mut row_of: Vec<(usize, f64)> = vec![(0, 1.0); model.num_constraints()];

    for (k, con) in model.constraints.iter().enumerate() {
        if con.sense == Sense::Eq {
            let row = rhs.len();
            rhs.push(con.rhs);
            for &(v, c) in &con.terms {
                columns[v.value()].push((row, c));
            }
            row_of[k] = (row, 1.0);
        }
    }
    // Fixed variables go to the zero cone as well
    let is_fixed = |(lb, ub): (f64, f64)| lb.is_finite() && lb == ub;
    for (j, &b) in bounds.iter().enumerate() {
        if is_fixed(b) {
            let row = rhs.len();
            rhs.push(b.0);
            columns[j].push((row, 1.0));
        }
    }
    let n_eq = rhs.len();

    for (k, con) in model.constraints.iter().enumerate() {
        let sign = match con.sense {
            Sense::Eq => continue,
            Sense::Le => 1.0,
            Sense::Ge => -1.0,
        };
        let row = rhs.len();
        rhs.push(sign * con.rhs);
        for &(v, c) in &con.terms {
            columns[v.value()].push((row, sign * c));
        }
        row_of[k] = (row, sign);
    }

    for (j, &(lb, ub)) in bounds.iter().enumerate() {
        if is_fixed((lb, ub)) {
            continue;
        }
        if ub.is_finite() {
            let row = rhs.len();
            rhs.push(ub);
            columns[j].push((row, 1.0));
        }
        if lb.is_finite() {
            let row = rhs.len();
            rhs.push(-lb);
            columns[j].push((row, -1.0));
        }
    }
    let n_rows = rhs.len();
    let n_ineq = n_rows - n_eq;

    let mut col_ptr = Vec::with_capacity(n_var + 1);
    let mut row_idx = Vec::new();
    let mut values = Vec::new();
    for column in columns.iter_mut() {
        col_ptr.push(row_idx.len());
        // Sort entries in this column by row index (required for CSC) and
        // merge repeated variables within one row
        column.sort_by_key(|(r, _)| *r);
        for &(r, v) in column.iter() {
            if row_idx.len() > *col_ptr.last().unwrap_or(&0) && row_idx.last() == Some(&r) {
                if let Some(last) = values.last_mut() {
                    *last += v;
                }
            } else {
                row_idx.push(r);
                values.push(v);
            }
        }
    }
    col_ptr.push(row_idx.len());

    let a_mat = CscMatrix::new(n_rows, n_var, col_ptr, row_idx, values);
    let p_mat = CscMatrix::new(n_var, n_var, p_col_ptr, p_row_idx, p_values);

    let mut cones = Vec::with_capacity(2);
    if n_eq > 0 {
        cones.push(SupportedConeT::ZeroConeT(n_eq));
    }
    if n_ineq > 0 {
        cones.push(SupportedConeT::NonnegativeConeT(n_ineq));
    }

    let settings = DefaultSettingsBuilder::default()
        .verbose(false)
        .max_iter(config.max_iterations)
        .time_limit(time_limit.max(0.0))
        .tol_gap_abs(config.tolerance)
        .tol_gap_rel(config.tolerance)
        .tol_feas(config.tolerance)
        .build()
        .map_err(|e| format!("Clarabel settings error: {:?}", e))?;

    let mut solver =
        clarabel::solver::DefaultSolver::new(&p_mat, &obj, &a_mat, &rhs, &cones, settings)
            .map_err(|e| format!("Clarabel initialization failed: {:?}", e))?;
    solver.solve();

    let sol = &solver.solution;
    let status = match sol.status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => SolveStatus::Optimal,
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            SolveStatus::Infeasible
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => {
            SolveStatus::Unbounded
        }
        other => {
            return Ok(SolveOutcome {
                iterations: sol.iterations as usize,
                ..SolveOutcome::failed(
                    SolveStatus::Error,
                    format!("Clarabel returned status {:?}", other),
                )
            })
        }
    };

    if status != SolveStatus::Optimal {
        return Ok(SolveOutcome {
            iterations: sol.iterations as usize,
            ..SolveOutcome::failed(status, format!("Clarabel returned status {:?}", sol.status))
        });
    }

    let duals = row_of
        .iter()
        .map(|&(row, sign)| sign * sol.z[row])
        .collect::<Vec<f64>>();

    Ok(SolveOutcome {
        status,
        objective: sol.obj_val,
        primal: sol.x.clone(),
        duals: Some(duals),
        iterations: sol.iterations as usize,
        message: None,
    })
}
