//! Depth-first branch-and-bound over Clarabel relaxations.
//!
//! Integer variables are branched on the most fractional value. Nodes whose
//! relaxation bound cannot beat the incumbent are pruned. Subproblems in a
//! decomposition are small, so a plain depth-first stack is enough.

use sdm_core::Model;
use tracing::debug;
use web_time::Instant;

use super::conic::{presolve_bounds, solve_relaxation};
use super::traits::{SolveOutcome, SolveStatus, SolverConfig};

/// A pending node of the search tree.
#[derive(Debug, Clone)]
struct SearchNode {
    bounds: Vec<(f64, f64)>,
    depth: usize,
}

/// Best integer-feasible point found so far.
#[derive(Debug, Clone)]
struct Incumbent {
    objective: f64,
    primal: Vec<f64>,
}

/// Solve `model` with integrality enforced on its integer variables.
pub(crate) fn solve(
    model: &Model,
    bounds: Vec<(f64, f64)>,
    config: &SolverConfig,
    start: Instant,
) -> SolveOutcome {
    let int_tol = config.integrality_tolerance;
    let is_integer: Vec<bool> = model.variables.iter().map(|v| v.integer).collect();

    // Integer bounds are rounded inward before the first relaxation
    let Some(mut root_bounds) = presolve_bounds(model, &bounds) else {
        return SolveOutcome::failed(SolveStatus::Infeasible, "variable bounds cross in presolve");
    };
    for (j, (lb, ub)) in root_bounds.iter_mut().enumerate() {
        if is_integer[j] {
            *lb = (*lb - int_tol).ceil();
            *ub = (*ub + int_tol).floor();
            if *lb > *ub {
                return SolveOutcome::failed(
                    SolveStatus::Infeasible,
                    format!("no integer value for '{}'", model.variables[j].name),
                );
            }
        }
    }

    let mut stack = vec![SearchNode {
        bounds: root_bounds,
        depth: 0,
    }];
    let mut incumbent: Option<Incumbent> = None;
    let mut explored = 0usize;
    let mut total_iterations = 0usize;
    let mut node_limit_hit = false;

    while let Some(node) = stack.pop() {
        if explored >= config.max_nodes {
            node_limit_hit = true;
            break;
        }
        let remaining = config.timeout_seconds - start.elapsed().as_secs_f64();
        if remaining <= 0.0 {
            return SolveOutcome::failed(
                SolveStatus::Error,
                format!("time limit reached after {} branch-and-bound nodes", explored),
            );
        }
        explored += 1;

        let relaxed = solve_relaxation(model, &node.bounds, config, remaining);
        total_iterations += relaxed.iterations;
        match relaxed.status {
            SolveStatus::Optimal => {}
            SolveStatus::Infeasible => continue,
            // An unbounded relaxation at the root means the integer program
            // is unbounded too (bounds are rational)
            SolveStatus::Unbounded if node.depth == 0 => return relaxed,
            SolveStatus::Unbounded => continue,
            SolveStatus::Error => return relaxed,
        }

        let bound = model.objective.evaluate(&relaxed.primal);
        if let Some(best) = &incumbent {
            if bound >= best.objective - config.tolerance.max(1e-9) * (1.0 + best.objective.abs()) {
                continue;
            }
        }

        match most_fractional(&relaxed.primal, &is_integer, int_tol) {
            None => {
                let mut primal = relaxed.primal;
                for (value, &integer) in primal.iter_mut().zip(&is_integer) {
                    if integer {
                        *value = value.round();
                    }
                }
                let objective = model.objective.evaluate(&primal);
                debug!(
                    node = explored,
                    depth = node.depth,
                    objective,
                    "new incumbent"
                );
                incumbent = Some(Incumbent { objective, primal });
            }
            Some(j) => {
                let value = relaxed.primal[j];
                let mut down = node.bounds.clone();
                down[j].1 = value.floor();
                let mut up = node.bounds;
                up[j].0 = value.ceil();
                // Down branch is popped first
                stack.push(SearchNode {
                    bounds: up,
                    depth: node.depth + 1,
                });
                stack.push(SearchNode {
                    bounds: down,
                    depth: node.depth + 1,
                });
            }
        }
    }

    match incumbent {
        Some(best) => SolveOutcome {
            status: SolveStatus::Optimal,
            objective: best.objective,
            primal: best.primal,
            duals: None,
            iterations: total_iterations,
            message: node_limit_hit
                .then(|| format!("node limit {} reached; best incumbent returned", config.max_nodes)),
        },
        None if node_limit_hit => SolveOutcome::failed(
            SolveStatus::Error,
            format!("node limit {} reached without an integer solution", config.max_nodes),
        ),
        None => SolveOutcome::failed(SolveStatus::Infeasible, "no integer-feasible point"),
    }
}

/// Index of the integer variable farthest from integrality.
fn most_fractional(x: &[f64], is_integer: &[bool], int_tol: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (j, (&value, &integer)) in x.iter().zip(is_integer).enumerate() {
        if !integer {
            continue;
        }
        let frac = (value - value.round()).abs();
        if frac <= int_tol {
            continue;
        }
        if best.map_or(true, |(_, f)| frac > f) {
            best = Some((j, frac));
        }
    }
    best.map(|(j, _)| j)
}
