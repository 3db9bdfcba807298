//! Demo problems driven by `sdm run`.
//!
//! Both demos read everything they need from the node realization and the
//! registry parameters, so the same builders work on trees loaded from
//! files.

use anyhow::{anyhow, Result};
use sdm_algo::{BuilderTarget, SubproblemRegistry};
use sdm_core::{Model, Realization, ScenarioTree, SdmResult, Sense, Subproblem};

/// Three scenarios of `min −x + c·y  s.t. x + y <= 4`, integer `x, y ∈ [0, 2]`.
pub fn integer_tree() -> SdmResult<ScenarioTree> {
    ScenarioTree::two_stage(
        Realization::new(),
        [-2.0, 3.0, 0.5]
            .into_iter()
            .map(|c| (Realization::new().with_scalar("c", c), 1.0 / 3.0)),
    )
}

/// Scenario builders for the integer demo; `x` is the shared decision.
pub fn integer_registry(params: Realization) -> SubproblemRegistry {
    let mut registry = SubproblemRegistry::new().with_params(params);
    registry.register_fn(BuilderTarget::Stage(1), |ctx| {
        let upper = ctx.params.scalar("upper").unwrap_or(2.0);
        let capacity = ctx.params.scalar("capacity").unwrap_or(4.0);
        let mut model = Model::new();
        let x = model.add_int_var("x", 0.0, upper);
        let y = model.add_int_var("y", 0.0, upper);
        model.add_constraint("capacity", vec![(x, 1.0), (y, 1.0)], Sense::Le, capacity);
        model.add_linear_cost(x, -1.0);
        model.add_linear_cost(y, ctx.realization.scalar("c").unwrap_or(0.0));
        Ok(Subproblem::new(model).with_input("x", vec![x]))
    });
    registry
}

/// Default inventory parameters.
///
/// | name | meaning |
/// |------|---------|
/// | `a`  | production capacity per stage |
/// | `b`  | shortage penalty per unit |
/// | `c`  | production cost per unit |
/// | `c0` | holding cost per unit carried out of a stage |
/// | `d`  | stock on hand before the first stage |
pub fn inventory_params() -> Realization {
    Realization::new()
        .with_scalar("a", 60.0)
        .with_scalar("b", 10.0)
        .with_scalar("c", 1.0)
        .with_scalar("c0", 0.2)
        .with_scalar("d", 20.0)
}

/// Three stages of demand: 50 now, then low/high, then a further split.
pub fn inventory_tree() -> SdmResult<ScenarioTree> {
    let mut tree = ScenarioTree::new();
    let root = tree.create_root(Realization::new().with_scalar("demand", 50.0))?;
    tree.set_name(root, "now")?;
    for (name, demand) in [("low", 30.0), ("high", 70.0)] {
        let mid = tree.add_child(root, Realization::new().with_scalar("demand", demand), 0.5)?;
        tree.set_name(mid, name)?;
        for (suffix, delta, p) in [("down", -10.0, 0.3), ("up", 10.0, 0.7)] {
            let leaf = tree.add_child(
                mid,
                Realization::new().with_scalar("demand", demand + delta),
                p,
            )?;
            tree.set_name(leaf, format!("{}-{}", name, suffix))?;
        }
    }
    Ok(tree)
}

/// One builder for every stage: stock flows from parent to child.
///
/// Each node balances `stock_in + produce − stock + shortage = demand` and
/// pays `c·produce + c0·stock + b·shortage`. Leaves pay holding cost on
/// their own closing stock too.
pub fn inventory_registry(params: Realization, stages: usize) -> SubproblemRegistry {
    let mut registry = SubproblemRegistry::new().with_params(params);
    for stage in 0..stages {
        registry.register_fn(BuilderTarget::Stage(stage), |ctx| {
            let p = |name: &str, default: f64| ctx.params.scalar(name).unwrap_or(default);
            let capacity = p("a", 60.0);
            let demand = ctx.realization.scalar("demand").unwrap_or(0.0);
            let stock_cap = 10.0 * capacity.max(demand);

            let mut model = Model::new();
            let stock_in = if ctx.parent.is_none() {
                let d = p("d", 0.0);
                model.add_var("stock_in", d, d)
            } else {
                model.add_var("stock_in", 0.0, stock_cap)
            };
            let produce = model.add_var("produce", 0.0, capacity);
            let stock = model.add_var("stock", 0.0, stock_cap);
            let shortage = model.add_var("shortage", 0.0, f64::INFINITY);
            model.add_constraint(
                "balance",
                vec![(stock_in, 1.0), (produce, 1.0), (stock, -1.0), (shortage, 1.0)],
                Sense::Eq,
                demand,
            );
            model.add_linear_cost(produce, p("c", 1.0));
            model.add_linear_cost(stock, p("c0", 0.2));
            model.add_linear_cost(shortage, p("b", 10.0));

            let mut sub = Subproblem::new(model);
            if ctx.parent.is_some() {
                sub = sub.with_input("stock", vec![stock_in]);
            }
            if !ctx.is_leaf {
                sub = sub.with_output("stock", vec![stock]);
            }
            Ok(sub)
        });
    }
    registry
}

/// Parse `NAME=VALUE` overrides on top of `base`.
pub fn apply_params(mut base: Realization, overrides: &[String]) -> Result<Realization> {
    for entry in overrides {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("parameter '{}' must look like NAME=VALUE", entry))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("parameter '{}' has an empty name", entry));
        }
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|err| anyhow!("parameter '{}': {}", name, err))?;
        base.insert(name, sdm_core::Param::Scalar(value));
    }
    Ok(base)
}
