//! Coordinator configuration.
//!
//! All options have defaults, so a config file only needs the fields it
//! changes:
//!
//! ```yaml
//! mode: bundle
//! kmax: 50
//! tmax: 30.0
//! bundle:
//!   proximal_weight: 2.0
//! solver:
//!   timeout_seconds: 10.0
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sdm_core::{SdmError, SdmResult};
use serde::{Deserialize, Serialize};

use crate::backend::SolverConfig;

/// Which master algorithm coordinates the subproblems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Consensus ADMM (progressive hedging)
    #[default]
    Admm,
    /// Lagrangian dual maximised by a proximal bundle method
    #[serde(alias = "lagrange_bundle")]
    Bundle,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Admm => write!(f, "admm"),
            Mode::Bundle => write!(f, "bundle"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = SdmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admm" => Ok(Mode::Admm),
            "bundle" | "lagrange_bundle" | "lagrange-bundle" => Ok(Mode::Bundle),
            other => Err(SdmError::InvalidConfig(format!("unknown mode '{}'", other))),
        }
    }
}

/// Proximal bundle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Initial proximal weight μ in `(1/2μ)‖λ − λ_center‖²`.
    ///
    /// Larger μ allows longer steps away from the center.
    pub proximal_weight: f64,
    /// Fraction of the predicted increase a candidate must realise to be
    /// accepted as a serious step.
    pub serious_fraction: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    /// Factor applied to μ after a serious step (and divided after a null step).
    pub weight_scale: f64,
    /// Cutting planes kept in the bundle.
    pub max_bundle_size: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            proximal_weight: 1.0,
            serious_fraction: 0.1,
            min_weight: 1e-4,
            max_weight: 1e4,
            weight_scale: 2.0,
            max_bundle_size: 50,
        }
    }
}

/// Options shared by both coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub mode: Mode,

    /// Iteration cap; zero performs no iterations.
    pub kmax: usize,

    /// ADMM penalty parameter ρ (ignored by the bundle method).
    pub rho: f64,

    /// Wall-clock budget in seconds for the whole run.
    pub tmax: Option<f64>,

    /// Primal residual tolerance, scaled by `sqrt(n)` like the ADMM
    /// thresholds: `‖x − z‖ < primal_tolerance * sqrt(n)`.
    pub primal_tolerance: f64,

    /// ADMM: dual residual tolerance (scaled by `sqrt(n)`).
    /// Bundle: relative tolerance on the predicted increase.
    pub dual_tolerance: f64,

    /// ADMM: solve the first sweep without coordination terms and start
    /// from the weighted average of those solutions. Ignored with a seed.
    pub warm_start: bool,

    /// Residual balancing of ρ between iterations.
    pub adaptive_penalty: bool,
    pub penalty_scale: f64,
    pub min_penalty: f64,
    pub max_penalty: f64,

    pub bundle: BundleConfig,

    /// Options forwarded to every backend call.
    pub solver: SolverConfig,

    /// Abort the iteration when one subproblem phase exceeds this many seconds.
    pub phase_timeout: Option<f64>,

    /// Worker threads for the subproblem phase (rayon global pool when absent).
    pub threads: Option<usize>,

    /// Initial consensus values (ADMM) or multipliers (bundle), flattened in
    /// coupling order. Zero when absent.
    pub seed: Option<Vec<f64>>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Admm,
            kmax: 100,
            rho: 1.0,
            tmax: None,
            primal_tolerance: 1e-4,
            dual_tolerance: 1e-4,
            warm_start: false,
            adaptive_penalty: false,
            penalty_scale: 2.0,
            min_penalty: 1e-4,
            max_penalty: 1e6,
            bundle: BundleConfig::default(),
            solver: SolverConfig::default(),
            phase_timeout: None,
            threads: None,
            seed: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn admm(rho: f64) -> Self {
        Self {
            mode: Mode::Admm,
            rho,
            ..Self::default()
        }
    }

    pub fn bundle() -> Self {
        Self {
            mode: Mode::Bundle,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_kmax(mut self, kmax: usize) -> Self {
        self.kmax = kmax;
        self
    }

    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn with_tmax(mut self, seconds: f64) -> Self {
        self.tmax = Some(seconds);
        self
    }

    pub fn with_tolerances(mut self, primal: f64, dual: f64) -> Self {
        self.primal_tolerance = primal;
        self.dual_tolerance = dual;
        self
    }

    pub fn with_warm_start(mut self, enabled: bool) -> Self {
        self.warm_start = enabled;
        self
    }

    pub fn with_adaptive_penalty(mut self, enabled: bool) -> Self {
        self.adaptive_penalty = enabled;
        self
    }

    pub fn with_bundle(mut self, bundle: BundleConfig) -> Self {
        self.bundle = bundle;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_phase_timeout(mut self, seconds: f64) -> Self {
        self.phase_timeout = Some(seconds);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_seed(mut self, seed: Vec<f64>) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reject values the coordinators cannot work with.
    pub fn validate(&self) -> SdmResult<()> {
        let invalid = |msg: String| Err(SdmError::InvalidConfig(msg));
        let positive = |name: &str, value: f64| -> SdmResult<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(SdmError::InvalidConfig(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )))
            }
        };

        positive("rho", self.rho)?;
        positive("primal_tolerance", self.primal_tolerance)?;
        positive("dual_tolerance", self.dual_tolerance)?;
        if let Some(tmax) = self.tmax {
            positive("tmax", tmax)?;
        }
        if let Some(timeout) = self.phase_timeout {
            positive("phase_timeout", timeout)?;
        }
        if self.threads == Some(0) {
            return invalid("threads must be at least 1".to_string());
        }

        if self.penalty_scale <= 1.0 || !self.penalty_scale.is_finite() {
            return invalid(format!(
                "penalty_scale must be greater than 1, got {}",
                self.penalty_scale
            ));
        }
        positive("min_penalty", self.min_penalty)?;
        if self.max_penalty < self.min_penalty {
            return invalid(format!(
                "max_penalty ({}) is below min_penalty ({})",
                self.max_penalty, self.min_penalty
            ));
        }

        let b = &self.bundle;
        positive("bundle.proximal_weight", b.proximal_weight)?;
        positive("bundle.min_weight", b.min_weight)?;
        if b.max_weight < b.min_weight {
            return invalid(format!(
                "bundle.max_weight ({}) is below bundle.min_weight ({})",
                b.max_weight, b.min_weight
            ));
        }
        if !(b.serious_fraction > 0.0 && b.serious_fraction < 1.0) {
            return invalid(format!(
                "bundle.serious_fraction must lie in (0, 1), got {}",
                b.serious_fraction
            ));
        }
        if b.weight_scale < 1.0 || !b.weight_scale.is_finite() {
            return invalid(format!(
                "bundle.weight_scale must be at least 1, got {}",
                b.weight_scale
            ));
        }
        if b.max_bundle_size < 2 {
            return invalid("bundle.max_bundle_size must be at least 2".to_string());
        }

        positive("solver.tolerance", self.solver.tolerance)?;
        positive("solver.timeout_seconds", self.solver.timeout_seconds)?;
        if self.solver.max_nodes == 0 {
            return invalid("solver.max_nodes must be at least 1".to_string());
        }
        if let Some(seed) = &self.seed {
            if seed.iter().any(|v| !v.is_finite()) {
                return invalid("seed contains non-finite values".to_string());
            }
        }
        Ok(())
    }
}

/// Load a [`CoordinatorConfig`] from YAML or JSON, chosen by extension.
pub fn load_config(path: &Path) -> Result<CoordinatorConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading coordinator config '{}'", path.display()))?;
    let config: CoordinatorConfig = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
            serde_yaml::from_str(&data).context("parsing coordinator config yaml")?
        }
        Some(ext) if ext.eq_ignore_ascii_case("json") => {
            serde_json::from_str(&data).context("parsing coordinator config json")?
        }
        _ => serde_yaml::from_str(&data)
            .or_else(|_| serde_json::from_str(&data))
            .context("parsing coordinator config")?,
    };
    config
        .validate()
        .with_context(|| format!("validating coordinator config '{}'", path.display()))?;
    Ok(config)
}
