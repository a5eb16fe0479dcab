//! Controller options: solver backend selection, regularization, tuning.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

fn default_solver_name() -> String {
    "clarabel".into()
}
const fn default_weight_shifter() -> f64 {
    0.001
}
const fn default_max_iter() -> u32 {
    200
}
const fn default_tol() -> f64 {
    1e-8
}

/// Options for a compiled reactive QP controller.
///
/// `weight_shifter` is the eTaSL-style regularization constant mu: it
/// keeps the task-tracking cost small relative to the slack cost so the
/// optimizer prefers satisfying constraints exactly over absorbing error
/// in slack. It is per-controller state, not a shared constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerOptions {
    /// QP backend name (default: "clarabel").
    #[serde(default = "default_solver_name")]
    pub solver_name: String,

    /// Regularization constant mu (default: 0.001).
    #[serde(default = "default_weight_shifter")]
    pub weight_shifter: f64,

    /// Backend tuning.
    #[serde(default)]
    pub solver: SolverOptions,

    /// Backend-specific keys passed through unmodified.
    #[serde(default, skip_serializing_if = "toml::value::Table::is_empty")]
    pub solver_opts: toml::value::Table,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            solver_name: default_solver_name(),
            weight_shifter: default_weight_shifter(),
            solver: SolverOptions::default(),
            solver_opts: toml::value::Table::new(),
        }
    }
}

impl ControllerOptions {
    /// Validate options. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.solver_name != "clarabel" {
            return Err(ConfigError::UnknownSolver(self.solver_name.clone()));
        }
        if !(self.weight_shifter.is_finite() && self.weight_shifter > 0.0) {
            return Err(ConfigError::InvalidWeightShifter(self.weight_shifter));
        }
        self.solver.validate()
    }

    /// Parse options from a TOML string.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}

/// QP backend tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Maximum solver iterations per tick (default: 200).
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,

    /// Absolute duality-gap tolerance (default: 1e-8).
    #[serde(default = "default_tol")]
    pub tol_gap_abs: f64,

    /// Relative duality-gap tolerance (default: 1e-8).
    #[serde(default = "default_tol")]
    pub tol_gap_rel: f64,

    /// Feasibility tolerance (default: 1e-8).
    #[serde(default = "default_tol")]
    pub tol_feas: f64,

    /// Solver verbosity (default: off).
    #[serde(default)]
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            tol_gap_abs: default_tol(),
            tol_gap_rel: default_tol(),
            tol_feas: default_tol(),
            verbose: false,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iter == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_iter",
                message: "must be > 0".into(),
            });
        }
        for (field, tol) in [
            ("tol_gap_abs", self.tol_gap_abs),
            ("tol_gap_rel", self.tol_gap_rel),
            ("tol_feas", self.tol_feas),
        ] {
            if !(tol.is_finite() && tol > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: format!("must be finite and > 0, got {tol}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = ControllerOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.solver_name, "clarabel");
        assert!((options.weight_shifter - 0.001).abs() < 1e-12);
        assert_eq!(options.solver.max_iter, 200);
        assert!(!options.solver.verbose);
    }

    #[test]
    fn unknown_solver_rejected() {
        let options = ControllerOptions {
            solver_name: "qpoases".into(),
            ..ControllerOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::UnknownSolver(name)) if name == "qpoases"
        ));
    }

    #[test]
    fn nonpositive_weight_shifter_rejected() {
        for mu in [0.0, -0.1, f64::NAN] {
            let options = ControllerOptions {
                weight_shifter: mu,
                ..ControllerOptions::default()
            };
            assert!(matches!(
                options.validate(),
                Err(ConfigError::InvalidWeightShifter(_))
            ));
        }
    }

    #[test]
    fn zero_max_iter_rejected() {
        let options = ControllerOptions {
            solver: SolverOptions {
                max_iter: 0,
                ..SolverOptions::default()
            },
            ..ControllerOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidValue { field: "max_iter", .. })
        ));
    }

    #[test]
    fn parse_from_toml_with_partial_fields() {
        let options = ControllerOptions::from_toml_str(
            r#"
            weight_shifter = 0.01

            [solver]
            max_iter = 50
            verbose = true
            "#,
        )
        .unwrap();
        assert_eq!(options.solver_name, "clarabel"); // default
        assert!((options.weight_shifter - 0.01).abs() < 1e-12);
        assert_eq!(options.solver.max_iter, 50);
        assert!(options.solver.verbose);
        assert!((options.solver.tol_feas - 1e-8).abs() < 1e-20); // default
    }

    #[test]
    fn unrecognized_backend_keys_pass_through() {
        let options = ControllerOptions::from_toml_str(
            r#"
            [solver_opts]
            equilibrate_enable = false
            static_regularization_constant = 1e-9
            "#,
        )
        .unwrap();
        assert_eq!(options.solver_opts.len(), 2);
        assert!(options.solver_opts.contains_key("equilibrate_enable"));
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let result = ControllerOptions::from_toml_str("solver_name = [not toml");
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }
}
