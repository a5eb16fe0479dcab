//! QP backend over Clarabel (pure Rust interior-point solver).
//!
//! The assembled system `lb <= A z <= ub` is mapped onto Clarabel's conic
//! form `A' z + s = b, s in K`: structurally-equal rows (equality-form
//! constraints) become a zero cone, two-sided rows become a mirrored pair
//! in the nonnegative cone. The row classification and problem dimensions
//! are fixed when the problem is built; each solve only refreshes values.
//!
//! Backend-specific keys from `solver_opts` are mapped onto the Clarabel
//! settings here, one-to-one with Clarabel's setting names.

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettings, DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{self, NonnegativeConeT, ZeroConeT},
};
use nalgebra::{DMatrix, DVector};
use taskqp_core::config::SolverOptions;
use taskqp_core::error::{ConfigError, SolveError};

/// A QP sized to one assembled constraint system.
///
/// Holds the settings, cone layout, and scratch buffers; `solve` is called
/// once per tick with fresh numeric values.
pub struct QpProblem {
    n_cols: usize,
    eq_rows: Vec<usize>,
    ineq_rows: Vec<usize>,
    settings: DefaultSettings<f64>,
    cones: Vec<SupportedConeT<f64>>,
    q_lin: Vec<f64>,
    a_cone: DMatrix<f64>,
    b_cone: Vec<f64>,
}

impl QpProblem {
    /// Allocate a problem for the given column count and row classes.
    pub fn new(
        n_cols: usize,
        eq_rows: Vec<usize>,
        ineq_rows: Vec<usize>,
        options: &SolverOptions,
        backend_opts: &toml::value::Table,
    ) -> Result<Self, ConfigError> {
        let mut settings = DefaultSettingsBuilder::default()
            .max_iter(options.max_iter)
            .verbose(options.verbose)
            .tol_gap_abs(options.tol_gap_abs)
            .tol_gap_rel(options.tol_gap_rel)
            .tol_feas(options.tol_feas)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "solver",
                message: e.to_string(),
            })?;
        apply_backend_opts(&mut settings, backend_opts)?;

        let n_eq = eq_rows.len();
        let n_ineq = ineq_rows.len();
        let mut cones = Vec::new();
        if n_eq > 0 {
            cones.push(ZeroConeT(n_eq));
        }
        if n_ineq > 0 {
            cones.push(NonnegativeConeT(2 * n_ineq));
        }
        Ok(Self {
            n_cols,
            eq_rows,
            ineq_rows,
            settings,
            cones,
            q_lin: vec![0.0; n_cols],
            a_cone: DMatrix::zeros(n_eq + 2 * n_ineq, n_cols),
            b_cone: vec![0.0; n_eq + 2 * n_ineq],
        })
    }

    /// Solve `min z' diag(h) z  s.t.  lb <= A z <= ub`.
    ///
    /// Returns the optimal decision vector, or [`SolveError::Infeasible`]
    /// when the solver reports no feasible point.
    pub fn solve(
        &mut self,
        h_diag: &DVector<f64>,
        a: &DMatrix<f64>,
        lb: &DVector<f64>,
        ub: &DVector<f64>,
    ) -> Result<DVector<f64>, SolveError> {
        // No constraints: the minimum of a positive diagonal quadratic is zero.
        if self.eq_rows.is_empty() && self.ineq_rows.is_empty() {
            return Ok(DVector::zeros(self.n_cols));
        }

        let n_eq = self.eq_rows.len();
        let n_ineq = self.ineq_rows.len();

        // Zero cone: A z = ub (== lb).
        for (cone_row, &row) in self.eq_rows.iter().enumerate() {
            self.a_cone.row_mut(cone_row).copy_from(&a.row(row));
            self.b_cone[cone_row] = ub[row];
        }
        // Nonnegative cone: A z <= ub and -A z <= -lb.
        for (offset, &row) in self.ineq_rows.iter().enumerate() {
            self.a_cone.row_mut(n_eq + offset).copy_from(&a.row(row));
            self.b_cone[n_eq + offset] = ub[row];
            let mirror = n_eq + n_ineq + offset;
            for col in 0..self.n_cols {
                self.a_cone[(mirror, col)] = -a[(row, col)];
            }
            self.b_cone[mirror] = -lb[row];
        }

        let p_csc = diagonal_to_csc(h_diag);
        let a_csc = dmatrix_to_csc(&self.a_cone);

        let solver_result = DefaultSolver::new(
            &p_csc,
            &self.q_lin,
            &a_csc,
            &self.b_cone,
            &self.cones,
            self.settings.clone(),
        );
        let mut solver = solver_result.map_err(|e| SolveError::SolverFailure(format!("{e:?}")))?;
        solver.solve();

        let solution = &solver.solution;
        match solution.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {
                Ok(DVector::from_column_slice(&solution.x))
            }
            SolverStatus::PrimalInfeasible
            | SolverStatus::AlmostPrimalInfeasible
            | SolverStatus::DualInfeasible
            | SolverStatus::AlmostDualInfeasible => Err(SolveError::Infeasible {
                status: format!("{:?}", solution.status),
            }),
            other => Err(SolveError::SolverFailure(format!("{other:?}"))),
        }
    }

    pub const fn n_cols(&self) -> usize {
        self.n_cols
    }
}

/// Diagonal cost vector as an upper-triangular `CscMatrix`.
///
/// Every diagonal entry is kept structurally, even when zero, so the
/// sparsity pattern stays identical across ticks.
fn diagonal_to_csc(diag: &DVector<f64>) -> CscMatrix<f64> {
    let n = diag.len();
    let colptr: Vec<usize> = (0..=n).collect();
    let rowval: Vec<usize> = (0..n).collect();
    let nzval: Vec<f64> = diag.iter().copied().collect();
    CscMatrix::new(n, n, colptr, rowval, nzval)
}

/// Apply backend-specific option keys onto the Clarabel settings.
///
/// Keys mirror Clarabel's setting names one-to-one. The fields already
/// exposed through [`SolverOptions`] are rejected so each setting has a
/// single source; unknown keys and mistyped values are configuration
/// errors rather than silent no-ops.
fn apply_backend_opts(
    settings: &mut DefaultSettings<f64>,
    opts: &toml::value::Table,
) -> Result<(), ConfigError> {
    for (key, value) in opts {
        match key.as_str() {
            "max_iter" | "verbose" | "tol_gap_abs" | "tol_gap_rel" | "tol_feas" => {
                return Err(opts_error(key, "set through the [solver] table"));
            }
            "time_limit" => settings.time_limit = float_opt(key, value)?,
            "max_step_fraction" => settings.max_step_fraction = float_opt(key, value)?,
            "tol_infeas_abs" => settings.tol_infeas_abs = float_opt(key, value)?,
            "tol_infeas_rel" => settings.tol_infeas_rel = float_opt(key, value)?,
            "tol_ktratio" => settings.tol_ktratio = float_opt(key, value)?,
            "reduced_tol_gap_abs" => settings.reduced_tol_gap_abs = float_opt(key, value)?,
            "reduced_tol_gap_rel" => settings.reduced_tol_gap_rel = float_opt(key, value)?,
            "reduced_tol_feas" => settings.reduced_tol_feas = float_opt(key, value)?,
            "reduced_tol_infeas_abs" => {
                settings.reduced_tol_infeas_abs = float_opt(key, value)?;
            }
            "reduced_tol_infeas_rel" => {
                settings.reduced_tol_infeas_rel = float_opt(key, value)?;
            }
            "reduced_tol_ktratio" => settings.reduced_tol_ktratio = float_opt(key, value)?,
            "equilibrate_enable" => settings.equilibrate_enable = bool_opt(key, value)?,
            "equilibrate_max_iter" => settings.equilibrate_max_iter = u32_opt(key, value)?,
            "equilibrate_min_scaling" => {
                settings.equilibrate_min_scaling = float_opt(key, value)?;
            }
            "equilibrate_max_scaling" => {
                settings.equilibrate_max_scaling = float_opt(key, value)?;
            }
            "linesearch_backtrack_step" => {
                settings.linesearch_backtrack_step = float_opt(key, value)?;
            }
            "min_switch_step_length" => {
                settings.min_switch_step_length = float_opt(key, value)?;
            }
            "min_terminate_step_length" => {
                settings.min_terminate_step_length = float_opt(key, value)?;
            }
            "direct_kkt_solver" => settings.direct_kkt_solver = bool_opt(key, value)?,
            "direct_solve_method" => settings.direct_solve_method = string_opt(key, value)?,
            "static_regularization_enable" => {
                settings.static_regularization_enable = bool_opt(key, value)?;
            }
            "static_regularization_constant" => {
                settings.static_regularization_constant = float_opt(key, value)?;
            }
            "static_regularization_proportional" => {
                settings.static_regularization_proportional = float_opt(key, value)?;
            }
            "dynamic_regularization_enable" => {
                settings.dynamic_regularization_enable = bool_opt(key, value)?;
            }
            "dynamic_regularization_eps" => {
                settings.dynamic_regularization_eps = float_opt(key, value)?;
            }
            "dynamic_regularization_delta" => {
                settings.dynamic_regularization_delta = float_opt(key, value)?;
            }
            "iterative_refinement_enable" => {
                settings.iterative_refinement_enable = bool_opt(key, value)?;
            }
            "iterative_refinement_reltol" => {
                settings.iterative_refinement_reltol = float_opt(key, value)?;
            }
            "iterative_refinement_abstol" => {
                settings.iterative_refinement_abstol = float_opt(key, value)?;
            }
            "iterative_refinement_max_iter" => {
                settings.iterative_refinement_max_iter = u32_opt(key, value)?;
            }
            "iterative_refinement_stop_ratio" => {
                settings.iterative_refinement_stop_ratio = float_opt(key, value)?;
            }
            "presolve_enable" => settings.presolve_enable = bool_opt(key, value)?,
            _ => return Err(opts_error(key, "not a recognized backend setting")),
        }
    }
    Ok(())
}

fn opts_error(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: "solver_opts",
        message: format!("'{key}': {message}"),
    }
}

fn float_opt(key: &str, value: &toml::Value) -> Result<f64, ConfigError> {
    match value {
        toml::Value::Float(v) => Ok(*v),
        toml::Value::Integer(v) => Ok(*v as f64),
        _ => Err(opts_error(key, "expected a number")),
    }
}

fn bool_opt(key: &str, value: &toml::Value) -> Result<bool, ConfigError> {
    value
        .as_bool()
        .ok_or_else(|| opts_error(key, "expected a boolean"))
}

fn u32_opt(key: &str, value: &toml::Value) -> Result<u32, ConfigError> {
    let v = value
        .as_integer()
        .ok_or_else(|| opts_error(key, "expected an integer"))?;
    u32::try_from(v).map_err(|_| opts_error(key, "out of range"))
}

fn string_opt(key: &str, value: &toml::Value) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| opts_error(key, "expected a string"))
}

/// Convert a dense nalgebra matrix to a Clarabel `CscMatrix`.
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v.abs() > 1e-15 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}
