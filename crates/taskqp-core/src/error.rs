use thiserror::Error;

/// Top-level error type for taskqp.
#[derive(Debug, Error)]
pub enum TaskQpError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dimension error: {0}")]
    Dimension(#[from] DimensionError),

    #[error("Solve error: {0}")]
    Solve(#[from] SolveError),
}

/// Construction and compile-time errors.
///
/// Everything in here is detected eagerly, when a skill, constraint, or
/// controller is built. A controller that compiled successfully never
/// reports these at solve time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unknown solver backend: {0}")]
    UnknownSolver(String),

    #[error("Invalid weight shifter: {0} (must be finite and > 0)")]
    InvalidWeightShifter(f64),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("{what} dimension mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{block} weight dimension mismatch: expected {expected}, got {got}")]
    WeightDimMismatch {
        block: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Constraint '{label}': {message}")]
    MalformedConstraint { label: String, message: String },

    #[error("Constraint '{label}' depends on undeclared {var} variable")]
    UndeclaredDependency { label: String, var: &'static str },
}

/// Numeric input shape errors at solve time.
///
/// Copy + static messages for cheap propagation in the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DimensionError {
    #[error("robot value dimension mismatch: expected {expected}, got {got}")]
    Robot { expected: usize, got: usize },

    #[error("virtual value dimension mismatch: expected {expected}, got {got}")]
    Virtual { expected: usize, got: usize },

    #[error("input value dimension mismatch: expected {expected}, got {got}")]
    Input { expected: usize, got: usize },

    #[error("virtual value required but not supplied")]
    MissingVirtual,

    #[error("input value required but not supplied")]
    MissingInput,

    #[error("robot velocity dimension mismatch: expected {expected}, got {got}")]
    RobotVel { expected: usize, got: usize },

    #[error("state value is not finite")]
    NotFinite,

    #[error("constraint expression {index} returned {got} rows, expected {expected}")]
    ExpressionShape {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error(
        "constraint {index} {wrt} Jacobian shape mismatch: expected {expected_rows}x{expected_cols}, got {rows}x{cols}"
    )]
    JacobianShape {
        index: usize,
        wrt: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("{block} weight vector returned {got} rows, expected {expected}")]
    WeightShape {
        block: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Errors surfaced by one solve cycle.
///
/// An infeasible QP is reported verbatim; the caller decides the safe
/// fallback. A failed solve never produces a command.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("QP infeasible: {status}")]
    Infeasible { status: String },

    #[error("QP solver failure: {0}")]
    SolverFailure(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Dimension(#[from] DimensionError),
}
