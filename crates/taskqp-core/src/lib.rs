// taskqp-core: skill/constraint data model, task-expression seam, options, errors.

pub mod config;
pub mod error;
pub mod expr;
pub mod skill;

pub use config::{ControllerOptions, SolverOptions};
pub use error::{ConfigError, DimensionError, SolveError, TaskQpError};
pub use expr::{AffineMap, EvalContext, FnMap, Param, TaskMap, Var};
pub use skill::{Constraint, ConstraintCounts, ConstraintForm, ConstraintMode, SkillSpec};
