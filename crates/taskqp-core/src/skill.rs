//! Skill specification: a prioritized set of constraints over robot state.
//!
//! A [`SkillSpec`] declares the variable dimensions (robot, optional
//! virtual, optional input) and owns an ordered list of [`Constraint`]s.
//! Replacing the constraint list re-sorts it by priority and recomputes
//! the derived state: total slack dimension and the virtual/input
//! dependency flags.

use std::fmt;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::expr::{Param, TaskMap, Var};

/// Hard constraints must hold exactly; soft constraints get slack columns
/// and may be violated at a cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintMode {
    Hard,
    Soft,
}

/// The four constraint kinds, as a closed tagged variant.
///
/// Adding a kind is a compile-time exhaustiveness extension: the
/// assembler matches on this enum.
#[derive(Debug, Clone)]
pub enum ConstraintForm {
    /// Drive `expression -> 0` at a rate proportional to `gain`.
    Equality { gain: Param },
    /// Keep `set_min <= expression <= set_max`, approaching the set at a
    /// rate proportional to `gain` when outside it.
    Set {
        gain: Param,
        set_min: Param,
        set_max: Param,
    },
    /// Drive `d(expression)/dt -> target`.
    VelocityEquality { target: Param },
    /// Keep `set_min <= d(expression)/dt <= set_max`.
    VelocitySet { set_min: Param, set_max: Param },
}

impl ConstraintForm {
    fn params(&self) -> Vec<&Param> {
        match self {
            Self::Equality { gain } => vec![gain],
            Self::Set {
                gain,
                set_min,
                set_max,
            } => vec![gain, set_min, set_max],
            Self::VelocityEquality { target } => vec![target],
            Self::VelocitySet { set_min, set_max } => vec![set_min, set_max],
        }
    }

    /// Structurally, are lower and upper bound rows identical?
    pub fn is_equality(&self) -> bool {
        matches!(self, Self::Equality { .. } | Self::VelocityEquality { .. })
    }
}

/// One task requirement over an expression of the skill's variables.
#[derive(Clone)]
pub struct Constraint {
    label: String,
    priority: i32,
    mode: ConstraintMode,
    expression: Arc<dyn TaskMap>,
    form: ConstraintForm,
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("mode", &self.mode)
            .field("dim", &self.expression.dim())
            .field("form", &self.form)
            .finish()
    }
}

impl Constraint {
    fn build(
        label: impl Into<String>,
        expression: Arc<dyn TaskMap>,
        form: ConstraintForm,
    ) -> Result<Self, ConfigError> {
        let label = label.into();
        let dim = expression.dim();
        if dim == 0 {
            return Err(ConfigError::MalformedConstraint {
                label,
                message: "expression has zero rows".into(),
            });
        }
        for param in form.params() {
            if !param.dim_ok(dim) {
                return Err(ConfigError::MalformedConstraint {
                    label,
                    message: format!("parameter dimension does not match expression rows ({dim})"),
                });
            }
        }
        // Constant bounds that can never satisfy lower <= upper are a
        // specification error, caught here rather than at the solver.
        if let ConstraintForm::Set {
            set_min, set_max, ..
        }
        | ConstraintForm::VelocitySet { set_min, set_max } = &form
        {
            if let (Some(lo), Some(hi)) = (set_min.const_value(dim), set_max.const_value(dim)) {
                if lo.iter().zip(hi.iter()).any(|(l, h)| l > h) {
                    return Err(ConfigError::MalformedConstraint {
                        label,
                        message: "set_min exceeds set_max".into(),
                    });
                }
            }
        }
        Ok(Self {
            label,
            priority: 0,
            mode: ConstraintMode::Hard,
            expression,
            form,
        })
    }

    /// Equality constraint: drive `expression -> 0`.
    pub fn equality(
        label: impl Into<String>,
        expression: Arc<dyn TaskMap>,
        gain: impl Into<Param>,
    ) -> Result<Self, ConfigError> {
        Self::build(label, expression, ConstraintForm::Equality { gain: gain.into() })
    }

    /// Set constraint: keep `set_min <= expression <= set_max`.
    pub fn set(
        label: impl Into<String>,
        expression: Arc<dyn TaskMap>,
        gain: impl Into<Param>,
        set_min: impl Into<Param>,
        set_max: impl Into<Param>,
    ) -> Result<Self, ConfigError> {
        Self::build(
            label,
            expression,
            ConstraintForm::Set {
                gain: gain.into(),
                set_min: set_min.into(),
                set_max: set_max.into(),
            },
        )
    }

    /// Velocity equality constraint: drive `d(expression)/dt -> target`.
    pub fn velocity_equality(
        label: impl Into<String>,
        expression: Arc<dyn TaskMap>,
        target: impl Into<Param>,
    ) -> Result<Self, ConfigError> {
        Self::build(
            label,
            expression,
            ConstraintForm::VelocityEquality {
                target: target.into(),
            },
        )
    }

    /// Velocity set constraint: keep `set_min <= d(expression)/dt <= set_max`.
    pub fn velocity_set(
        label: impl Into<String>,
        expression: Arc<dyn TaskMap>,
        set_min: impl Into<Param>,
        set_max: impl Into<Param>,
    ) -> Result<Self, ConfigError> {
        Self::build(
            label,
            expression,
            ConstraintForm::VelocitySet {
                set_min: set_min.into(),
                set_max: set_max.into(),
            },
        )
    }

    /// Set the priority (lower = assembled first; ties keep insertion order).
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the constraint soft (relaxable through slack).
    #[must_use]
    pub fn soft(mut self) -> Self {
        self.mode = ConstraintMode::Soft;
        self
    }

    /// Mark the constraint hard (the default).
    #[must_use]
    pub fn hard(mut self) -> Self {
        self.mode = ConstraintMode::Hard;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub const fn priority(&self) -> i32 {
        self.priority
    }

    pub const fn mode(&self) -> ConstraintMode {
        self.mode
    }

    /// Row dimension of the constrained quantity.
    pub fn dim(&self) -> usize {
        self.expression.dim()
    }

    pub fn expression(&self) -> &Arc<dyn TaskMap> {
        &self.expression
    }

    pub const fn form(&self) -> &ConstraintForm {
        &self.form
    }

    /// Whether any piece of the constraint (expression, gain, target,
    /// bounds) depends on `wrt`.
    pub fn depends_on(&self, wrt: Var) -> bool {
        self.expression.depends_on(wrt) || self.form.params().iter().any(|p| p.depends_on(wrt))
    }
}

/// Constraint counts by kind and hardness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstraintCounts {
    pub all: usize,
    pub equality: usize,
    pub set: usize,
    pub velocity_equality: usize,
    pub velocity_set: usize,
    pub hard: usize,
    pub soft: usize,
}

/// Specification of a skill to be executed on the robot.
///
/// Constructed once per skill; the constraint list may be replaced
/// wholesale through [`SkillSpec::set_constraints`], which re-sorts and
/// recomputes all derived state. Controllers compiled against an earlier
/// constraint list must be rebuilt.
#[derive(Debug, Clone)]
pub struct SkillSpec {
    label: String,
    n_robot: usize,
    n_virtual: usize,
    n_input: usize,
    constraints: Vec<Constraint>,
    n_slack: usize,
    has_virtual: bool,
    has_input: bool,
}

impl SkillSpec {
    /// Create a skill over an `n_robot`-dimensional robot configuration.
    pub fn new(label: impl Into<String>, n_robot: usize) -> Result<Self, ConfigError> {
        if n_robot == 0 {
            return Err(ConfigError::InvalidValue {
                field: "n_robot",
                message: "must be > 0".into(),
            });
        }
        Ok(Self {
            label: label.into(),
            n_robot,
            n_virtual: 0,
            n_input: 0,
            // Instance-owned, always fresh.
            constraints: Vec::new(),
            n_slack: 0,
            has_virtual: false,
            has_input: false,
        })
    }

    /// Declare a paired virtual configuration / velocity of dimension `n`.
    pub fn with_virtual(mut self, n_virtual: usize) -> Result<Self, ConfigError> {
        if n_virtual == 0 {
            return Err(ConfigError::InvalidValue {
                field: "n_virtual",
                message: "must be > 0 when declared".into(),
            });
        }
        self.n_virtual = n_virtual;
        Ok(self)
    }

    /// Declare an input variable of dimension `n` (numeric only, never
    /// differentiated against).
    pub fn with_input(mut self, n_input: usize) -> Result<Self, ConfigError> {
        if n_input == 0 {
            return Err(ConfigError::InvalidValue {
                field: "n_input",
                message: "must be > 0 when declared".into(),
            });
        }
        self.n_input = n_input;
        Ok(self)
    }

    /// Replace the constraint list.
    ///
    /// Stable-sorts by priority, recomputes the slack dimension (sum of
    /// soft-constraint row dims), and refreshes the dependency flags.
    /// Rejects constraints that depend on undeclared variables.
    pub fn set_constraints(&mut self, constraints: Vec<Constraint>) -> Result<(), ConfigError> {
        for cnstr in &constraints {
            if self.n_virtual == 0 && cnstr.depends_on(Var::Virtual) {
                return Err(ConfigError::UndeclaredDependency {
                    label: cnstr.label.clone(),
                    var: "virtual",
                });
            }
            if self.n_input == 0 && cnstr.depends_on(Var::Input) {
                return Err(ConfigError::UndeclaredDependency {
                    label: cnstr.label.clone(),
                    var: "input",
                });
            }
        }
        let mut constraints = constraints;
        constraints.sort_by_key(Constraint::priority);
        self.n_slack = constraints
            .iter()
            .filter(|c| c.mode == ConstraintMode::Soft)
            .map(Constraint::dim)
            .sum();
        self.has_virtual =
            self.n_virtual > 0 && constraints.iter().any(|c| c.depends_on(Var::Virtual));
        self.has_input = self.n_input > 0 && constraints.iter().any(|c| c.depends_on(Var::Input));
        self.constraints = constraints;
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub const fn n_robot(&self) -> usize {
        self.n_robot
    }

    pub const fn n_virtual(&self) -> usize {
        self.n_virtual
    }

    pub const fn n_input(&self) -> usize {
        self.n_input
    }

    /// Total slack dimension over all soft constraints.
    pub const fn n_slack(&self) -> usize {
        self.n_slack
    }

    /// Dimension of the QP decision vector `[robot_vel; virtual_vel; slack]`.
    pub const fn n_decision(&self) -> usize {
        self.n_robot + self.n_virtual + self.n_slack
    }

    /// Total row count of the assembled constraint system.
    pub fn total_rows(&self) -> usize {
        self.constraints.iter().map(Constraint::dim).sum()
    }

    /// Constraints in assembly order (nondecreasing priority, stable).
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Whether any constraint piece depends on the virtual variable.
    pub const fn has_virtual(&self) -> bool {
        self.has_virtual
    }

    /// Whether any constraint piece depends on the input variable.
    pub const fn has_input(&self) -> bool {
        self.has_input
    }

    /// Count constraints by kind and hardness.
    pub fn counts(&self) -> ConstraintCounts {
        let mut counts = ConstraintCounts {
            all: self.constraints.len(),
            ..ConstraintCounts::default()
        };
        for cnstr in &self.constraints {
            match cnstr.mode {
                ConstraintMode::Hard => counts.hard += 1,
                ConstraintMode::Soft => counts.soft += 1,
            }
            match cnstr.form {
                ConstraintForm::Equality { .. } => counts.equality += 1,
                ConstraintForm::Set { .. } => counts.set += 1,
                ConstraintForm::VelocityEquality { .. } => counts.velocity_equality += 1,
                ConstraintForm::VelocitySet { .. } => counts.velocity_set += 1,
            }
        }
        counts
    }
}
