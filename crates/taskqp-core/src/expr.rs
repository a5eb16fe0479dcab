//! Task-expression seam.
//!
//! A [`TaskMap`] is the quantity a constraint acts on: a vector-valued
//! function of time, the robot configuration, and optionally virtual and
//! input variables. The controller only ever asks a map for its value and
//! its Jacobians, so any differentiable kinematic quantity (end-effector
//! position, distance to an obstacle, a joint subset) plugs in behind this
//! trait.

use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::ConfigError;

/// Variable a task expression can depend on.
///
/// `Input` is never differentiated against for the decision system; it
/// only contributes to numeric evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    Time,
    Robot,
    Virtual,
    Input,
}

/// Numeric values for the declared variables at one control tick.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub time: f64,
    pub robot: &'a DVector<f64>,
    pub virt: Option<&'a DVector<f64>>,
    pub input: Option<&'a DVector<f64>>,
}

/// A vector-valued task expression with Jacobians.
///
/// Shape contract: `eval` returns `dim()` rows; `jacobian` returns
/// `dim() x 1` for [`Var::Time`], `dim() x n_robot` for [`Var::Robot`],
/// and `dim() x n_virtual` for [`Var::Virtual`]. The controller only
/// requests a Jacobian when `depends_on` reports the dependency, and
/// never requests one for [`Var::Input`].
pub trait TaskMap: Send + Sync {
    /// Row dimension of the expression value.
    fn dim(&self) -> usize;

    /// Evaluate the expression at the given state.
    fn eval(&self, ctx: &EvalContext) -> DVector<f64>;

    /// Jacobian of the expression with respect to `wrt`.
    fn jacobian(&self, ctx: &EvalContext, wrt: Var) -> DMatrix<f64>;

    /// Whether the expression depends on `wrt` (structurally).
    fn depends_on(&self, wrt: Var) -> bool;
}

/// Affine task expression: `A_r q + A_v q_virt + b t + c`.
///
/// The workhorse for joint-space tasks and for anything already linearized
/// by an upstream kinematics layer. Jacobians are the stored matrices.
#[derive(Debug, Clone)]
pub struct AffineMap {
    a_robot: DMatrix<f64>,
    a_virt: Option<DMatrix<f64>>,
    b_time: Option<DVector<f64>>,
    offset: DVector<f64>,
}

impl AffineMap {
    /// Create `A_r q + c`. Fails if row counts differ.
    pub fn new(a_robot: DMatrix<f64>, offset: DVector<f64>) -> Result<Self, ConfigError> {
        if a_robot.nrows() != offset.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "affine offset",
                expected: a_robot.nrows(),
                got: offset.len(),
            });
        }
        Ok(Self {
            a_robot,
            a_virt: None,
            b_time: None,
            offset,
        })
    }

    /// Add a virtual-variable term `A_v q_virt`.
    pub fn with_virtual(mut self, a_virt: DMatrix<f64>) -> Result<Self, ConfigError> {
        if a_virt.nrows() != self.dim() {
            return Err(ConfigError::ShapeMismatch {
                what: "affine virtual block",
                expected: self.dim(),
                got: a_virt.nrows(),
            });
        }
        self.a_virt = Some(a_virt);
        Ok(self)
    }

    /// Add an explicit time term `b t` (a constant-velocity moving target).
    pub fn with_time(mut self, b_time: DVector<f64>) -> Result<Self, ConfigError> {
        if b_time.len() != self.dim() {
            return Err(ConfigError::ShapeMismatch {
                what: "affine time term",
                expected: self.dim(),
                got: b_time.len(),
            });
        }
        self.b_time = Some(b_time);
        Ok(self)
    }
}

impl TaskMap for AffineMap {
    fn dim(&self) -> usize {
        self.a_robot.nrows()
    }

    fn eval(&self, ctx: &EvalContext) -> DVector<f64> {
        let mut value = &self.a_robot * ctx.robot + &self.offset;
        if let (Some(a_virt), Some(virt)) = (&self.a_virt, ctx.virt) {
            value += a_virt * virt;
        }
        if let Some(b_time) = &self.b_time {
            value += b_time * ctx.time;
        }
        value
    }

    fn jacobian(&self, _ctx: &EvalContext, wrt: Var) -> DMatrix<f64> {
        match wrt {
            Var::Robot => self.a_robot.clone(),
            Var::Virtual => self
                .a_virt
                .clone()
                .unwrap_or_else(|| DMatrix::zeros(self.dim(), 0)),
            Var::Time => match &self.b_time {
                Some(b) => DMatrix::from_column_slice(self.dim(), 1, b.as_slice()),
                None => DMatrix::zeros(self.dim(), 1),
            },
            Var::Input => DMatrix::zeros(self.dim(), 0),
        }
    }

    fn depends_on(&self, wrt: Var) -> bool {
        match wrt {
            Var::Robot => self.a_robot.iter().any(|v| *v != 0.0),
            Var::Virtual => self
                .a_virt
                .as_ref()
                .is_some_and(|a| a.iter().any(|v| *v != 0.0)),
            Var::Time => self
                .b_time
                .as_ref()
                .is_some_and(|b| b.iter().any(|v| *v != 0.0)),
            Var::Input => false,
        }
    }
}

type EvalFn = dyn Fn(&EvalContext) -> DVector<f64> + Send + Sync;
type JacFn = dyn Fn(&EvalContext, Var) -> DMatrix<f64> + Send + Sync;

/// Closure-backed task expression for nonlinear tasks.
///
/// The caller supplies the value function, the Jacobian function, and the
/// set of variables the expression depends on. The Jacobian closure is
/// only invoked for declared dependencies.
#[derive(Clone)]
pub struct FnMap {
    dim: usize,
    deps: Vec<Var>,
    eval_fn: Arc<EvalFn>,
    jac_fn: Arc<JacFn>,
}

impl FnMap {
    pub fn new(
        dim: usize,
        deps: impl Into<Vec<Var>>,
        eval_fn: impl Fn(&EvalContext) -> DVector<f64> + Send + Sync + 'static,
        jac_fn: impl Fn(&EvalContext, Var) -> DMatrix<f64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            dim,
            deps: deps.into(),
            eval_fn: Arc::new(eval_fn),
            jac_fn: Arc::new(jac_fn),
        }
    }
}

impl fmt::Debug for FnMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMap")
            .field("dim", &self.dim)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

impl TaskMap for FnMap {
    fn dim(&self) -> usize {
        self.dim
    }

    fn eval(&self, ctx: &EvalContext) -> DVector<f64> {
        (self.eval_fn)(ctx)
    }

    fn jacobian(&self, ctx: &EvalContext, wrt: Var) -> DMatrix<f64> {
        (self.jac_fn)(ctx, wrt)
    }

    fn depends_on(&self, wrt: Var) -> bool {
        self.deps.contains(&wrt)
    }
}

/// A gain, target, or bound term: a constant or a state-dependent map.
///
/// Scalars broadcast to the constraint's row dimension; vectors and maps
/// must match it exactly (validated when the constraint is built).
#[derive(Clone)]
pub enum Param {
    Scalar(f64),
    Vector(DVector<f64>),
    Map(Arc<dyn TaskMap>),
}

impl Param {
    /// Evaluate to a `dim`-row vector.
    pub fn eval(&self, ctx: &EvalContext, dim: usize) -> DVector<f64> {
        match self {
            Self::Scalar(s) => DVector::from_element(dim, *s),
            Self::Vector(v) => v.clone(),
            Self::Map(m) => m.eval(ctx),
        }
    }

    /// Whether this parameter fits a `dim`-row constraint.
    pub fn dim_ok(&self, dim: usize) -> bool {
        match self {
            Self::Scalar(_) => true,
            Self::Vector(v) => v.len() == dim,
            Self::Map(m) => m.dim() == dim,
        }
    }

    /// Constant value as a `dim`-row vector, if this parameter is constant.
    pub fn const_value(&self, dim: usize) -> Option<DVector<f64>> {
        match self {
            Self::Scalar(s) => Some(DVector::from_element(dim, *s)),
            Self::Vector(v) => Some(v.clone()),
            Self::Map(_) => None,
        }
    }

    pub fn depends_on(&self, wrt: Var) -> bool {
        match self {
            Self::Scalar(_) | Self::Vector(_) => false,
            Self::Map(m) => m.depends_on(wrt),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => f.debug_tuple("Scalar").field(s).finish(),
            Self::Vector(v) => f.debug_tuple("Vector").field(&v.as_slice()).finish(),
            Self::Map(m) => f.debug_struct("Map").field("dim", &m.dim()).finish(),
        }
    }
}

impl From<f64> for Param {
    fn from(s: f64) -> Self {
        Self::Scalar(s)
    }
}

impl From<DVector<f64>> for Param {
    fn from(v: DVector<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<Vec<f64>> for Param {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(DVector::from_vec(v))
    }
}

impl From<Arc<dyn TaskMap>> for Param {
    fn from(m: Arc<dyn TaskMap>) -> Self {
        Self::Map(m)
    }
}
