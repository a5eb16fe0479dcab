//! Reactive QP controller: compiles a skill specification once, then
//! resolves it to velocities every control tick.
//!
//! Given `z = [robot_vel; virtual_vel; slack]`, each tick solves
//!
//! ```text
//! min_z  z' H z     s.t.  lb <= A z <= ub
//! ```
//!
//! where `H` comes from the Cost Builder and `(A, lb, ub)` from the
//! Constraint Assembler. The expensive structural work (row/slack layout,
//! cone classification, buffer allocation) happens in [`compile`]; a solve
//! only evaluates expressions into preallocated buffers and calls the
//! backend.
//!
//! [`compile`]: ReactiveQpController::compile

use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use taskqp_core::config::{ControllerOptions, SolverOptions};
use taskqp_core::error::{ConfigError, DimensionError, SolveError};
use taskqp_core::expr::EvalContext;
use taskqp_core::skill::SkillSpec;

use crate::assemble::{fill_constraint_system, Layout};
use crate::cost::{fill_cost_diagonal, WeightSet};
use crate::qp::QpProblem;

/// Velocity command extracted from one solve.
#[derive(Debug, Clone)]
pub struct VelocityCommand {
    /// Commanded robot velocity (first `n_robot` decision entries).
    pub robot: DVector<f64>,
    /// Commanded virtual velocity, if the skill declares virtual variables.
    pub virt: Option<DVector<f64>>,
    /// Wall-clock solve duration in microseconds.
    pub solve_time_us: u64,
}

/// Result of the start-up initial-value solve.
#[derive(Debug, Clone)]
pub struct InitialValues {
    pub virt: Option<DVector<f64>>,
    pub slack: Option<DVector<f64>>,
}

/// A skill compiled into a reusable per-tick QP.
///
/// Owns the compiled structure exclusively; solve calls share it read-only
/// and must be serialized (one controller instance, one caller at a time).
/// Replacing the skill's constraints requires [`update_skill`], which
/// rebuilds the compiled structure.
///
/// [`update_skill`]: ReactiveQpController::update_skill
pub struct ReactiveQpController {
    skill: SkillSpec,
    weights: WeightSet,
    mu: f64,
    solver_options: SolverOptions,
    solver_opts: toml::value::Table,
    layout: Layout,
    problem: QpProblem,
    initial_problem: QpProblem,
    h_diag: DVector<f64>,
    a: DMatrix<f64>,
    lb: DVector<f64>,
    ub: DVector<f64>,
    last_slack: Option<DVector<f64>>,
}

impl ReactiveQpController {
    /// Compile a skill and weight set into a solvable problem.
    ///
    /// Validates options and weight dimensions, fixes the row/slack
    /// layout, sizes the backend, and probes every constraint expression
    /// once (at a zero state) so shape bugs surface here rather than
    /// mid-control-loop.
    pub fn compile(
        skill: SkillSpec,
        weights: WeightSet,
        options: &ControllerOptions,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        weights.validate(&skill)?;

        let layout = Layout::from_skill(&skill);
        let problem = QpProblem::new(
            layout.n_cols,
            layout.eq_rows.clone(),
            layout.ineq_rows.clone(),
            &options.solver,
            &options.solver_opts,
        )?;
        // Start-up sub-problem over [virtual_vel; slack] only, sized here
        // so the solve cycle never constructs anything fallible.
        let initial_problem = QpProblem::new(
            layout.n_cols - skill.n_robot(),
            layout.eq_rows.clone(),
            layout.ineq_rows.clone(),
            &options.solver,
            &options.solver_opts,
        )?;

        let mut controller = Self {
            h_diag: DVector::zeros(layout.n_cols),
            a: DMatrix::zeros(layout.n_rows, layout.n_cols),
            lb: DVector::zeros(layout.n_rows),
            ub: DVector::zeros(layout.n_rows),
            layout,
            problem,
            initial_problem,
            skill,
            weights,
            mu: options.weight_shifter,
            solver_options: options.solver.clone(),
            solver_opts: options.solver_opts.clone(),
            last_slack: None,
        };
        controller.probe()?;
        Ok(controller)
    }

    /// Evaluate everything once at a zero state to catch shape mismatches
    /// at compile time.
    fn probe(&mut self) -> Result<(), ConfigError> {
        let robot = DVector::zeros(self.skill.n_robot());
        let virt = DVector::zeros(self.skill.n_virtual());
        let input = DVector::zeros(self.skill.n_input());
        let ctx = EvalContext {
            time: 0.0,
            robot: &robot,
            virt: (self.skill.n_virtual() > 0).then_some(&virt),
            input: (self.skill.n_input() > 0).then_some(&input),
        };
        fill_cost_diagonal(&self.weights, &self.skill, self.mu, &ctx, &mut self.h_diag)
            .map_err(|e| self.shape_error(e))?;
        fill_constraint_system(
            &self.skill,
            &self.layout,
            &ctx,
            &mut self.a,
            &mut self.lb,
            &mut self.ub,
        )
        .map_err(|e| self.shape_error(e))?;
        Ok(())
    }

    fn shape_error(&self, err: DimensionError) -> ConfigError {
        let index = match err {
            DimensionError::ExpressionShape { index, .. }
            | DimensionError::JacobianShape { index, .. } => Some(index),
            _ => None,
        };
        let label = index
            .and_then(|i| self.skill.constraints().get(i))
            .map_or_else(|| "<weights>".to_string(), |c| c.label().to_string());
        ConfigError::MalformedConstraint {
            label,
            message: err.to_string(),
        }
    }

    /// Solve one control tick.
    ///
    /// Evaluates the compiled cost and constraint functions at the given
    /// state, invokes the QP backend, and partitions the decision vector
    /// into robot and virtual velocity commands. The slack portion is
    /// retained for [`last_slack`] diagnostics. A failed solve leaves all
    /// diagnostics untouched and returns the error.
    ///
    /// [`last_slack`]: ReactiveQpController::last_slack
    pub fn solve(
        &mut self,
        time: f64,
        robot: &DVector<f64>,
        virt: Option<&DVector<f64>>,
        input: Option<&DVector<f64>>,
    ) -> Result<VelocityCommand, SolveError> {
        let start = Instant::now();
        self.check_state(robot, virt, input)?;
        let ctx = EvalContext {
            time,
            robot,
            virt,
            input,
        };

        fill_cost_diagonal(&self.weights, &self.skill, self.mu, &ctx, &mut self.h_diag)?;
        fill_constraint_system(
            &self.skill,
            &self.layout,
            &ctx,
            &mut self.a,
            &mut self.lb,
            &mut self.ub,
        )?;

        let x = self
            .problem
            .solve(&self.h_diag, &self.a, &self.lb, &self.ub)?;

        let n_robot = self.skill.n_robot();
        let n_virtual = self.skill.n_virtual();
        let n_slack = self.skill.n_slack();
        if n_slack > 0 {
            self.last_slack = Some(x.rows(n_robot + n_virtual, n_slack).into_owned());
        }
        Ok(VelocityCommand {
            robot: x.rows(0, n_robot).into_owned(),
            virt: (n_virtual > 0).then(|| x.rows(n_robot, n_virtual).into_owned()),
            solve_time_us: u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
        })
    }

    /// Solve the start-up sub-problem for consistent initial virtual and
    /// slack values.
    ///
    /// Minimizes the same cost subject to the same constraints, but with
    /// `robot_vel` fixed (zero unless supplied) and only
    /// `[virtual_vel; slack]` free. Returns `Ok(None)` when the skill has
    /// neither virtual variables nor slack, in which case there is nothing
    /// to initialize. A seed for an undeclared virtual variable is
    /// rejected like any other dimension mismatch.
    pub fn solve_initial(
        &mut self,
        time: f64,
        robot: &DVector<f64>,
        robot_vel: Option<&DVector<f64>>,
        virt_seed: Option<&DVector<f64>>,
        input: Option<&DVector<f64>>,
    ) -> Result<Option<InitialValues>, SolveError> {
        let n_robot = self.skill.n_robot();
        let n_virtual = self.skill.n_virtual();
        let n_slack = self.skill.n_slack();
        if n_virtual == 0 {
            if let Some(seed) = virt_seed {
                return Err(DimensionError::Virtual {
                    expected: 0,
                    got: seed.len(),
                }
                .into());
            }
        }
        if n_virtual == 0 && n_slack == 0 {
            return Ok(None);
        }

        // An absent virtual seed linearizes around zero.
        let virt_zero = DVector::zeros(n_virtual);
        let virt_value = virt_seed.unwrap_or(&virt_zero);
        self.check_state(robot, (n_virtual > 0).then_some(virt_value), input)?;
        if let Some(v) = robot_vel {
            if v.len() != n_robot {
                return Err(DimensionError::RobotVel {
                    expected: n_robot,
                    got: v.len(),
                }
                .into());
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(DimensionError::NotFinite.into());
            }
        }

        let ctx = EvalContext {
            time,
            robot,
            virt: (n_virtual > 0).then_some(virt_value),
            input,
        };
        fill_cost_diagonal(&self.weights, &self.skill, self.mu, &ctx, &mut self.h_diag)?;
        fill_constraint_system(
            &self.skill,
            &self.layout,
            &ctx,
            &mut self.a,
            &mut self.lb,
            &mut self.ub,
        )?;

        // Move the fixed robot-velocity contribution into the bounds.
        let vel_zero = DVector::zeros(n_robot);
        let vel = robot_vel.unwrap_or(&vel_zero);
        let shift = self.a.columns(0, n_robot) * vel;
        let n_sub = n_virtual + n_slack;
        let a_sub = self.a.columns(n_robot, n_sub).into_owned();
        let lb_sub = &self.lb - &shift;
        let ub_sub = &self.ub - &shift;
        let h_sub = self.h_diag.rows(n_robot, n_sub).into_owned();

        let x = self.initial_problem.solve(&h_sub, &a_sub, &lb_sub, &ub_sub)?;

        Ok(Some(InitialValues {
            virt: (n_virtual > 0).then(|| x.rows(0, n_virtual).into_owned()),
            slack: (n_slack > 0).then(|| x.rows(n_virtual, n_slack).into_owned()),
        }))
    }

    /// Replace the skill and rebuild the compiled structure.
    ///
    /// Required after any constraint-list or variable-declaration change;
    /// the previously compiled layout is discarded.
    pub fn update_skill(&mut self, skill: SkillSpec) -> Result<(), ConfigError> {
        self.weights.validate(&skill)?;
        let layout = Layout::from_skill(&skill);
        let problem = QpProblem::new(
            layout.n_cols,
            layout.eq_rows.clone(),
            layout.ineq_rows.clone(),
            &self.solver_options,
            &self.solver_opts,
        )?;
        let initial_problem = QpProblem::new(
            layout.n_cols - skill.n_robot(),
            layout.eq_rows.clone(),
            layout.ineq_rows.clone(),
            &self.solver_options,
            &self.solver_opts,
        )?;
        self.initial_problem = initial_problem;
        self.h_diag = DVector::zeros(layout.n_cols);
        self.a = DMatrix::zeros(layout.n_rows, layout.n_cols);
        self.lb = DVector::zeros(layout.n_rows);
        self.ub = DVector::zeros(layout.n_rows);
        self.layout = layout;
        self.problem = problem;
        self.skill = skill;
        self.last_slack = None;
        self.probe()
    }

    fn check_state(
        &self,
        robot: &DVector<f64>,
        virt: Option<&DVector<f64>>,
        input: Option<&DVector<f64>>,
    ) -> Result<(), DimensionError> {
        let n_robot = self.skill.n_robot();
        if robot.len() != n_robot {
            return Err(DimensionError::Robot {
                expected: n_robot,
                got: robot.len(),
            });
        }
        let n_virtual = self.skill.n_virtual();
        match virt {
            Some(v) if v.len() != n_virtual => {
                return Err(DimensionError::Virtual {
                    expected: n_virtual,
                    got: v.len(),
                });
            }
            None if n_virtual > 0 => return Err(DimensionError::MissingVirtual),
            _ => {}
        }
        let n_input = self.skill.n_input();
        match input {
            Some(v) if v.len() != n_input => {
                return Err(DimensionError::Input {
                    expected: n_input,
                    got: v.len(),
                });
            }
            None if n_input > 0 => return Err(DimensionError::MissingInput),
            _ => {}
        }
        let finite = robot.iter().all(|x| x.is_finite())
            && virt.is_none_or(|v| v.iter().all(|x| x.is_finite()))
            && input.is_none_or(|v| v.iter().all(|x| x.is_finite()));
        if !finite {
            return Err(DimensionError::NotFinite);
        }
        Ok(())
    }

    /// The compiled skill.
    pub const fn skill(&self) -> &SkillSpec {
        &self.skill
    }

    /// The regularization constant mu in effect.
    pub const fn weight_shifter(&self) -> f64 {
        self.mu
    }

    /// Slack values from the most recent successful solve.
    pub fn last_slack(&self) -> Option<&DVector<f64>> {
        self.last_slack.as_ref()
    }
}
