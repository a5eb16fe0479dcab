//! Constraint Assembler: linearizes every constraint into one contiguous
//! row-block of the linear system `lb <= A z <= ub` over the decision
//! vector `z = [robot_vel; virtual_vel; slack]`.
//!
//! Row order follows constraint priority (stable for ties); slack columns
//! are reserved contiguously in first-seen soft-constraint order. The
//! layout (row offsets, slack offsets, equality/inequality row classes)
//! is fixed at compile time; only the numeric values change per tick.

use nalgebra::{DMatrix, DVector};
use taskqp_core::error::DimensionError;
use taskqp_core::expr::{EvalContext, Var};
use taskqp_core::skill::{ConstraintForm, ConstraintMode, SkillSpec};

/// Placement of one constraint's rows in the assembled system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// First row of this constraint's block.
    pub row: usize,
    /// Row count `k` (the expression's row dimension).
    pub rows: usize,
    /// Start of the reserved slack range, for soft constraints.
    pub slack_col: Option<usize>,
}

/// Fixed structure of the assembled system.
///
/// `A` has `n_robot + n_virtual + n_slack` columns and `sum(k_i)` rows.
/// Rows are classified structurally: equality-form constraints have
/// identical lower and upper bound rows, set-form constraints are genuine
/// two-sided inequalities. The classification never changes across ticks,
/// so the conic backend's topology stays fixed.
#[derive(Debug, Clone)]
pub struct Layout {
    pub n_robot: usize,
    pub n_virtual: usize,
    pub n_slack: usize,
    pub n_rows: usize,
    pub n_cols: usize,
    pub blocks: Vec<BlockLayout>,
    pub eq_rows: Vec<usize>,
    pub ineq_rows: Vec<usize>,
}

impl Layout {
    pub fn from_skill(skill: &SkillSpec) -> Self {
        let mut blocks = Vec::with_capacity(skill.constraints().len());
        let mut eq_rows = Vec::new();
        let mut ineq_rows = Vec::new();
        let mut row = 0;
        let mut slack = 0;
        for cnstr in skill.constraints() {
            let rows = cnstr.dim();
            let slack_col = (cnstr.mode() == ConstraintMode::Soft).then(|| {
                let start = slack;
                slack += rows;
                start
            });
            let class_rows = if cnstr.form().is_equality() {
                &mut eq_rows
            } else {
                &mut ineq_rows
            };
            class_rows.extend(row..row + rows);
            blocks.push(BlockLayout {
                row,
                rows,
                slack_col,
            });
            row += rows;
        }
        debug_assert_eq!(slack, skill.n_slack());
        Self {
            n_robot: skill.n_robot(),
            n_virtual: skill.n_virtual(),
            n_slack: skill.n_slack(),
            n_rows: row,
            n_cols: skill.n_decision(),
            blocks,
            eq_rows,
            ineq_rows,
        }
    }
}

/// Evaluate the constraint system at the current state.
///
/// `a` must be `n_rows x n_cols`, `lb`/`ub` must have `n_rows` entries;
/// all three are overwritten.
pub fn fill_constraint_system(
    skill: &SkillSpec,
    layout: &Layout,
    ctx: &EvalContext,
    a: &mut DMatrix<f64>,
    lb: &mut DVector<f64>,
    ub: &mut DVector<f64>,
) -> Result<(), DimensionError> {
    a.fill(0.0);
    for (index, (cnstr, block)) in skill.constraints().iter().zip(&layout.blocks).enumerate() {
        let k = block.rows;
        let row = block.row;
        let expr = cnstr.expression();

        // Row-block of A: [d expr / d robot, d expr / d virtual].
        if expr.depends_on(Var::Robot) {
            let jac = expr.jacobian(ctx, Var::Robot);
            check_jacobian(index, "robot", &jac, k, layout.n_robot)?;
            a.view_mut((row, 0), (k, layout.n_robot)).copy_from(&jac);
        }
        if layout.n_virtual > 0 && expr.depends_on(Var::Virtual) {
            let jac = expr.jacobian(ctx, Var::Virtual);
            check_jacobian(index, "virtual", &jac, k, layout.n_virtual)?;
            a.view_mut((row, layout.n_robot), (k, layout.n_virtual))
                .copy_from(&jac);
        }

        // Feedforward: f = -d expr / d time, for every variant.
        let feedforward = if expr.depends_on(Var::Time) {
            let jac = expr.jacobian(ctx, Var::Time);
            check_jacobian(index, "time", &jac, k, 1)?;
            -jac.column(0).into_owned()
        } else {
            DVector::zeros(k)
        };

        // Variant-specific bound terms.
        let (lb_block, ub_block) = match cnstr.form() {
            ConstraintForm::Equality { gain } => {
                let value = eval_expression(index, expr.as_ref(), ctx, k)?;
                let g = gain.eval(ctx, k);
                let b = &feedforward - g.component_mul(&value);
                (b.clone(), b)
            }
            ConstraintForm::Set {
                gain,
                set_min,
                set_max,
            } => {
                let value = eval_expression(index, expr.as_ref(), ctx, k)?;
                let g = gain.eval(ctx, k);
                let lo = set_min.eval(ctx, k);
                let hi = set_max.eval(ctx, k);
                (
                    &feedforward + g.component_mul(&(lo - &value)),
                    &feedforward + g.component_mul(&(hi - &value)),
                )
            }
            ConstraintForm::VelocityEquality { target } => {
                let b = &feedforward + target.eval(ctx, k);
                (b.clone(), b)
            }
            ConstraintForm::VelocitySet { set_min, set_max } => (
                &feedforward + set_min.eval(ctx, k),
                &feedforward + set_max.eval(ctx, k),
            ),
        };
        lb.rows_mut(row, k).copy_from(&lb_block);
        ub.rows_mut(row, k).copy_from(&ub_block);

        // Soft constraints relax through -I on their reserved slack range.
        if let Some(slack_col) = block.slack_col {
            let base = layout.n_robot + layout.n_virtual + slack_col;
            for r in 0..k {
                a[(row + r, base + r)] = -1.0;
            }
        }
    }
    Ok(())
}

fn eval_expression(
    index: usize,
    expr: &dyn taskqp_core::expr::TaskMap,
    ctx: &EvalContext,
    expected: usize,
) -> Result<DVector<f64>, DimensionError> {
    let value = expr.eval(ctx);
    if value.len() != expected {
        return Err(DimensionError::ExpressionShape {
            index,
            expected,
            got: value.len(),
        });
    }
    Ok(value)
}

fn check_jacobian(
    index: usize,
    wrt: &'static str,
    jac: &DMatrix<f64>,
    expected_rows: usize,
    expected_cols: usize,
) -> Result<(), DimensionError> {
    if jac.nrows() != expected_rows || jac.ncols() != expected_cols {
        return Err(DimensionError::JacobianShape {
            index,
            wrt,
            expected_rows,
            expected_cols,
            rows: jac.nrows(),
            cols: jac.ncols(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};
    use std::sync::Arc;
    use taskqp_core::expr::{AffineMap, TaskMap};
    use taskqp_core::skill::Constraint;

    fn offset_map(n_robot: usize, offset: f64) -> Arc<dyn TaskMap> {
        Arc::new(
            AffineMap::new(
                DMatrix::identity(1, n_robot),
                DVector::from_element(1, offset),
            )
            .unwrap(),
        )
    }

    fn assemble(
        skill: &SkillSpec,
        time: f64,
        robot: &DVector<f64>,
    ) -> (Layout, DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let layout = Layout::from_skill(skill);
        let mut a = DMatrix::zeros(layout.n_rows, layout.n_cols);
        let mut lb = DVector::zeros(layout.n_rows);
        let mut ub = DVector::zeros(layout.n_rows);
        let ctx = EvalContext {
            time,
            robot,
            virt: None,
            input: None,
        };
        fill_constraint_system(skill, &layout, &ctx, &mut a, &mut lb, &mut ub).unwrap();
        (layout, a, lb, ub)
    }

    #[test]
    fn hard_equality_one_dof() {
        // expr = x - 5, gain 1, at x = 0: A = [1], lb = ub = 5.
        let mut skill = SkillSpec::new("reach", 1).unwrap();
        skill
            .set_constraints(vec![
                Constraint::equality("x to 5", offset_map(1, -5.0), 1.0).unwrap(),
            ])
            .unwrap();

        let q = DVector::zeros(1);
        let (layout, a, lb, ub) = assemble(&skill, 0.0, &q);
        assert_eq!(a.shape(), (1, 1));
        assert_relative_eq!(a[(0, 0)], 1.0);
        assert_relative_eq!(lb[0], 5.0);
        assert_relative_eq!(ub[0], 5.0);
        assert_eq!(layout.eq_rows, [0]);
        assert!(layout.ineq_rows.is_empty());
    }

    #[test]
    fn soft_set_outside_bounds() {
        // 0 <= x <= 10, gain 1, at x = 12: lb = -12, ub = -2, slack col = -1.
        let mut skill = SkillSpec::new("stay", 1).unwrap();
        skill
            .set_constraints(vec![
                Constraint::set("in region", offset_map(1, 0.0), 1.0, 0.0, 10.0)
                    .unwrap()
                    .soft(),
            ])
            .unwrap();

        let q = DVector::from_element(1, 12.0);
        let (layout, a, lb, ub) = assemble(&skill, 0.0, &q);
        assert_eq!(a.shape(), (1, 2)); // robot + one slack column
        assert_relative_eq!(a[(0, 0)], 1.0);
        assert_relative_eq!(a[(0, 1)], -1.0);
        assert_relative_eq!(lb[0], -12.0);
        assert_relative_eq!(ub[0], -2.0);
        assert_eq!(layout.ineq_rows, [0]);
    }

    #[test]
    fn feedforward_from_time_dependence() {
        // expr = x - t: d expr / dt = -1 so f = 1; gain 1 at x = 0, t = 2:
        // bounds = f - gain * expr = 1 - (0 - 2) = 3.
        let map: Arc<dyn TaskMap> = Arc::new(
            AffineMap::new(DMatrix::identity(1, 1), DVector::zeros(1))
                .unwrap()
                .with_time(DVector::from_element(1, -1.0))
                .unwrap(),
        );
        let mut skill = SkillSpec::new("track", 1).unwrap();
        skill
            .set_constraints(vec![Constraint::equality("follow t", map, 1.0).unwrap()])
            .unwrap();

        let q = DVector::zeros(1);
        let (_, a, lb, ub) = assemble(&skill, 2.0, &q);
        assert_relative_eq!(a[(0, 0)], 1.0);
        assert_relative_eq!(lb[0], 3.0);
        assert_relative_eq!(ub[0], 3.0);
    }

    #[test]
    fn velocity_variants_use_raw_bounds() {
        let mut skill = SkillSpec::new("vel", 1).unwrap();
        skill
            .set_constraints(vec![
                Constraint::velocity_equality("cruise", offset_map(1, 0.0), 3.0)
                    .unwrap()
                    .with_priority(1),
                Constraint::velocity_set("limit", offset_map(1, 0.0), -2.0, 2.0)
                    .unwrap()
                    .with_priority(2),
            ])
            .unwrap();

        let q = DVector::from_element(1, 7.0); // value must not matter
        let (layout, _, lb, ub) = assemble(&skill, 0.0, &q);
        assert_relative_eq!(lb[0], 3.0);
        assert_relative_eq!(ub[0], 3.0);
        assert_relative_eq!(lb[1], -2.0);
        assert_relative_eq!(ub[1], 2.0);
        assert_eq!(layout.eq_rows, [0]);
        assert_eq!(layout.ineq_rows, [1]);
    }

    #[test]
    fn priority_fixes_row_order() {
        let mut skill = SkillSpec::new("ordered", 1).unwrap();
        skill
            .set_constraints(vec![
                Constraint::equality("second", offset_map(1, -2.0), 1.0)
                    .unwrap()
                    .with_priority(2),
                Constraint::equality("first", offset_map(1, -1.0), 1.0)
                    .unwrap()
                    .with_priority(1),
            ])
            .unwrap();

        let q = DVector::zeros(1);
        let (_, _, lb, _) = assemble(&skill, 0.0, &q);
        // Priority 1 ("first") assembles first: bound 1, then bound 2.
        assert_relative_eq!(lb[0], 1.0);
        assert_relative_eq!(lb[1], 2.0);
    }

    #[test]
    fn slack_reserved_in_first_seen_soft_order() {
        // Hard 2-row constraint between two soft ones; slack columns belong
        // to the soft constraints in assembly order.
        let two_rows: Arc<dyn TaskMap> =
            Arc::new(AffineMap::new(DMatrix::identity(2, 2), DVector::zeros(2)).unwrap());
        let one_row: Arc<dyn TaskMap> =
            Arc::new(AffineMap::new(DMatrix::identity(1, 2), DVector::zeros(1)).unwrap());

        let mut skill = SkillSpec::new("mixed", 2).unwrap();
        skill
            .set_constraints(vec![
                Constraint::equality("soft-a", one_row.clone(), 1.0).unwrap().soft(),
                Constraint::equality("hard", two_rows, 1.0).unwrap(),
                Constraint::equality("soft-b", one_row, 1.0).unwrap().soft(),
            ])
            .unwrap();

        let q = DVector::zeros(2);
        let (layout, a, _, _) = assemble(&skill, 0.0, &q);
        assert_eq!(layout.n_slack, 2);
        assert_eq!(a.shape(), (4, 4)); // 2 robot cols + 2 slack cols

        // soft-a: row 0, slack col 2; soft-b: row 3, slack col 3.
        assert_relative_eq!(a[(0, 2)], -1.0);
        assert_relative_eq!(a[(3, 3)], -1.0);
        // Hard rows carry no slack entries.
        assert_relative_eq!(a[(1, 2)], 0.0);
        assert_relative_eq!(a[(2, 3)], 0.0);
    }

    #[test]
    fn zero_constraints_zero_rows() {
        let skill = SkillSpec::new("empty", 3).unwrap();
        let layout = Layout::from_skill(&skill);
        assert_eq!(layout.n_rows, 0);
        assert_eq!(layout.n_cols, 3);
        assert!(layout.blocks.is_empty());
    }

    #[test]
    fn virtual_jacobian_block_placed_after_robot() {
        let map: Arc<dyn TaskMap> = Arc::new(
            AffineMap::new(DMatrix::from_element(1, 1, 1.0), DVector::zeros(1))
                .unwrap()
                .with_virtual(DMatrix::from_element(1, 1, -1.0))
                .unwrap(),
        );
        let mut skill = SkillSpec::new("coupled", 1).unwrap().with_virtual(1).unwrap();
        skill
            .set_constraints(vec![Constraint::equality("x minus z", map, 1.0).unwrap()])
            .unwrap();

        let layout = Layout::from_skill(&skill);
        let mut a = DMatrix::zeros(layout.n_rows, layout.n_cols);
        let mut lb = DVector::zeros(layout.n_rows);
        let mut ub = DVector::zeros(layout.n_rows);
        let q = DVector::from_element(1, 2.0);
        let z = DVector::from_element(1, 0.5);
        let ctx = EvalContext {
            time: 0.0,
            robot: &q,
            virt: Some(&z),
            input: None,
        };
        fill_constraint_system(&skill, &layout, &ctx, &mut a, &mut lb, &mut ub).unwrap();

        assert_eq!(a.shape(), (1, 2));
        assert_relative_eq!(a[(0, 0)], 1.0);
        assert_relative_eq!(a[(0, 1)], -1.0);
        // bound = -gain * (x - z) = -(2 - 0.5)
        assert_relative_eq!(lb[0], -1.5);
    }
}
