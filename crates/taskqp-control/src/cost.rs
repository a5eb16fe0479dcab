//! Cost Builder: diagonal QP cost over `[robot_vel; virtual_vel; slack]`.
//!
//! Diagonal entries are `mu * robot_weights`, `mu * virtual_weights`,
//! `(1 + mu) * slack_weights` (eTaSL-style regularization): mu keeps the
//! task-tracking terms small relative to slack, so the optimizer prefers
//! satisfying constraints exactly over letting slack absorb error, while
//! still regularizing against ill-conditioned Jacobians.

use nalgebra::DVector;
use taskqp_core::error::{ConfigError, DimensionError};
use taskqp_core::expr::{EvalContext, Param};
use taskqp_core::skill::SkillSpec;

/// Per-block QP weight vectors: constants or state-dependent maps.
///
/// Defaults to unit weights for every block.
#[derive(Debug, Clone)]
pub struct WeightSet {
    pub robot: Param,
    pub virt: Param,
    pub slack: Param,
}

impl Default for WeightSet {
    fn default() -> Self {
        Self {
            robot: Param::Scalar(1.0),
            virt: Param::Scalar(1.0),
            slack: Param::Scalar(1.0),
        }
    }
}

impl WeightSet {
    /// Check each weight vector against the skill's block dimensions.
    pub fn validate(&self, skill: &SkillSpec) -> Result<(), ConfigError> {
        for (block, param, expected) in [
            ("robot", &self.robot, skill.n_robot()),
            ("virtual", &self.virt, skill.n_virtual()),
            ("slack", &self.slack, skill.n_slack()),
        ] {
            if !param.dim_ok(expected) {
                let got = match param {
                    Param::Scalar(_) => unreachable!("scalars fit any dimension"),
                    Param::Vector(v) => v.len(),
                    Param::Map(m) => m.dim(),
                };
                return Err(ConfigError::WeightDimMismatch {
                    block,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }
}

/// Evaluate the cost diagonal at the current state.
///
/// `out` must have length `n_robot + n_virtual + n_slack`; each block is
/// written in decision-vector order.
pub fn fill_cost_diagonal(
    weights: &WeightSet,
    skill: &SkillSpec,
    mu: f64,
    ctx: &EvalContext,
    out: &mut DVector<f64>,
) -> Result<(), DimensionError> {
    let blocks = [
        ("robot", &weights.robot, 0, skill.n_robot(), mu),
        ("virtual", &weights.virt, skill.n_robot(), skill.n_virtual(), mu),
        (
            "slack",
            &weights.slack,
            skill.n_robot() + skill.n_virtual(),
            skill.n_slack(),
            1.0 + mu,
        ),
    ];
    for (block, param, offset, len, scale) in blocks {
        if len == 0 {
            continue;
        }
        let w = param.eval(ctx, len);
        if w.len() != len {
            return Err(DimensionError::WeightShape {
                block,
                expected: len,
                got: w.len(),
            });
        }
        out.rows_mut(offset, len).copy_from(&(w * scale));
    }
    Ok(())
}
