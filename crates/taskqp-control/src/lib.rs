//! Reactive constraint-based motion control resolved through a QP.
//!
//! Compiles a [`SkillSpec`](taskqp_core::skill::SkillSpec) — a prioritized
//! set of equality/set/velocity constraints over robot state — into a
//! quadratic program solved once per control tick for a velocity command:
//!
//! 1. **Cost Builder** — diagonal cost over `[robot_vel; virtual_vel; slack]`
//!    with eTaSL-style mu regularization
//! 2. **Constraint Assembler** — linearizes each constraint into a
//!    row-block of `lb <= A z <= ub` with feedforward and slack columns
//! 3. **Problem Compiler** — fixes the row/slack layout and cone
//!    classification, sizes the Clarabel backend, preallocates buffers
//! 4. **Solve Cycle** — evaluates the compiled structure at the current
//!    state and extracts the robot (and virtual) velocity command
//!
//! # Architecture
//!
//! ```text
//! SkillSpec + WeightSet ──► compile ──► ReactiveQpController ──► solve ──► VelocityCommand
//!                            (once)                            (per tick)
//! ```
//!
//! Build once, solve repeatedly: a solve only evaluates already-laid-out
//! numeric functions and calls the solver, so per-tick cost stays bounded.

pub mod assemble;
pub mod controller;
pub mod cost;
pub mod qp;

pub use assemble::{fill_constraint_system, BlockLayout, Layout};
pub use controller::{InitialValues, ReactiveQpController, VelocityCommand};
pub use cost::{fill_cost_diagonal, WeightSet};
pub use qp::QpProblem;
