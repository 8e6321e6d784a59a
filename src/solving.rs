//! Box-constrained minimizers used by the estimator.
//!
//! The estimator only sees the [`Minimizer`] trait, so any optimizer can be plugged in.
//! Both provided strategies run on `argmin` with a More-Thuente line search: [`Bfgs`] wraps
//! its BFGS quasi-Newton solver and [`NewtonRaphson`] its Newton-CG solver. Bounds are
//! enforced by projection: the objective is always evaluated at the projection of a trial
//! point, and every accepted iterate is projected onto the box. The relative projected
//! gradient decides convergence.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use argmin::core::{
    CostFunction, Error, Executor, Gradient, Hessian, IterState, Problem, Solver, State,
    TerminationReason, TerminationStatus, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::newton::NewtonCG;
use argmin::solver::quasinewton::BFGS;
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::differentiation;
use crate::model::Bounds;

type Point = DVector<f64>;
type SearchState = IterState<Point, Point, (), DMatrix<f64>, (), f64>;
type LineSearch = MoreThuenteLineSearch<Point, Point, f64>;

/// Scalar function to minimize.
///
/// Only `value` is required. The gradient defaults to central finite differences of `value`
/// and the Hessian to central finite differences of `gradient`, so implementors that know
/// their gradient should provide it.
pub trait Objective {
    /// Function value; NaN or infinity signals an invalid point.
    fn value(&self, x: &DVector<f64>) -> f64;

    fn gradient(&self, x: &DVector<f64>) -> DVector<f64> {
        differentiation::gradient(|p| self.value(p), x)
    }

    fn hessian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        differentiation::hessian(|p| self.gradient(p), x)
    }
}

/// Adapts a closure into an [`Objective`].
pub struct FnObjective<F>(pub F);

impl<F> Objective for FnObjective<F>
where
    F: Fn(&DVector<f64>) -> f64,
{
    fn value(&self, x: &DVector<f64>) -> f64 {
        (self.0)(x)
    }
}

/// Shared flag checked between iterations to stop a long fit early.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration shared by the minimizers.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// Maximum number of iterations allowed before giving up.
    pub max_iterations: usize,
    /// Threshold on the relative projected gradient, `max_i |g_i| max(|x_i|, 1) / max(|f|, 1)`.
    pub gradient_tolerance: f64,
    /// Length of the first BFGS step, used to scale the initial inverse Hessian.
    pub initial_step_size: f64,
    pub cancellation: Option<CancellationToken>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1_000,
            gradient_tolerance: 1e-6,
            initial_step_size: 1.0,
            cancellation: None,
        }
    }
}

/// Terminal state of a minimization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SolverStatus {
    Converged,
    MaxIterations,
    /// The objective or its gradient was not finite, or the line search failed.
    NumericalFailure { reason: String },
    Cancelled,
}

/// Diagnostics returned alongside the minimizer's final point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverSummary {
    pub status: SolverStatus,
    /// Number of completed iterations.
    pub iterations: usize,
    /// Objective value at the returned point.
    pub value: f64,
    /// Relative projected gradient at the returned point.
    pub gradient_norm: f64,
}

/// A bound-constrained minimization strategy.
///
/// Implementations must return the best feasible point found, even when they fail.
pub trait Minimizer {
    fn minimize(
        &self,
        objective: &dyn Objective,
        initial: &DVector<f64>,
        bounds: &[Bounds],
        options: &SolverOptions,
    ) -> (DVector<f64>, SolverSummary);
}

/// BFGS quasi-Newton with a More-Thuente line search.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bfgs;

/// Newton-CG on the objective's Hessian with a More-Thuente line search.
#[derive(Clone, Copy, Debug, Default)]
pub struct NewtonRaphson;

impl Minimizer for Bfgs {
    fn minimize(
        &self,
        objective: &dyn Objective,
        initial: &DVector<f64>,
        bounds: &[Bounds],
        options: &SolverOptions,
    ) -> (DVector<f64>, SolverSummary) {
        let start = project(initial, bounds);
        let n = start.len();
        let slope = objective.gradient(&start).amax();
        let scale = if slope.is_finite() {
            options.initial_step_size / slope.max(1.0)
        } else {
            options.initial_step_size
        };
        let inverse_hessian = DMatrix::identity(n, n) * scale;
        let solver: BFGS<LineSearch, f64> = BFGS::new(LineSearch::new());
        let trace = Trace::default();
        drive(solver, objective, start, Some(inverse_hessian), bounds, options, &trace)
    }
}

impl Minimizer for NewtonRaphson {
    fn minimize(
        &self,
        objective: &dyn Objective,
        initial: &DVector<f64>,
        bounds: &[Bounds],
        options: &SolverOptions,
    ) -> (DVector<f64>, SolverSummary) {
        let start = project(initial, bounds);
        let solver: NewtonCG<LineSearch, f64> = NewtonCG::new(LineSearch::new());
        let trace = Trace::default();
        drive(solver, objective, start, None, bounds, options, &trace)
    }
}

#[derive(Debug, thiserror::Error)]
enum SearchError {
    #[error("{quantity} is not finite")]
    NonFinite { quantity: &'static str },
    #[error("the optimizer state has no parameter vector")]
    MissingParameters,
}

/// Lowest objective value seen and the number of completed iterations.
///
/// Kept outside the executor so that a run aborted by an error still returns its best point.
#[derive(Default)]
struct Trace {
    best: RefCell<Option<(f64, Point)>>,
    iterations: Cell<usize>,
}

impl Trace {
    fn record(&self, x: &Point, value: f64) {
        let mut best = self.best.borrow_mut();
        if best.as_ref().map_or(true, |(lowest, _)| value < *lowest) {
            *best = Some((value, x.clone()));
        }
    }
}

/// Exposes an [`Objective`] to `argmin`, evaluated at the projection onto `bounds`.
struct BoxedProblem<'a> {
    objective: &'a dyn Objective,
    bounds: &'a [Bounds],
    trace: &'a Trace,
}

impl CostFunction for BoxedProblem<'_> {
    type Param = Point;
    type Output = f64;

    fn cost(&self, x: &Point) -> Result<f64, Error> {
        let feasible = project(x, self.bounds);
        let value = self.objective.value(&feasible);
        if !value.is_finite() {
            return Err(SearchError::NonFinite {
                quantity: "objective",
            }
            .into());
        }
        self.trace.record(&feasible, value);
        Ok(value)
    }
}

impl BoxedProblem<'_> {
    /// Gradient of the objective at the projection of `x`, with the coordinates that cannot
    /// move marked as blocked.
    fn feasible_gradient(&self, x: &Point) -> Result<(Point, Vec<bool>), Error> {
        let gradient = self.objective.gradient(&project(x, self.bounds));
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(SearchError::NonFinite {
                quantity: "gradient",
            }
            .into());
        }
        let blocked = blocked_coordinates(x, &gradient, self.bounds);
        Ok((gradient, blocked))
    }
}

impl Gradient for BoxedProblem<'_> {
    type Param = Point;
    type Gradient = Point;

    /// Gradient of `x ↦ f(P(x))`: zero along blocked coordinates, where the projection is flat.
    fn gradient(&self, x: &Point) -> Result<Point, Error> {
        let (mut gradient, blocked) = self.feasible_gradient(x)?;
        for (g, blocked) in gradient.iter_mut().zip(blocked) {
            if blocked {
                *g = 0.0;
            }
        }
        Ok(gradient)
    }
}

impl Hessian for BoxedProblem<'_> {
    type Param = Point;
    type Hessian = DMatrix<f64>;

    /// Hessian restricted to the free coordinates; blocked ones get an identity row and column.
    fn hessian(&self, x: &Point) -> Result<DMatrix<f64>, Error> {
        let mut hessian = self.objective.hessian(&project(x, self.bounds));
        if hessian.iter().any(|h| !h.is_finite()) {
            return Err(SearchError::NonFinite {
                quantity: "Hessian",
            }
            .into());
        }
        let (_, blocked) = self.feasible_gradient(x)?;
        for (i, blocked) in blocked.into_iter().enumerate() {
            if blocked {
                hessian.row_mut(i).fill(0.0);
                hessian.column_mut(i).fill(0.0);
                hessian[(i, i)] = 1.0;
            }
        }
        Ok(hessian)
    }
}

/// Runs an `argmin` solver and adds projection, the stopping rule and cancellation.
struct Guarded<'a, S> {
    inner: S,
    bounds: &'a [Bounds],
    options: &'a SolverOptions,
    trace: &'a Trace,
}

impl<S> Guarded<'_, S> {
    /// Projects the current iterate and refreshes its objective value and gradient.
    fn settle(
        &self,
        problem: &mut Problem<BoxedProblem<'_>>,
        mut state: SearchState,
    ) -> Result<SearchState, Error> {
        let param = state.take_param().ok_or(SearchError::MissingParameters)?;
        let feasible = project(&param, self.bounds);
        let cost = problem.cost(&feasible)?;
        let gradient = problem.gradient(&feasible)?;
        Ok(state.param(feasible).cost(cost).gradient(gradient))
    }
}

impl<'p, S> Solver<BoxedProblem<'p>, SearchState> for Guarded<'_, S>
where
    S: Solver<BoxedProblem<'p>, SearchState>,
{
    const NAME: &'static str = S::NAME;

    fn init(
        &mut self,
        problem: &mut Problem<BoxedProblem<'p>>,
        state: SearchState,
    ) -> Result<(SearchState, Option<KV>), Error> {
        let (state, kv) = self.inner.init(problem, state)?;
        Ok((self.settle(problem, state)?, kv))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<BoxedProblem<'p>>,
        state: SearchState,
    ) -> Result<(SearchState, Option<KV>), Error> {
        let (state, kv) = self.inner.next_iter(problem, state)?;
        let state = self.settle(problem, state)?;
        let iteration = self.trace.iterations.get() + 1;
        self.trace.iterations.set(iteration);
        debug!(
            "iteration {iteration}: objective {:.10e}, gradient {:.3e}",
            state.get_cost(),
            gradient_norm(&state, self.bounds)
        );
        Ok((state, kv))
    }

    fn terminate(&mut self, state: &SearchState) -> TerminationStatus {
        if gradient_norm(state, self.bounds) <= self.options.gradient_tolerance {
            return TerminationStatus::Terminated(TerminationReason::SolverConverged);
        }
        let cancelled = self
            .options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled);
        if cancelled {
            return TerminationStatus::Terminated(TerminationReason::Interrupt);
        }
        TerminationStatus::NotTerminated
    }
}

fn drive<'a, S>(
    inner: S,
    objective: &'a dyn Objective,
    start: Point,
    inverse_hessian: Option<DMatrix<f64>>,
    bounds: &'a [Bounds],
    options: &'a SolverOptions,
    trace: &'a Trace,
) -> (DVector<f64>, SolverSummary)
where
    S: Solver<BoxedProblem<'a>, SearchState>,
{
    let problem = BoxedProblem {
        objective,
        bounds,
        trace,
    };
    let solver = Guarded {
        inner,
        bounds,
        options,
        trace,
    };
    let max_iters = options.max_iterations as u64;
    let initial = start.clone();
    let outcome = Executor::new(problem, solver)
        .configure(|state| {
            let state = state.param(initial).max_iters(max_iters);
            match inverse_hessian {
                Some(h) => state.inv_hessian(h),
                None => state,
            }
        })
        .run();

    match outcome {
        Ok(result) => {
            let state = result.state();
            let status = match state.get_termination_status() {
                TerminationStatus::Terminated(TerminationReason::SolverConverged) => {
                    SolverStatus::Converged
                }
                TerminationStatus::Terminated(TerminationReason::MaxItersReached) => {
                    SolverStatus::MaxIterations
                }
                TerminationStatus::Terminated(TerminationReason::Interrupt) => {
                    SolverStatus::Cancelled
                }
                other => SolverStatus::NumericalFailure {
                    reason: format!("optimizer stopped unexpectedly: {other:?}"),
                },
            };
            let summary = SolverSummary {
                status,
                iterations: state.get_iter() as usize,
                value: state.get_cost(),
                gradient_norm: gradient_norm(state, bounds),
            };
            let point = state.get_param().cloned().unwrap_or(start);
            (point, summary)
        }
        Err(error) => {
            let (value, point) = trace
                .best
                .take()
                .unwrap_or_else(|| (objective.value(&start), start));
            debug!("optimizer failed after {} iterations: {error}", trace.iterations.get());
            let summary = SolverSummary {
                status: SolverStatus::NumericalFailure {
                    reason: error.to_string(),
                },
                iterations: trace.iterations.get(),
                value,
                gradient_norm: f64::NAN,
            };
            (point, summary)
        }
    }
}

fn project(x: &DVector<f64>, bounds: &[Bounds]) -> DVector<f64> {
    DVector::from_iterator(
        x.len(),
        x.iter().zip(bounds.iter()).map(|(v, b)| b.clamp(*v)),
    )
}

/// Coordinates a descent step cannot move: outside the box, or on a bound with the gradient pushing out.
fn blocked_coordinates(x: &DVector<f64>, g: &DVector<f64>, bounds: &[Bounds]) -> Vec<bool> {
    x.iter()
        .zip(g.iter())
        .zip(bounds)
        .map(|((xi, gi), b)| {
            let at_lower = b.lower.is_some_and(|lo| *xi <= lo);
            let at_upper = b.upper.is_some_and(|hi| *xi >= hi);
            let outside = b.lower.is_some_and(|lo| *xi < lo) || b.upper.is_some_and(|hi| *xi > hi);
            outside || (at_lower && *gi > 0.0) || (at_upper && *gi < 0.0)
        })
        .collect()
}

/// Gradient components that could still move the point; those pushing against an active bound are zeroed.
fn projected_gradient(x: &DVector<f64>, g: &DVector<f64>, bounds: &[Bounds]) -> DVector<f64> {
    let blocked = blocked_coordinates(x, g, bounds);
    DVector::from_iterator(
        g.len(),
        g.iter()
            .zip(blocked)
            .map(|(gi, blocked)| if blocked { 0.0 } else { *gi }),
    )
}

fn relative_gradient(x: &DVector<f64>, pg: &DVector<f64>, value: f64) -> f64 {
    let scale = value.abs().max(1.0);
    x.iter()
        .zip(pg.iter())
        .map(|(xi, gi)| gi.abs() * xi.abs().max(1.0) / scale)
        .fold(0.0, f64::max)
}

fn gradient_norm(state: &SearchState, bounds: &[Bounds]) -> f64 {
    match (state.get_param(), state.get_gradient()) {
        (Some(x), Some(g)) => {
            relative_gradient(x, &projected_gradient(x, g, bounds), state.get_cost())
        }
        _ => f64::INFINITY,
    }
}
