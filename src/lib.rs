//! Weighted conditional logit estimation for transport mode choice.
//!
//! This crate fits the parameters of a multinomial (conditional) logit model to observed
//! mode choices, weighting each observation by the quantity it carries, and reports either
//! the coefficients in a layout that can be pasted into a cost file or correlations between
//! fitted and observed quantities. It offers tools to
//!
//! - turn a raw group table into immutable observations (`table` and `data` modules),
//! - declare parameters and linear utilities per alternative (`formulation` and `model` modules),
//! - evaluate numerically stable choice probabilities and the weighted log-likelihood (`likelihood` module),
//! - maximize it with a pluggable bound-constrained optimizer (`solving` and `estimation` modules),
//! - format results and compute fit diagnostics (`report` module), and
//! - repeat all of the above for every observation group (`batch` module).
//!
//! # Quick start
//!
//! ```no_run
//! use mlogitrs::data::{AdapterOptions, DatasetAdapter};
//! use mlogitrs::formulation::UtilityExpression;
//! use mlogitrs::model::{Bounds, ModelSpecification};
//! use mlogitrs::report::{format_for_cost_file, CostFileLayout};
//! use mlogitrs::simulation::{simulate_table, SimulationConfig};
//! use mlogitrs::{estimate, EstimationOptions};
//!
//! let table = simulate_table(&SimulationConfig::default()).expect("valid simulation");
//! let data = DatasetAdapter::adapt(&table, AdapterOptions::default()).expect("adapted data");
//!
//! let mut spec = ModelSpecification::new();
//! spec.add_parameter("(intercept).1", 0.0, Bounds::unbounded(), true).unwrap();
//! spec.add_parameter("(intercept).2", 0.0, Bounds::unbounded(), false).unwrap();
//! spec.add_parameter("(intercept).3", 0.0, Bounds::unbounded(), false).unwrap();
//! spec.add_parameter("log(cost)", 0.0, Bounds::unbounded(), false).unwrap();
//! for alternative in 1..=3 {
//!     let utility = UtilityExpression::new()
//!         .intercept(format!("(intercept).{alternative}"))
//!         .cost_term("log(cost)");
//!     spec.set_utility(alternative, utility).unwrap();
//! }
//!
//! let result = estimate(&spec, &data, &EstimationOptions::default()).expect("estimated");
//! for line in format_for_cost_file(&result, &CostFileLayout::new("0", vec![1, 2, 3])) {
//!     println!("{line}");
//! }
//! ```

pub mod batch;
pub mod data;
pub mod differentiation;
pub mod error;
pub mod estimation;
pub mod formulation;
pub mod likelihood;
pub mod model;
pub mod options;
pub mod report;
pub mod simulation;
pub mod solving;
pub mod table;

pub use error::{ChoiceError, Result};
pub use estimation::{estimate, ConvergenceStatus, EstimationResult, Estimator};
pub use options::{CovarianceKind, EstimationOptions, OptimizerMethod};
pub use solving::{CancellationToken, Minimizer};
