use thiserror::Error;

use crate::table::AlternativeId;

/// Unified error type for `mlogitrs` operations.
#[derive(Debug, Error)]
pub enum ChoiceError {
    /// Raised when a required column is absent from the input table.
    #[error("required column `{column}` is missing from the input table")]
    Schema {
        /// Lowercased name of the missing column.
        column: String,
    },

    /// Raised when a value is mathematically invalid for the requested transform.
    #[error("invalid value in `{column}` at row {row}: {reason} (found {value})")]
    Domain {
        /// Column holding the offending value.
        column: String,
        /// Row index inside the group table.
        row: usize,
        /// The value that was rejected.
        value: f64,
        /// Short description of the violated constraint.
        reason: &'static str,
    },

    /// Raised when the total quantity used to build weights is not positive.
    #[error("total quantity in `{column}` must be positive to renormalize weights, found {total}")]
    ZeroTotalQuantity { column: String, total: f64 },

    /// Raised when the chosen alternative of an observation is marked unavailable.
    #[error("observation {row} chose alternative {alternative}, which is not available")]
    ChosenUnavailable { row: usize, alternative: AlternativeId },

    /// Raised when a choice value does not match any declared alternative.
    #[error("alternative {alternative} is not declared in the choice set")]
    UnknownAlternative { alternative: AlternativeId },

    /// Raised when two parameters share the same name.
    #[error("parameter `{name}` is declared more than once")]
    DuplicateName { name: String },

    /// Raised when a utility expression references an undeclared parameter.
    #[error("utility for alternative {alternative} references unknown parameter `{name}`")]
    UnknownParameter {
        alternative: AlternativeId,
        name: String,
    },

    /// Raised when a covariate column cannot be resolved for an observation.
    #[error("covariate `{column}` is not present in observation {row}")]
    MissingCovariate { column: String, row: usize },

    /// Raised when the model is not identified and strict checking was requested.
    #[error("model is not identified: {reason}")]
    Identification { reason: String },

    /// Raised when provided vectors or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a configuration value is outside its admissible range.
    #[error("invalid option `{option}`: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    /// Raised when numerical routines produce NaN or infinity outside the optimizer loop.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when a table source fails to deliver data for a selector.
    #[error("table source failed for selector `{selector}`: {reason}")]
    Source { selector: String, reason: String },
}

impl ChoiceError {
    /// Helper for a missing column.
    pub fn schema(column: impl Into<String>) -> Self {
        Self::Schema {
            column: column.into(),
        }
    }

    /// Helper for a value rejected by a transform.
    pub fn domain(column: impl Into<String>, row: usize, value: f64, reason: &'static str) -> Self {
        Self::Domain {
            column: column.into(),
            row,
            value,
            reason,
        }
    }

    /// Helper to format a [`DimensionMismatch`](ChoiceError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for rejecting configuration values.
    pub fn invalid_option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, ChoiceError>;
