use core::fmt;

/// Result alias for `tiermix`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by training, inference and the data/model constructors.
///
/// Numerical degeneracies met during EM (zero-mass nodes, negative variance
/// estimates, vanishing probabilities) are repaired in place and never show
/// up here. An external halt is not an error either.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Input was empty.
    EmptyInput,

    /// Dimension mismatch (usize).
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Found dimension.
        found: usize,
    },

    /// Shape mismatch (string description).
    ShapeMismatch {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        actual: String,
    },

    /// Invalid parameter value.
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Error message.
        message: &'static str,
    },

    /// The topology violates its structural invariants.
    InvalidTopology(String),

    /// The convergence criterion needs held-out data but none was supplied.
    MissingHeldOut {
        /// Name of the criterion that asked for it.
        criterion: &'static str,
    },

    /// A point lacks a modality that the correspondence model requires.
    ModalityMismatch {
        /// Offending point.
        point: usize,
        /// What is missing.
        message: String,
    },

    /// A discrete item carries a category id outside `[0, num_categories)`.
    CategoryOutOfRange {
        /// Offending point.
        point: usize,
        /// Category id found.
        category: usize,
        /// Declared number of categories.
        num_categories: usize,
    },

    /// An internal invariant failed. This is a bug, and the run is aborted.
    Internal(String),

    /// Generic error with message.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptyInput => write!(f, "empty input provided"),
            Error::DimensionMismatch { expected, found } => {
                write!(f, "dimension mismatch: expected {expected}, found {found}")
            }
            Error::ShapeMismatch { expected, actual } => {
                write!(f, "shape mismatch: expected {expected}, actual {actual}")
            }
            Error::InvalidParameter { name, message } => {
                write!(f, "invalid parameter '{name}': {message}")
            }
            Error::InvalidTopology(msg) => write!(f, "invalid topology: {msg}"),
            Error::MissingHeldOut { criterion } => {
                write!(f, "convergence criterion '{criterion}' requires held-out data")
            }
            Error::ModalityMismatch { point, message } => {
                write!(f, "point {point}: {message}")
            }
            Error::CategoryOutOfRange {
                point,
                category,
                num_categories,
            } => write!(
                f,
                "point {point}: category {category} is outside [0, {num_categories})"
            ),
            Error::Internal(msg) => write!(f, "internal error (cannot happen): {msg}"),
            Error::Other(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
