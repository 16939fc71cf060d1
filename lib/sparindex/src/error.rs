use std::error::Error;

/// An error raised while planning the substitution of external indices.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RewriteError {
    /// An element has been requested from a sequence that is already exhausted
    #[error("No more elements in the sequence")]
    Exhausted,
    /// The shape of an index can't be substituted soundly for query patterns
    #[error("The index {index} has an invalid shape: {reason}")]
    InvalidIndexShape { index: String, reason: String },
    /// The number of alternative plans exceeds the configured limit
    #[error("The number of alternative plans exceeds the limit of {limit}")]
    TooManyPlans { limit: usize },
    /// The parsed query uses a construct the planner can't represent
    #[error("{0} is not supported by the index planner")]
    UnsupportedPattern(String),
    /// Error from the storage the index definitions are read from
    #[error(transparent)]
    Storage(#[from] IndexEvaluationError),
}

impl RewriteError {
    pub(crate) fn invalid_shape(index: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIndexShape {
            index: index.into(),
            reason: reason.into(),
        }
    }
}

/// An error raised by an external index during evaluation, usually an I/O error of its storage.
///
/// It is propagated unchanged to the caller evaluating the plan.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct IndexEvaluationError(Box<dyn Error + Send + Sync>);

impl IndexEvaluationError {
    #[inline]
    pub fn new(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self(error.into())
    }

    #[inline]
    pub fn into_inner(self) -> Box<dyn Error + Send + Sync> {
        self.0
    }
}

impl From<std::io::Error> for IndexEvaluationError {
    #[inline]
    fn from(error: std::io::Error) -> Self {
        Self(Box::new(error))
    }
}
