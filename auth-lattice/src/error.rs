use thiserror::Error;

/// Closed set of validation failures plus the backend tails.
///
/// Validation errors are data: callers match on them. Storage and internal
/// errors propagate; they never degrade an authorization decision.
#[derive(Error, Debug)]
pub enum LatticeError {
    #[error("an external id is required")]
    IdIsRequired,

    #[error("a description is required")]
    DescriptionIsRequired,

    #[error("unknown subject: {0}")]
    InvalidSubject(String),

    #[error("unknown object: {0}")]
    InvalidObject(String),

    #[error("unknown permission: {0}")]
    InvalidPermission(String),

    #[error("unknown parent: {0}")]
    InvalidParent(String),

    #[error("unknown child: {0}")]
    InvalidChild(String),

    #[error("edge {parent} -> {child} would create a cycle")]
    CyclicEdge { parent: String, child: String },

    #[error("a rule with the opposite sign already exists for ({subject}, {object}, {privilege})")]
    ConflictingRuleType {
        subject: String,
        object: String,
        privilege: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for LatticeError {
    fn from(err: sqlx::Error) -> Self {
        LatticeError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LatticeError>;
