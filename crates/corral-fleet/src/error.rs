//! Error types for corral-fleet.

/// Result type alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors that can occur in the fleet service.
///
/// Every variant carries a machine-checkable kind (the variant itself,
/// surfaced on the wire via [`FleetError::kind`]) and a human-readable
/// detail string.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Blob storage error.
    #[error("blob storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// A referenced entity does not exist (or is invisible to the caller's
    /// organisation; cross-tenant reads deliberately report not-found).
    #[error("{entity} not found: {detail}")]
    NotFound {
        /// Entity kind (`device`, `firmware`, ...).
        entity: &'static str,
        /// Which lookup failed.
        detail: String,
    },

    /// A uniqueness constraint would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Ownership or credential check failed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A byte range fell outside the stored artifact.
    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// A required backing service is not configured or reachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, detail: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            detail: detail.into(),
        }
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a forbidden error.
    #[must_use]
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create an unavailable error.
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-checkable error kind for wire responses.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Storage(_) => "storage",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::RangeNotSatisfiable(_) => "range_not_satisfiable",
            Self::Unavailable(_) => "unavailable",
            Self::Config(_) => "config",
            Self::Serialisation(_) => "serialisation",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error is a not-found.
    ///
    /// Batch operations use this to classify per-item failures.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
