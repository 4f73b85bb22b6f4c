use chaos_core::ids::CallId;
use chaos_store::StoreError;

/// Outcome of a rejected domain operation.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A call status guard failed, including a lost race.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The actor may not act on this resource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Blocked or not-friends interaction.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_friends() -> Self {
        Self::Forbidden("users are not friends".into())
    }

    pub fn blocked() -> Self {
        Self::Forbidden("interaction with a blocked user".into())
    }

    pub fn already_in_call() -> Self {
        Self::Conflict("already in a call".into())
    }

    pub fn call_not_found(id: &CallId) -> Self {
        Self::NotFound(format!("call {id}"))
    }

    pub fn not_callee() -> Self {
        Self::Unauthorized("only the callee can answer the call".into())
    }

    pub fn not_participant() -> Self {
        Self::Unauthorized("not a participant".into())
    }

    /// Stable machine-readable kind, used as the API `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidInput(_) => "invalid_input",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::Internal(other.to_string()),
        }
    }
}
