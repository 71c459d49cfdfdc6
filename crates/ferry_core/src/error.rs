use thiserror::Error;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("cancelled: {message}")]
    Cancelled { message: String },
}

impl FerryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            FerryError::Validation { .. } => "validation",
            FerryError::Transport { .. } => "transport",
            FerryError::Storage { .. } => "storage",
            FerryError::NotFound { .. } => "not_found",
            FerryError::Conflict { .. } => "conflict",
            FerryError::Cancelled { .. } => "cancelled",
        }
    }

    /// The human text without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            FerryError::Validation { message }
            | FerryError::Transport { message }
            | FerryError::Storage { message }
            | FerryError::NotFound { message }
            | FerryError::Conflict { message }
            | FerryError::Cancelled { message } => message,
        }
    }
}

pub type FerryResult<T> = Result<T, FerryError>;

impl From<sea_orm::DbErr> for FerryError {
    fn from(value: sea_orm::DbErr) -> Self {
        FerryError::storage(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::FerryError;

    #[test]
    fn helper_constructors_set_variants() {
        let err = FerryError::validation("bad");
        assert!(matches!(err, FerryError::Validation { .. }));
        let err = FerryError::transport("down");
        assert!(matches!(err, FerryError::Transport { .. }));
        let err = FerryError::storage("disk");
        assert!(matches!(err, FerryError::Storage { .. }));
        let err = FerryError::not_found("missing");
        assert!(matches!(err, FerryError::NotFound { .. }));
        let err = FerryError::conflict("dup");
        assert!(matches!(err, FerryError::Conflict { .. }));
        let err = FerryError::cancelled("ctrl-c");
        assert!(matches!(err, FerryError::Cancelled { .. }));
    }

    #[test]
    fn code_and_message_strip_prefix() {
        let err = FerryError::transport("connection reset");
        assert_eq!(err.code(), "transport");
        assert_eq!(err.message(), "connection reset");
        assert_eq!(err.to_string(), "transport error: connection reset");
    }
}
