use thiserror::Error;

/// Core error type for doodlepad.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum DoodlepadError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("endpoint unavailable: {endpoint}")]
    Unavailable { endpoint: String },

    #[error("request failed with status {code}: {message}")]
    Status { code: u16, message: String },

    /// The backend refused the request because the caller lacks a
    /// subscription or trial.
    #[error("entitlement required ({code})")]
    EntitlementRequired { code: String },

    /// No bytes arrived on an open stream within the configured limit.
    #[error("stream stalled: no bytes for {limit_ms}ms")]
    Stalled { limit_ms: u64 },

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DoodlepadError {
    /// Short machine-friendly label, used as `error.kind` in telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unavailable { .. } => "unavailable",
            Self::Status { .. } => "status",
            Self::EntitlementRequired { .. } => "entitlement_required",
            Self::Stalled { .. } => "stalled",
            Self::Decode(_) => "decode",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, DoodlepadError>;
