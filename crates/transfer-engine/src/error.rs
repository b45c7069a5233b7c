use reqwest::StatusCode;

/// Errors produced while moving bytes from a source into the working store.
///
/// Classification matters more than the shape here: callers retry only what
/// `is_retryable` admits, and terminal status reporting surfaces
/// `is_unretriable` to the user.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("unsupported scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("object store error: {source}")]
    Store {
        #[from]
        source: object_store::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("all gateways failed: {reason}")]
    GatewaysExhausted { reason: String },

    #[error("probe error: {reason}")]
    Probe { reason: String },

    #[error("validation error: {reason}")]
    Validation { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl TransferError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::HttpStatus { status, .. } => *status == StatusCode::NOT_FOUND,
            Self::Store { source } => matches!(source, object_store::Error::NotFound { .. }),
            _ => false,
        }
    }

    /// Whether another attempt at the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. }
            | Self::UnsupportedScheme { .. }
            | Self::NotFound { .. }
            | Self::Decryption { .. }
            | Self::Validation { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Store { source } => !matches!(source, object_store::Error::NotFound { .. }),
            Self::Network { .. }
            | Self::Io { .. }
            | Self::GatewaysExhausted { .. }
            | Self::Probe { .. }
            | Self::Playlist { .. }
            | Self::Timeout { .. }
            | Self::Internal { .. } => true,
        }
    }

    /// Whether the failure must be surfaced to the user as unretriable.
    /// This is not the negation of `is_retryable`: cancellation, for one, is
    /// neither.
    pub fn is_unretriable(&self) -> bool {
        match self {
            Self::InvalidUrl { .. }
            | Self::UnsupportedScheme { .. }
            | Self::NotFound { .. }
            | Self::Decryption { .. }
            | Self::Validation { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_client_error() && *status != StatusCode::TOO_MANY_REQUESTS
            }
            Self::Store { source } => matches!(source, object_store::Error::NotFound { .. }),
            _ => false,
        }
    }
}
