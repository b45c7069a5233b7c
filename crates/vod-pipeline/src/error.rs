use hls_manifest::ManifestError;
use transfer_engine::TransferError;

/// Errors surfaced by the transcoding pipeline.
///
/// `AccelerationIncompatible` never leaves the router: it only signals that
/// the cloud job must be resubmitted without acceleration.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{source}")]
    Transfer {
        #[from]
        source: TransferError,
    },

    #[error("{source}")]
    Manifest {
        #[from]
        source: ManifestError,
    },

    #[error("invalid profiles: {reason}")]
    InvalidProfiles { reason: String },

    #[error("segment transcode failed: {reason}")]
    SegmentTranscode { reason: String },

    #[error("malformed transcoder response: {reason}")]
    Multipart { reason: String },

    #[error("cloud transcoder job failed: {reason}")]
    CloudJob { reason: String },

    #[error("cloud transcoder job was canceled")]
    CloudJobCanceled,

    #[error("cloud job is incompatible with accelerated transcoding")]
    AccelerationIncompatible,

    #[error("stream registration failed: {reason}")]
    StreamRegistry { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("job cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl PipelineError {
    pub fn invalid_profiles(reason: impl Into<String>) -> Self {
        Self::InvalidProfiles {
            reason: reason.into(),
        }
    }

    pub fn segment(reason: impl Into<String>) -> Self {
        Self::SegmentTranscode {
            reason: reason.into(),
        }
    }

    pub fn multipart(reason: impl Into<String>) -> Self {
        Self::Multipart {
            reason: reason.into(),
        }
    }

    pub fn cloud(reason: impl Into<String>) -> Self {
        Self::CloudJob {
            reason: reason.into(),
        }
    }

    /// Whether the terminal status for this failure carries `unretriable`.
    pub fn is_unretriable(&self) -> bool {
        match self {
            Self::Transfer { source } => source.is_unretriable(),
            Self::Manifest { source } => source.is_unretriable(),
            Self::InvalidProfiles { .. } => true,
            _ => false,
        }
    }

    /// Whether the router may retry the job on the other backend.
    pub fn is_backend_fallback_candidate(&self) -> bool {
        match self {
            Self::Cancelled | Self::AccelerationIncompatible => false,
            Self::Transfer { source } => !source.is_unretriable(),
            Self::Manifest { source } => !source.is_unretriable(),
            Self::InvalidProfiles { .. } => false,
            _ => true,
        }
    }
}
