use transfer_engine::TransferError;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("playlist load failed: {source}")]
    Load {
        #[from]
        source: TransferError,
    },

    #[error("failed to parse playlist {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("master playlist not accepted at {url}")]
    MasterRejected { url: String },

    #[error("clip range invalid: {reason}")]
    InvalidRange { reason: String },

    #[error("re-encode failed for {segment}: {reason}")]
    Reencode { segment: String, reason: String },

    #[error("playlist has no usable timing: {reason}")]
    MissingTiming { reason: String },
}

impl ManifestError {
    pub fn parse(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_range(reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            reason: reason.into(),
        }
    }

    /// Unretriable failures must surface as such in terminal statuses.
    pub fn is_unretriable(&self) -> bool {
        match self {
            Self::Load { source } => source.is_unretriable(),
            Self::Parse { .. }
            | Self::MasterRejected { .. }
            | Self::InvalidRange { .. }
            | Self::MissingTiming { .. } => true,
            Self::Reencode { .. } => false,
        }
    }
}
