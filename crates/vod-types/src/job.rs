// Per-job input for the transcoding pipeline.

use std::sync::Arc;

use url::Url;

use crate::probe::InputVideo;
use crate::profile::EncodedProfile;
use crate::status::RequestFingerprint;

pub type ProgressHook = Arc<dyn Fn(f64) + Send + Sync>;
pub type SourceSizeHook = Arc<dyn Fn(u64) + Send + Sync>;
pub type SegmentHook = Arc<dyn Fn() + Send + Sync>;

/// Callback hooks a job reports through while it runs. All hooks must be
/// cheap and non-blocking; the pipeline invokes them inline.
#[derive(Clone)]
pub struct JobHooks {
    /// Intra-stage completion ratio in [0,1].
    pub report_progress: ProgressHook,
    /// Total bytes transferred from the source, known after the copy phase.
    pub collect_source_size: SourceSizeHook,
    /// One successfully written transcoded segment.
    pub collect_transcoded_segment: SegmentHook,
}

impl JobHooks {
    pub fn noop() -> Self {
        Self {
            report_progress: Arc::new(|_| {}),
            collect_source_size: Arc::new(|_| {}),
            collect_transcoded_segment: Arc::new(|| {}),
        }
    }
}

impl std::fmt::Debug for JobHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHooks").finish_non_exhaustive()
    }
}

/// Key material for encrypted sources: an AES payload key wrapped with the
/// recipient's RSA public key, plus the private key that unwraps it.
#[derive(Debug, Clone)]
pub struct DecryptionMaterial {
    /// Base64 of the RSA-OAEP-wrapped AES-256 key.
    pub encrypted_key: String,
    /// PEM-encoded RSA private key.
    pub private_key_pem: String,
}

/// Input spec for one transcoding job. Constructed once per request; mutated
/// only to rewrite the source URL after transfer and to attach probed
/// metadata.
#[derive(Clone)]
pub struct JobArgs {
    pub fingerprint: RequestFingerprint,
    pub source_url: Url,
    pub working_url: Option<Url>,
    pub hls_output_url: Option<Url>,
    pub mp4_output_url: Option<Url>,
    /// Target segment size in seconds.
    pub segment_duration_secs: f64,
    /// The input is expected to carry no video track.
    pub audio_only: bool,
    pub profiles: Vec<EncodedProfile>,
    pub decryption: Option<DecryptionMaterial>,
    pub hooks: JobHooks,
    /// Attached by the transfer stage after probing.
    pub probed: Option<InputVideo>,
}

impl JobArgs {
    pub fn new(fingerprint: RequestFingerprint, source_url: Url) -> Self {
        Self {
            fingerprint,
            source_url,
            working_url: None,
            hls_output_url: None,
            mp4_output_url: None,
            segment_duration_secs: 10.0,
            audio_only: false,
            profiles: Vec::new(),
            decryption: None,
            hooks: JobHooks::noop(),
            probed: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.fingerprint.request_id
    }
}

impl std::fmt::Debug for JobArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobArgs")
            .field("request_id", &self.fingerprint.request_id)
            .field("source_url", &self.source_url.as_str())
            .field("working_url", &self.working_url.as_ref().map(Url::as_str))
            .field("hls_output_url", &self.hls_output_url.as_ref().map(Url::as_str))
            .field("mp4_output_url", &self.mp4_output_url.as_ref().map(Url::as_str))
            .field("segment_duration_secs", &self.segment_duration_secs)
            .field("profiles", &self.profiles.len())
            .field("encrypted", &self.decryption.is_some())
            .finish()
    }
}
