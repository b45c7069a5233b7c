use async_trait::async_trait;
use url::Url;

use crate::error::PipelineError;

/// Narrow interface to the external HLS segmenter.
///
/// The segmenter splits the prepared input into MPEG-TS pieces under
/// `dest_base` (`0.ts`, `1.ts`, …) and writes a closed VOD media playlist
/// alongside them. Returns the source manifest URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(
        &self,
        input_url: &Url,
        dest_base: &Url,
        segment_duration_secs: f64,
    ) -> Result<Url, PipelineError>;
}
