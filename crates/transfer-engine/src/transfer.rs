// Transfer stage: land the input asset in the working store, sign an access
// URL for it and probe the result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use m3u8_rs::Playlist;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use vod_types::{InputVideo, JobHooks};

use crate::decrypt::SegmentDecryptor;
use crate::error::TransferError;
use crate::fetch::FetchLayer;
use crate::store::StoreRouter;
use crate::urlmap::{file_name, join_url, segment_transfer_location};

/// Narrow interface to the external media-inspection tool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, access_url: &Url) -> Result<InputVideo, TransferError>;
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Largest input the pipeline accepts, in bytes.
    pub max_input_bytes: u64,
    /// Lifetime of presigned access URLs.
    pub presign_ttl: Duration,
    /// Wall-clock budget for copying a single-file input.
    pub single_file_timeout: Duration,
    /// Wall-clock budget for copying a full HLS bundle.
    pub bundle_timeout: Duration,
    /// Use an HLS input in place without copying it.
    pub skip_hls_copy: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 30 * 1024 * 1024 * 1024,
            presign_ttl: Duration::from_secs(24 * 60 * 60),
            single_file_timeout: Duration::from_secs(30 * 60),
            bundle_timeout: Duration::from_secs(2 * 60 * 60),
            skip_hls_copy: true,
        }
    }
}

/// Outcome of a successful prepare.
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub video: InputVideo,
    /// Access URL for the working copy (or the input itself on the HLS fast
    /// path), usable by downstream tools without further credentials.
    pub access_url: Url,
    pub source_bytes: u64,
}

pub struct TransferStage {
    fetch: Arc<FetchLayer>,
    stores: Arc<StoreRouter>,
    client: reqwest::Client,
    prober: Arc<dyn Prober>,
    config: TransferConfig,
}

impl TransferStage {
    pub fn new(
        fetch: Arc<FetchLayer>,
        stores: Arc<StoreRouter>,
        client: reqwest::Client,
        prober: Arc<dyn Prober>,
        config: TransferConfig,
    ) -> Self {
        Self {
            fetch,
            stores,
            client,
            prober,
            config,
        }
    }

    /// Copy the input into the working location, sign it, probe it and
    /// report the source size through the job hooks.
    pub async fn prepare(
        &self,
        request_id: &str,
        input_url: &Url,
        working_url: Option<&Url>,
        decryption: Option<Arc<SegmentDecryptor>>,
        audio_only: bool,
        hooks: &JobHooks,
        token: &CancellationToken,
    ) -> Result<PreparedInput, TransferError> {
        let working_url = working_url.ok_or_else(|| {
            TransferError::validation("no working location supplied for transfer")
        })?;

        let is_hls = input_url.path().ends_with(".m3u8");

        let (access_target, copied_bytes, manifest_bytes) = if is_hls && self.config.skip_hls_copy {
            info!(request_id, input = %input_url, "HLS input used in place, skipping copy");
            (input_url.clone(), 0, None)
        } else if is_hls {
            let (manifest_dst, total, manifest) = tokio::time::timeout(
                self.config.bundle_timeout,
                self.copy_bundle(request_id, input_url, working_url, decryption, token),
            )
            .await
            .map_err(|_| TransferError::Timeout {
                reason: format!("HLS bundle copy exceeded {:?}", self.config.bundle_timeout),
            })??;
            (manifest_dst, total, Some(manifest))
        } else {
            let filename = file_name(input_url).unwrap_or_else(|| "input".to_string());
            let copied = tokio::time::timeout(
                self.config.single_file_timeout,
                self.fetch
                    .copy_file(input_url, working_url, &filename, request_id, decryption, token),
            )
            .await
            .map_err(|_| TransferError::Timeout {
                reason: format!("copy exceeded {:?}", self.config.single_file_timeout),
            })??;
            if copied.bytes_written == 0 {
                return Err(TransferError::validation(format!(
                    "zero bytes transferred from {input_url}"
                )));
            }
            (copied.destination, copied.bytes_read, None)
        };

        let access_url = self
            .stores
            .signed_access_url(&self.client, &access_target, self.config.presign_ttl)
            .await?;

        let mut video = self.prober.probe(&access_url).await?;
        self.validate_probe(&video, audio_only)?;

        // Some HLS sources probe with a zero duration; fall back to the sum
        // of segment durations from the manifest.
        if is_hls && video.duration_secs == 0.0 {
            let manifest = match manifest_bytes {
                Some(manifest) => manifest,
                None => self.load_media_playlist(input_url, request_id, token).await?,
            };
            video.duration_secs = manifest
                .segments
                .iter()
                .map(|s| f64::from(s.duration))
                .sum();
            debug!(
                request_id,
                duration = video.duration_secs,
                "Derived HLS duration from segment sum"
            );
        }

        let source_bytes = if copied_bytes > 0 {
            copied_bytes
        } else {
            video.size_bytes
        };
        (hooks.collect_source_size)(source_bytes);

        Ok(PreparedInput {
            video,
            access_url,
            source_bytes,
        })
    }

    fn validate_probe(&self, video: &InputVideo, audio_only: bool) -> Result<(), TransferError> {
        if video.size_bytes > self.config.max_input_bytes {
            return Err(TransferError::validation(format!(
                "input size {} is greater than the max allowed {}",
                video.size_bytes, self.config.max_input_bytes
            )));
        }
        match video.primary_video_track() {
            None if audio_only => {}
            None => {
                return Err(TransferError::validation(
                    "no video track found in input".to_string(),
                ));
            }
            Some(track) => {
                if track.fps.unwrap_or(0.0) <= 0.0 {
                    return Err(TransferError::validation(
                        "invalid framerate on primary video track".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Copy the manifest and every segment it references, mirroring the
    /// source layout under the working location. Returns the destination
    /// manifest URL, total bytes read and the parsed manifest.
    async fn copy_bundle(
        &self,
        request_id: &str,
        manifest_url: &Url,
        working_url: &Url,
        decryption: Option<Arc<SegmentDecryptor>>,
        token: &CancellationToken,
    ) -> Result<(Url, u64, m3u8_rs::MediaPlaylist), TransferError> {
        let manifest = self.load_media_playlist(manifest_url, request_id, token).await?;

        let manifest_name = file_name(manifest_url).unwrap_or_else(|| "index.m3u8".to_string());
        let manifest_dst = join_url(working_url, &manifest_name)?;

        let mut targets: Vec<(Url, Url)> = Vec::with_capacity(manifest.segments.len() + 1);
        targets.push((manifest_url.clone(), manifest_dst.clone()));
        for segment in &manifest.segments {
            let segment_src = manifest_url.join(&segment.uri).map_err(|e| {
                TransferError::playlist(format!("invalid segment URI {}: {e}", segment.uri))
            })?;
            let segment_dst = segment_transfer_location(manifest_url, &manifest_dst, &segment_src)?;
            targets.push((segment_src, segment_dst));
        }

        let multi_file = targets.len() > 1;
        let mut total: u64 = 0;
        for (src, dst) in &targets {
            let copied = self
                .fetch
                .copy_to(src, dst, request_id, decryption.clone(), token)
                .await?;
            if copied.bytes_written == 0 {
                if multi_file {
                    // One empty file inside a bundle is tolerated; players
                    // skip it the same way we do.
                    warn!(request_id, src = %src, "Zero-byte file in HLS bundle");
                } else {
                    return Err(TransferError::validation(format!(
                        "zero bytes transferred from {src}"
                    )));
                }
            }
            total += copied.bytes_read;
        }

        Ok((manifest_dst, total, manifest))
    }

    async fn load_media_playlist(
        &self,
        url: &Url,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<m3u8_rs::MediaPlaylist, TransferError> {
        let (stream, _counter) = self.fetch.open(url, request_id, token).await?;
        let bytes = collect(stream).await?;
        match m3u8_rs::parse_playlist_res(&bytes) {
            Ok(Playlist::MediaPlaylist(playlist)) => Ok(playlist),
            Ok(Playlist::MasterPlaylist(_)) => Err(TransferError::playlist(format!(
                "expected media playlist at {url}, found master"
            ))),
            Err(e) => Err(TransferError::playlist(format!(
                "failed to parse playlist {url}: {e}"
            ))),
        }
    }
}

async fn collect(mut stream: crate::counter::ByteStream) -> Result<Vec<u8>, TransferError> {
    use futures::StreamExt;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
