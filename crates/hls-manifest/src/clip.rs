// Time-range clipping of a VOD playlist.
//
// Boundary segments are re-encoded to the exact cut points through an
// injected re-encoder (media tools live outside this crate); interior
// segments pass through untouched with their URIs rewritten to reference the
// originals one directory up.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use m3u8_rs::{MediaPlaylist, MediaPlaylistType, MediaSegment};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use transfer_engine::{StoreRouter, dir_url, file_name, join_url};
use url::Url;

use crate::error::ManifestError;
use crate::load::PlaylistLoader;

/// Re-encodes one segment between intra-segment offsets (seconds).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SegmentReencoder: Send + Sync {
    async fn reencode(
        &self,
        segment_url: &Url,
        from_secs: f64,
        to_secs: f64,
    ) -> Result<Bytes, ManifestError>;
}

pub struct ClipGenerator {
    loader: Arc<PlaylistLoader>,
    stores: Arc<StoreRouter>,
    reencoder: Arc<dyn SegmentReencoder>,
}

struct TimedSegment {
    source_url: Url,
    name: String,
    start_ms: i64,
    duration_ms: i64,
    duration: f32,
}

impl ClipGenerator {
    pub fn new(
        loader: Arc<PlaylistLoader>,
        stores: Arc<StoreRouter>,
        reencoder: Arc<dyn SegmentReencoder>,
    ) -> Self {
        Self {
            loader,
            stores,
            reencoder,
        }
    }

    /// Clip `[start_ms, end_ms]` (Unix milliseconds) out of the playlist at
    /// `source_url`, writing the new playlist to `dest_url` and re-encoded
    /// boundary pieces alongside it.
    pub async fn clip(
        &self,
        source_url: &Url,
        dest_url: &Url,
        start_ms: i64,
        end_ms: i64,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<Url, ManifestError> {
        if end_ms <= start_ms {
            return Err(ManifestError::invalid_range(format!(
                "end {end_ms} must be after start {start_ms}"
            )));
        }

        let source = self.loader.load(source_url, request_id, token).await?;
        let timed = Self::time_segments(source_url, &source)?;

        let covering: Vec<&TimedSegment> = timed
            .iter()
            .filter(|s| s.start_ms < end_ms && s.start_ms + s.duration_ms > start_ms)
            .collect();
        if covering.is_empty() {
            return Err(ManifestError::invalid_range(format!(
                "no segments cover [{start_ms}, {end_ms}]"
            )));
        }

        let dest_dir = dir_url(dest_url)?;
        let total = covering.len();
        let mark_discontinuities = total > 2;
        let mut segments = Vec::with_capacity(total);

        for (index, segment) in covering.iter().enumerate() {
            let is_first = index == 0;
            let is_last = index == total - 1;

            if is_first || is_last {
                let from_secs = if is_first {
                    (start_ms - segment.start_ms) as f64 / 1000.0
                } else {
                    0.0
                };
                let to_secs = if is_last {
                    (end_ms - segment.start_ms) as f64 / 1000.0
                } else {
                    segment.duration_ms as f64 / 1000.0
                };

                let bytes = self
                    .reencoder
                    .reencode(&segment.source_url, from_secs, to_secs)
                    .await?;
                let piece_url = join_url(&dest_dir, &segment.name)?;
                self.stores
                    .put_bytes(&piece_url, bytes)
                    .await
                    .map_err(ManifestError::from)?;
                debug!(request_id, piece = %piece_url, from_secs, to_secs, "Re-encoded clip boundary");

                segments.push(MediaSegment {
                    uri: segment.name.clone(),
                    duration: (to_secs - from_secs) as f32,
                    discontinuity: mark_discontinuities && is_last && !is_first,
                    ..Default::default()
                });
            } else {
                segments.push(MediaSegment {
                    uri: format!("../{}", segment.name),
                    duration: segment.duration,
                    // Only the first interior segment carries the marker.
                    discontinuity: mark_discontinuities && index == 1,
                    ..Default::default()
                });
            }
        }

        let playlist = MediaPlaylist {
            version: source.version,
            target_duration: source.target_duration,
            playlist_type: Some(MediaPlaylistType::Vod),
            end_list: true,
            segments,
            ..Default::default()
        };

        let mut body = Vec::new();
        let _ = playlist.write_to(&mut body);
        self.stores
            .put_bytes(dest_url, Bytes::from(body))
            .await
            .map_err(ManifestError::from)?;

        info!(request_id, clip = %dest_url, segments = total, "Wrote clipped playlist");
        Ok(dest_url.clone())
    }

    /// Anchor every segment on the timeline. The first segment's
    /// program-date-time is the anchor; later segments accumulate durations.
    fn time_segments(
        source_url: &Url,
        playlist: &MediaPlaylist,
    ) -> Result<Vec<TimedSegment>, ManifestError> {
        let anchor_ms = playlist
            .segments
            .first()
            .and_then(|s| s.program_date_time.as_ref())
            .map(|pdt| pdt.timestamp_millis())
            .ok_or_else(|| ManifestError::MissingTiming {
                reason: "first segment has no program-date-time".to_string(),
            })?;

        let mut start_ms = anchor_ms;
        playlist
            .segments
            .iter()
            .map(|segment| {
                let source = source_url.join(&segment.uri).map_err(|e| {
                    ManifestError::parse(source_url.as_str(), format!("bad segment URI: {e}"))
                })?;
                let name = file_name(&source).ok_or_else(|| {
                    ManifestError::parse(source_url.as_str(), "segment URI has no file name")
                })?;
                let duration_ms = (f64::from(segment.duration) * 1000.0).round() as i64;
                let timed = TimedSegment {
                    source_url: source,
                    name,
                    start_ms,
                    duration_ms,
                    duration: segment.duration,
                };
                start_ms += duration_ms;
                Ok(timed)
            })
            .collect()
    }
}
