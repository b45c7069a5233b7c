// Segment dispatcher for the in-house backend.
//
// Streams every source segment to the remote transcoder, fans the uploads of
// the returned renditions out with bounded parallelism, and emits the output
// manifests once all segments have landed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use m3u8_rs::MediaPlaylist;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use hls_manifest::{ManifestGenerator, PlaylistLoader};
use transfer_engine::{FetchLayer, StoreRouter, join_url};
use vod_types::{EncodedProfile, JobHooks, RenditionPayload, RenditionSegment};

use crate::config::DispatchConfig;
use crate::error::PipelineError;
use crate::multipart;

/// Transcodes one MPEG-TS segment into every requested rendition.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SegmentTranscoder: Send + Sync {
    async fn transcode_segment(
        &self,
        manifest_id: &str,
        seq: u64,
        duration_ms: u64,
        data: Bytes,
        profiles: &[EncodedProfile],
    ) -> Result<Vec<RenditionSegment>, PipelineError>;
}

/// HTTP driver for the remote transcoder's segment endpoint.
pub struct HttpSegmentTranscoder {
    client: reqwest::Client,
    config: DispatchConfig,
}

impl HttpSegmentTranscoder {
    pub fn new(client: reqwest::Client, config: DispatchConfig) -> Self {
        Self { client, config }
    }

    fn segment_url(&self, manifest_id: &str, seq: u64) -> Result<Url, PipelineError> {
        join_url(
            &self.config.transcoder_url,
            &format!("live/{manifest_id}/{seq}.ts"),
        )
        .map_err(PipelineError::from)
    }
}

#[async_trait]
impl SegmentTranscoder for HttpSegmentTranscoder {
    async fn transcode_segment(
        &self,
        manifest_id: &str,
        seq: u64,
        duration_ms: u64,
        data: Bytes,
        profiles: &[EncodedProfile],
    ) -> Result<Vec<RenditionSegment>, PipelineError> {
        let url = self.segment_url(manifest_id, seq)?;
        let configuration = serde_json::json!({ "profiles": profiles });
        let configuration = URL_SAFE_NO_PAD.encode(configuration.to_string());

        // Chunked transfer: hand reqwest a stream body rather than a sized one.
        let body = reqwest::Body::wrap_stream(futures::stream::once(async move {
            Ok::<_, std::convert::Infallible>(data)
        }));

        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "video/mp2t")
            .header(reqwest::header::ACCEPT, "multipart/mixed")
            .header("Content-Duration", duration_ms.to_string())
            .header("Livepeer-Transcode-Configuration", configuration)
            .body(body)
            .timeout(self.config.segment_timeout)
            .send()
            .await
            .map_err(|e| PipelineError::segment(format!("POST {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            // Carry up to 10 KiB of the body in the error for diagnosis.
            let body = response.bytes().await.unwrap_or_default();
            let head = &body[..body.len().min(10 * 1024)];
            return Err(PipelineError::segment(format!(
                "transcoder returned {status} for segment {seq}: {}",
                String::from_utf8_lossy(head)
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = multipart::mixed_boundary(&content_type)?;
        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::segment(format!("reading response body: {e}")))?;

        multipart::parse_parts(&boundary, &body)?
            .iter()
            .map(multipart::part_to_rendition)
            .collect()
    }
}

/// Outcome of one fully dispatched job.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub master_url: Url,
    pub segments_transcoded: usize,
    pub source_playlist: MediaPlaylist,
}

pub struct SegmentDispatcher {
    fetch: Arc<FetchLayer>,
    stores: Arc<StoreRouter>,
    loader: Arc<PlaylistLoader>,
    generator: Arc<ManifestGenerator>,
    transcoder: Arc<dyn SegmentTranscoder>,
    concurrency: usize,
}

impl SegmentDispatcher {
    pub fn new(
        fetch: Arc<FetchLayer>,
        stores: Arc<StoreRouter>,
        loader: Arc<PlaylistLoader>,
        generator: Arc<ManifestGenerator>,
        transcoder: Arc<dyn SegmentTranscoder>,
        concurrency: usize,
    ) -> Self {
        Self {
            fetch,
            stores,
            loader,
            generator,
            transcoder,
            concurrency: concurrency.max(1),
        }
    }

    /// Transcode every segment of the source manifest and write the output
    /// renditions and manifests under `dest_base`.
    pub async fn dispatch(
        &self,
        source_manifest: &Url,
        dest_base: &Url,
        manifest_id: &str,
        profiles: &[EncodedProfile],
        hooks: &JobHooks,
        token: &CancellationToken,
    ) -> Result<DispatchOutcome, PipelineError> {
        let request_id = manifest_id;
        let playlist = self.loader.load(source_manifest, request_id, token).await?;
        let total = playlist.segments.len();
        if total == 0 {
            return Err(PipelineError::segment("source playlist has no segments"));
        }
        info!(request_id, segments = total, "Dispatching segments to transcoder");

        let completed = Arc::new(AtomicUsize::new(0));
        let mut jobs = playlist.segments.iter().enumerate().map(|(index, segment)| {
            let seq = playlist.media_sequence + index as u64;
            let segment_url = source_manifest.join(&segment.uri);
            let duration_ms = (f64::from(segment.duration) * 1000.0).round() as u64;
            (seq, segment_url, duration_ms)
        });

        let mut in_flight = FuturesUnordered::new();
        let mut first_error: Option<PipelineError> = None;

        loop {
            while in_flight.len() < self.concurrency && first_error.is_none() {
                let Some((seq, segment_url, duration_ms)) = jobs.next() else {
                    break;
                };
                let segment_url = match segment_url {
                    Ok(url) => url,
                    Err(e) => {
                        first_error =
                            Some(PipelineError::segment(format!("invalid segment URI: {e}")));
                        break;
                    }
                };
                in_flight.push(self.process_segment(
                    seq,
                    segment_url,
                    duration_ms,
                    dest_base.clone(),
                    manifest_id,
                    profiles,
                    hooks,
                    completed.clone(),
                    total,
                    token,
                ));
            }

            match in_flight.next().await {
                Some(Ok(seq)) => {
                    debug!(request_id, seq, "Segment complete");
                }
                Some(Err((seq, err))) => {
                    // A failed segment sinks the in-house attempt; the router
                    // decides whether the job moves to the other backend.
                    error!(request_id, seq, error = %err, "Segment failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                None => break,
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let master_url = self
            .generator
            .generate(&playlist, dest_base, profiles, request_id, token)
            .await?;

        Ok(DispatchOutcome {
            master_url,
            segments_transcoded: completed.load(Ordering::Relaxed),
            source_playlist: playlist,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_segment(
        &self,
        seq: u64,
        segment_url: Url,
        duration_ms: u64,
        dest_base: Url,
        manifest_id: &str,
        profiles: &[EncodedProfile],
        hooks: &JobHooks,
        completed: Arc<AtomicUsize>,
        total: usize,
        token: &CancellationToken,
    ) -> Result<u64, (u64, PipelineError)> {
        let result = self
            .process_segment_inner(
                seq,
                &segment_url,
                duration_ms,
                &dest_base,
                manifest_id,
                profiles,
                hooks,
                token,
            )
            .await;
        match result {
            Ok(()) => {
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                (hooks.report_progress)(done as f64 / total as f64);
                Ok(seq)
            }
            Err(err) => Err((seq, err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_segment_inner(
        &self,
        seq: u64,
        segment_url: &Url,
        duration_ms: u64,
        dest_base: &Url,
        manifest_id: &str,
        profiles: &[EncodedProfile],
        hooks: &JobHooks,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let (mut stream, _counter) = self.fetch.open(segment_url, manifest_id, token).await?;
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.map_err(PipelineError::from)?);
        }

        let renditions = self
            .transcoder
            .transcode_segment(manifest_id, seq, duration_ms, Bytes::from(data), profiles)
            .await?;

        for rendition in renditions {
            self.write_rendition(seq, &rendition, dest_base, manifest_id, token)
                .await?;
            (hooks.collect_transcoded_segment)();
        }
        Ok(())
    }

    async fn write_rendition(
        &self,
        seq: u64,
        rendition: &RenditionSegment,
        dest_base: &Url,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let dest = join_url(
            dest_base,
            &format!("{}/{seq}.ts", rendition.rendition_name),
        )?;
        match &rendition.payload {
            RenditionPayload::Inline(bytes) => {
                self.stores.put_bytes(&dest, bytes.clone()).await?;
            }
            RenditionPayload::Reference(url) => {
                let (stream, _counter) = self.fetch.open(url, request_id, token).await?;
                self.stores.put_stream(&dest, stream).await?;
            }
        }
        debug!(request_id, seq, rendition = %rendition.rendition_name, dest = %dest, "Wrote rendition segment");
        Ok(())
    }
}
