// Backend routing: profile defaulting, in-house first, cloud fallback.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transfer_engine::{PreparedInput, join_url};
use url::Url;

use vod_types::{EncodedProfile, InputVideo, JobArgs, OutputDescriptor, OutputVideoFile};

use crate::cloud::{CloudRequest, CloudTranscoder};
use crate::config::RouterConfig;
use crate::dispatch::SegmentDispatcher;
use crate::error::PipelineError;
use crate::segmenter::Segmenter;

/// Rendition ladder used when a job supplies no profiles.
fn default_ladder() -> Vec<EncodedProfile> {
    vec![
        EncodedProfile::new("360p0", 640, 360, 1_000_000),
        EncodedProfile::new("720p0", 1280, 720, 4_000_000),
    ]
}

/// Remote control plane that hands out stream identifiers for the in-house
/// transcoder. Whatever happens to the job, an acquired id must be released
/// before the router returns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamRegistry: Send + Sync {
    async fn create_stream(&self, request_id: &str) -> Result<String, PipelineError>;
    async fn release_stream(&self, stream_id: &str) -> Result<(), PipelineError>;
}

/// Fallback registry when no control plane is configured: the request id
/// doubles as the manifest id and there is nothing to release.
pub struct LocalStreamRegistry;

#[async_trait]
impl StreamRegistry for LocalStreamRegistry {
    async fn create_stream(&self, request_id: &str) -> Result<String, PipelineError> {
        Ok(request_id.to_string())
    }

    async fn release_stream(&self, _stream_id: &str) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    InHouse,
    Cloud,
}

#[derive(Debug)]
pub struct TranscodeOutcome {
    pub backend: BackendKind,
    pub outputs: Vec<OutputDescriptor>,
    pub segments_transcoded: usize,
}

/// The in-house backend: external segmenter plus segment dispatcher.
pub struct InHouseBackend {
    segmenter: Arc<dyn Segmenter>,
    dispatcher: Arc<SegmentDispatcher>,
}

impl InHouseBackend {
    pub fn new(segmenter: Arc<dyn Segmenter>, dispatcher: Arc<SegmentDispatcher>) -> Self {
        Self {
            segmenter,
            dispatcher,
        }
    }

    async fn transcode(
        &self,
        args: &JobArgs,
        prepared: &PreparedInput,
        manifest_id: &str,
        token: &CancellationToken,
    ) -> Result<(Url, usize), PipelineError> {
        let working = args.working_url.as_ref().ok_or_else(|| {
            PipelineError::Internal {
                reason: "in-house backend requires a working location".to_string(),
            }
        })?;
        let hls_output = args.hls_output_url.as_ref().ok_or_else(|| {
            PipelineError::Internal {
                reason: "in-house backend requires an HLS output location".to_string(),
            }
        })?;

        let source_base = join_url(working, "source")?;
        let source_manifest = self
            .segmenter
            .segment(&prepared.access_url, &source_base, args.segment_duration_secs)
            .await?;

        let outcome = self
            .dispatcher
            .dispatch(
                &source_manifest,
                hls_output,
                manifest_id,
                &args.profiles,
                &args.hooks,
                token,
            )
            .await?;
        Ok((outcome.master_url, outcome.segments_transcoded))
    }
}

pub struct BackendRouter {
    in_house: InHouseBackend,
    cloud: CloudTranscoder,
    streams: Arc<dyn StreamRegistry>,
    config: RouterConfig,
}

impl BackendRouter {
    pub fn new(
        in_house: InHouseBackend,
        cloud: CloudTranscoder,
        streams: Arc<dyn StreamRegistry>,
        config: RouterConfig,
    ) -> Self {
        Self {
            in_house,
            cloud,
            streams,
            config,
        }
    }

    /// Choose a backend and run the job on it. Rewrites `args.profiles` with
    /// the effective rendition set.
    pub async fn route(
        &self,
        args: &mut JobArgs,
        prepared: &PreparedInput,
        token: &CancellationToken,
    ) -> Result<TranscodeOutcome, PipelineError> {
        args.profiles =
            effective_profiles(&self.config, &args.profiles, &prepared.video)?;

        let too_long = prepared.video.duration_secs
            > self.config.max_in_house_duration.as_secs_f64();
        if too_long {
            info!(
                request_id = args.request_id(),
                duration = prepared.video.duration_secs,
                "Input exceeds in-house duration threshold, using cloud backend"
            );
            return self.transcode_cloud(args, prepared, token).await;
        }

        let stream_id = self.streams.create_stream(args.request_id()).await?;
        let result = self
            .in_house
            .transcode(args, prepared, &stream_id, token)
            .await;
        // At-most-once lifecycle: the id is released on every path before
        // the router does anything else with the job.
        if let Err(err) = self.streams.release_stream(&stream_id).await {
            warn!(request_id = args.request_id(), error = %err, "Stream release failed");
        }

        match result {
            Ok((master_url, segments)) => Ok(TranscodeOutcome {
                backend: BackendKind::InHouse,
                outputs: vec![hls_descriptor(&master_url, &args.profiles)],
                segments_transcoded: segments,
            }),
            Err(err) if err.is_backend_fallback_candidate() => {
                warn!(
                    request_id = args.request_id(),
                    error = %err,
                    "In-house transcode failed, falling back to cloud backend"
                );
                self.transcode_cloud(args, prepared, token).await
            }
            Err(err) => Err(err),
        }
    }

    async fn transcode_cloud(
        &self,
        args: &JobArgs,
        prepared: &PreparedInput,
        token: &CancellationToken,
    ) -> Result<TranscodeOutcome, PipelineError> {
        let request = CloudRequest {
            request_id: args.request_id().to_string(),
            input_url: prepared.access_url.clone(),
            hls_output: args.hls_output_url.clone(),
            mp4_output: args.mp4_output_url.clone(),
            profiles: args.profiles.clone(),
        };

        let outputs = match self
            .cloud
            .transcode(&request, true, &args.hooks, token)
            .await
        {
            // One retry with acceleration disabled, then the error stands.
            Err(PipelineError::AccelerationIncompatible) => {
                info!(
                    request_id = args.request_id(),
                    "Provider rejected accelerated mode, resubmitting without acceleration"
                );
                self.cloud
                    .transcode(&request, false, &args.hooks, token)
                    .await?
            }
            other => other?,
        };

        Ok(TranscodeOutcome {
            backend: BackendKind::Cloud,
            outputs,
            segments_transcoded: 0,
        })
    }
}

fn hls_descriptor(master_url: &Url, profiles: &[EncodedProfile]) -> OutputDescriptor {
    OutputDescriptor {
        kind: "hls".to_string(),
        manifest: master_url.to_string(),
        videos: profiles
            .iter()
            .map(|p| OutputVideoFile {
                location: format!("{}/index.m3u8", p.name),
                size_bytes: None,
                width: Some(p.width),
                height: Some(p.height),
                bitrate: Some(p.bitrate),
            })
            .collect(),
    }
}

/// Resolve the rendition set a job transcodes to.
///
/// Supplied profiles are validated, with `copy`-only lists rejected outright.
/// An empty list derives defaults from the source: every ladder entry that is
/// strictly lower quality than the source survives, a half-bitrate profile is
/// synthesized when none do, and a profile at native resolution and bitrate
/// is always appended (replacing a same-height derivation).
pub fn effective_profiles(
    config: &RouterConfig,
    supplied: &[EncodedProfile],
    video: &InputVideo,
) -> Result<Vec<EncodedProfile>, PipelineError> {
    if !supplied.is_empty() {
        if supplied.iter().all(EncodedProfile::is_copy) {
            return Err(PipelineError::invalid_profiles(
                "all supplied profiles request copy passthrough",
            ));
        }
        let usable: Vec<EncodedProfile> = supplied
            .iter()
            .filter(|p| !p.is_copy())
            .cloned()
            .collect();
        if let Some(invalid) = usable.iter().find(|p| !p.is_valid()) {
            return Err(PipelineError::invalid_profiles(format!(
                "profile {} has non-positive dimensions or bitrate",
                invalid.name
            )));
        }
        return Ok(usable);
    }

    let Some(track) = video.primary_video_track() else {
        return Ok(Vec::new());
    };
    let src_width = track.width.unwrap_or(0);
    let src_height = track.height.unwrap_or(0);
    let src_bitrate = u32::try_from(track.bitrate).unwrap_or(u32::MAX);

    let mut derived: Vec<EncodedProfile> = default_ladder()
        .into_iter()
        .filter(|p| p.height <= src_height && p.bitrate < src_bitrate)
        .collect();

    // The native-quality profile appended below owns this height.
    derived.retain(|p| p.height != src_height);

    if derived.is_empty() && src_height > 0 {
        let floor = if src_bitrate < config.bitrate_floor {
            config.absolute_bitrate_floor
        } else {
            config.bitrate_floor
        };
        derived.push(EncodedProfile::new(
            "low-bitrate",
            src_width,
            src_height,
            (src_bitrate / 2).max(floor),
        ));
    }

    derived.push(EncodedProfile::new(
        format!("{src_height}p0"),
        src_width,
        src_height,
        src_bitrate,
    ));

    Ok(derived)
}
