// Top-level job state machine: transfer → route → publish → terminal status.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transfer_engine::{SegmentDecryptor, StoreRouter, TransferStage};
use url::Url;

use vod_types::{
    JobArgs, SourcePlayback, StatusMessage, TranscodeStatus, VideoSpec,
};

use crate::error::PipelineError;
use crate::progress::ProgressAggregator;
use crate::router::BackendRouter;

const PUBLISH_URL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct JobOrchestrator {
    transfer: Arc<TransferStage>,
    router: Arc<BackendRouter>,
    aggregator: Arc<ProgressAggregator>,
    stores: Arc<StoreRouter>,
    client: reqwest::Client,
}

impl JobOrchestrator {
    pub fn new(
        transfer: Arc<TransferStage>,
        router: Arc<BackendRouter>,
        aggregator: Arc<ProgressAggregator>,
        stores: Arc<StoreRouter>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            transfer,
            router,
            aggregator,
            stores,
            client,
        }
    }

    /// Run one request end to end. A terminal status is pushed into the
    /// aggregator on every exit path; the error (with its original message
    /// preserved verbatim) is also returned to the caller.
    pub async fn run(
        &self,
        mut args: JobArgs,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let fingerprint = args.fingerprint.clone();
        info!(request_id = %fingerprint.request_id, source = %args.source_url, "Starting job");

        // The current stage steers how hook-reported ratios are weighted;
        // the last raw ratio feeds the terminal error message.
        let stage = Arc::new(Mutex::new(TranscodeStatus::Preparing));
        let last_ratio = Arc::new(Mutex::new(0.0f64));
        {
            let aggregator = self.aggregator.clone();
            let fingerprint = fingerprint.clone();
            let stage = stage.clone();
            let last_ratio = last_ratio.clone();
            args.hooks.report_progress = Arc::new(move |ratio| {
                let current_stage = *stage.lock();
                *last_ratio.lock() = ratio;
                aggregator.submit(StatusMessage::progress(&fingerprint, current_stage, ratio));
            });
        }

        let result = self.run_inner(&mut args, &stage, token).await;

        match &result {
            Ok(()) => {}
            Err(err) => {
                let ratio = *last_ratio.lock();
                error!(request_id = %fingerprint.request_id, error = %err, "Job failed");
                self.aggregator.submit(StatusMessage::failed(
                    &fingerprint,
                    err.to_string(),
                    err.is_unretriable(),
                    ratio,
                ));
            }
        }
        result
    }

    async fn run_inner(
        &self,
        args: &mut JobArgs,
        stage: &Arc<Mutex<TranscodeStatus>>,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let fingerprint = args.fingerprint.clone();
        self.aggregator
            .submit(StatusMessage::progress(&fingerprint, TranscodeStatus::Preparing, 0.0));

        let decryptor = match &args.decryption {
            Some(material) => Some(Arc::new(SegmentDecryptor::from_material(material)?)),
            None => None,
        };

        let prepared = self
            .transfer
            .prepare(
                &fingerprint.request_id,
                &args.source_url,
                args.working_url.as_ref(),
                decryptor,
                args.audio_only,
                &args.hooks,
                token,
            )
            .await?;

        // The job continues against the working copy.
        args.source_url = prepared.access_url.clone();
        args.probed = Some(prepared.video.clone());
        self.aggregator.submit(StatusMessage::progress(
            &fingerprint,
            TranscodeStatus::PreparingCompleted,
            1.0,
        ));

        *stage.lock() = TranscodeStatus::Transcoding;
        let mut outcome = self.router.route(args, &prepared, token).await?;

        // Published manifest locations follow the access-URL policy: public
        // form when reachable, presigned otherwise.
        for output in &mut outcome.outputs {
            let Ok(manifest_url) = Url::parse(&output.manifest) else {
                continue;
            };
            match self
                .stores
                .signed_access_url(&self.client, &manifest_url, PUBLISH_URL_TTL)
                .await
            {
                Ok(signed) => output.manifest = signed.to_string(),
                Err(err) => {
                    warn!(
                        request_id = %fingerprint.request_id,
                        manifest = %output.manifest,
                        error = %err,
                        "Could not derive access URL for published manifest"
                    );
                }
            }
        }

        let completed = StatusMessage::completed(
            &fingerprint,
            VideoSpec::from(&prepared.video),
            outcome.outputs,
            Some(SourcePlayback {
                url: prepared.access_url.to_string(),
                duration: prepared.video.duration_secs,
            }),
        );
        info!(
            request_id = %fingerprint.request_id,
            backend = ?outcome.backend,
            segments = outcome.segments_transcoded,
            "Job complete"
        );
        self.aggregator.submit(completed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudTranscoder, MockCloudApi};
    use crate::config::{CloudConfig, RouterConfig};
    use crate::dispatch::{MockSegmentTranscoder, SegmentDispatcher};
    use crate::progress::AggregatorConfig;
    use crate::router::{BackendRouter, InHouseBackend, MockStreamRegistry};
    use crate::segmenter::MockSegmenter;
    use async_trait::async_trait;
    use bytes::Bytes;
    use hls_manifest::{ManifestGenerator, PlaylistLoader};
    use std::sync::atomic::{AtomicU64, Ordering};
    use transfer_engine::{
        FetchLayer, GatewayConfig, GatewayPool, Prober, StoreRouter, TransferConfig,
        TransferError,
    };
    use url::Url;
    use vod_types::{
        EncodedProfile, InputTrack, InputVideo, RenditionSegment, RequestFingerprint, TrackKind,
    };

    struct StubProber {
        video: InputVideo,
    }

    #[async_trait]
    impl Prober for StubProber {
        async fn probe(&self, _access_url: &Url) -> Result<InputVideo, TransferError> {
            Ok(self.video.clone())
        }
    }

    fn probed_video() -> InputVideo {
        InputVideo {
            format: "mp4".to_string(),
            duration_secs: 17.5,
            size_bytes: 4096,
            tracks: vec![InputTrack {
                kind: TrackKind::Video,
                codec: "h264".to_string(),
                bitrate: 2_000_000,
                duration_secs: 17.5,
                size_bytes: 4096,
                start_time_secs: 0.0,
                width: Some(640),
                height: Some(360),
                pixel_format: Some("yuv420p".to_string()),
                fps: Some(30.0),
                channels: None,
                sample_rate: None,
                sample_bits: None,
            }],
        }
    }

    struct Harness {
        orchestrator: JobOrchestrator,
        aggregator: Arc<ProgressAggregator>,
        stores: Arc<StoreRouter>,
    }

    fn harness(
        segmenter: MockSegmenter,
        transcoder: MockSegmentTranscoder,
        streams: MockStreamRegistry,
        cloud_api: MockCloudApi,
        prober_video: InputVideo,
    ) -> Harness {
        let client = reqwest::Client::new();
        let stores = Arc::new(StoreRouter::new());
        let fetch = Arc::new(FetchLayer::new(
            client.clone(),
            Arc::new(GatewayPool::new(GatewayConfig::default(), client.clone())),
            stores.clone(),
        ));
        let prober = Arc::new(StubProber {
            video: prober_video,
        });

        let transfer = Arc::new(TransferStage::new(
            fetch.clone(),
            stores.clone(),
            client.clone(),
            prober.clone(),
            TransferConfig::default(),
        ));

        let loader = Arc::new(PlaylistLoader::new(fetch.clone()));
        let generator = Arc::new(ManifestGenerator::new(stores.clone()));
        let dispatcher = Arc::new(SegmentDispatcher::new(
            fetch.clone(),
            stores.clone(),
            loader,
            generator,
            Arc::new(transcoder),
            10,
        ));
        let in_house = InHouseBackend::new(Arc::new(segmenter), dispatcher);

        let mut cloud_config =
            CloudConfig::new(Url::parse("memory://managed/prefix").unwrap());
        cloud_config.poll_interval = std::time::Duration::from_millis(5);
        let cloud = CloudTranscoder::new(
            Arc::new(cloud_api),
            fetch.clone(),
            stores.clone(),
            prober,
            client.clone(),
            cloud_config,
        );

        let router = Arc::new(BackendRouter::new(
            in_house,
            cloud,
            Arc::new(streams),
            RouterConfig::default(),
        ));
        let aggregator = Arc::new(ProgressAggregator::new(
            client.clone(),
            AggregatorConfig::default(),
        ));

        Harness {
            orchestrator: JobOrchestrator::new(
                transfer,
                router,
                aggregator.clone(),
                stores.clone(),
                client,
            ),
            aggregator,
            stores,
        }
    }

    async fn seed_input(stores: &StoreRouter) -> Url {
        let src = Url::parse("memory://orch/in/tiny.mp4").unwrap();
        stores
            .put_bytes(&src, Bytes::from(vec![1u8; 4096]))
            .await
            .unwrap();
        src
    }

    async fn seed_source_manifest(stores: &StoreRouter) -> Url {
        let manifest = Url::parse("memory://orch/work/req-1/source/index.m3u8").unwrap();
        let body = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:11\n\
                    #EXTINF:10.0,\n0.ts\n#EXTINF:7.5,\n1.ts\n#EXT-X-ENDLIST\n";
        stores
            .put_bytes(&manifest, Bytes::from(body.as_bytes().to_vec()))
            .await
            .unwrap();
        for i in 0..2 {
            stores
                .put_bytes(
                    &Url::parse(&format!("memory://orch/work/req-1/source/{i}.ts")).unwrap(),
                    Bytes::from(vec![0x47u8; 188]),
                )
                .await
                .unwrap();
        }
        manifest
    }

    fn args(source: Url) -> JobArgs {
        let mut args = JobArgs::new(
            RequestFingerprint::new("req-1", "http://127.0.0.1:1/hook"),
            source,
        );
        args.working_url = Some(Url::parse("memory://orch/work/req-1").unwrap());
        args.hls_output_url = Some(Url::parse("memory://orch/out/req-1").unwrap());
        args.profiles = vec![EncodedProfile::new("360p0", 640, 360, 900_000)];
        args
    }

    #[tokio::test]
    async fn successful_in_house_job_publishes_and_completes() {
        let mut segmenter = MockSegmenter::new();
        let manifest_url = "memory://orch/work/req-1/source/index.m3u8";
        segmenter
            .expect_segment()
            .times(1)
            .returning(move |_, _, _| Ok(Url::parse(manifest_url).unwrap()));

        let mut transcoder = MockSegmentTranscoder::new();
        transcoder
            .expect_transcode_segment()
            .times(2)
            .returning(|_, _, _, _, _| {
                Ok(vec![RenditionSegment::inline(
                    "360p0",
                    Bytes::from_static(b"transcoded"),
                )])
            });

        let mut streams = MockStreamRegistry::new();
        streams
            .expect_create_stream()
            .times(1)
            .returning(|_| Ok("manifest-1".to_string()));
        streams
            .expect_release_stream()
            .times(1)
            .returning(|_| Ok(()));

        let harness = harness(
            segmenter,
            transcoder,
            streams,
            MockCloudApi::new(),
            probed_video(),
        );
        let source = seed_input(&harness.stores).await;
        seed_source_manifest(&harness.stores).await;

        let counted = Arc::new(AtomicU64::new(0));
        let counted_clone = counted.clone();
        let mut args = args(source);
        args.hooks.collect_transcoded_segment = Arc::new(move || {
            counted_clone.fetch_add(1, Ordering::Relaxed);
        });

        harness
            .orchestrator
            .run(args, &CancellationToken::new())
            .await
            .unwrap();

        let last = harness.aggregator.latest("req-1").unwrap();
        assert_eq!(last.status, TranscodeStatus::Completed);
        assert!((last.completion_ratio - 1.0).abs() < 1e-9);
        assert_eq!(last.kind.as_deref(), Some("video"));
        let outputs = last.outputs.as_ref().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].manifest, "memory://orch/out/req-1/index.m3u8");
        assert!(last.source_playback.is_some());
        assert_eq!(counted.load(Ordering::Relaxed), 2);

        // Transcoded segments and manifests landed at the destination.
        for seq in 0..2 {
            let dest =
                Url::parse(&format!("memory://orch/out/req-1/360p0/{seq}.ts")).unwrap();
            assert_eq!(
                harness.stores.get_bytes(&dest).await.unwrap().as_ref(),
                b"transcoded"
            );
        }
        assert!(
            harness
                .stores
                .get_bytes(&Url::parse("memory://orch/out/req-1/index.m3u8").unwrap())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn oversize_input_fails_terminally_with_unretriable() {
        let mut oversize = probed_video();
        oversize.size_bytes = 64 * 1024 * 1024 * 1024;

        let harness = harness(
            MockSegmenter::new(),
            MockSegmentTranscoder::new(),
            MockStreamRegistry::new(),
            MockCloudApi::new(),
            oversize,
        );
        let source = seed_input(&harness.stores).await;

        let err = harness
            .orchestrator
            .run(args(source), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("greater than"));

        let last = harness.aggregator.latest("req-1").unwrap();
        assert_eq!(last.status, TranscodeStatus::Error);
        assert!(last.unretriable);
        assert!(last.error.as_deref().unwrap().contains("greater than"));
        // No rich payload on failure.
        assert!(last.video_spec.is_none());
        assert!(last.outputs.is_none());
    }
}
