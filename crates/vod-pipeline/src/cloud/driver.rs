// Driver for the cloud transcoding backend: job submission, polling with
// rate-limit awareness, wall-clock cancellation and output copy-back.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transfer_engine::{FetchLayer, Prober, StoreRouter, join_url};
use url::Url;

use vod_types::{EncodedProfile, JobHooks, OutputDescriptor};

use crate::cloud::api::{
    ACCELERATION_ERROR_CODES, AccelerationSettings, CloudApi, CloudApiError, CloudJobStatus,
    CreateJobRequest, OutputGroup, OutputGroupKind,
};
use crate::cloud::output::copy_outputs;
use crate::config::CloudConfig;
use crate::error::PipelineError;

/// One job handed to the cloud backend.
#[derive(Debug, Clone)]
pub struct CloudRequest {
    pub request_id: String,
    pub input_url: Url,
    pub hls_output: Option<Url>,
    pub mp4_output: Option<Url>,
    pub profiles: Vec<EncodedProfile>,
}

pub struct CloudTranscoder {
    api: Arc<dyn CloudApi>,
    fetch: Arc<FetchLayer>,
    stores: Arc<StoreRouter>,
    prober: Arc<dyn Prober>,
    client: reqwest::Client,
    config: CloudConfig,
}

impl CloudTranscoder {
    pub fn new(
        api: Arc<dyn CloudApi>,
        fetch: Arc<FetchLayer>,
        stores: Arc<StoreRouter>,
        prober: Arc<dyn Prober>,
        client: reqwest::Client,
        config: CloudConfig,
    ) -> Self {
        Self {
            api,
            fetch,
            stores,
            prober,
            client,
            config,
        }
    }

    /// Run one job on the provider. Returns `AccelerationIncompatible` when
    /// the provider rejects the input in accelerated mode; the router owns
    /// the single retry without acceleration.
    pub async fn transcode(
        &self,
        request: &CloudRequest,
        accelerated: bool,
        hooks: &JobHooks,
        token: &CancellationToken,
    ) -> Result<Vec<OutputDescriptor>, PipelineError> {
        let provider_prefix = join_url(
            &self.config.transfer_bucket,
            &format!("output/{}", request.request_id),
        )?;

        let create = self.build_request(request, accelerated, &provider_prefix)?;
        let job = self
            .api
            .create_job(&create)
            .await
            .map_err(map_submit_error)?;
        info!(
            request_id = %request.request_id,
            job_id = %job.id,
            accelerated,
            "Submitted cloud transcode job"
        );

        self.poll_until_complete(&job.id, request, hooks, token).await?;

        copy_outputs(
            self.fetch.clone(),
            self.stores.clone(),
            self.prober.clone(),
            self.client.clone(),
            &provider_prefix,
            request,
            self.config.copy_workers,
            token,
        )
        .await
    }

    fn build_request(
        &self,
        request: &CloudRequest,
        accelerated: bool,
        provider_prefix: &Url,
    ) -> Result<CreateJobRequest, PipelineError> {
        let mut output_groups = Vec::new();
        if request.hls_output.is_some() {
            output_groups.push(OutputGroup {
                kind: OutputGroupKind::Hls,
                destination: join_url(provider_prefix, "hls/index.m3u8")?.to_string(),
            });
        }
        if request.mp4_output.is_some() {
            output_groups.push(OutputGroup {
                kind: OutputGroupKind::Mp4,
                destination: join_url(provider_prefix, "mp4")?.to_string(),
            });
        }
        if output_groups.is_empty() {
            return Err(PipelineError::cloud("job has no output destinations"));
        }

        Ok(CreateJobRequest {
            request_id: request.request_id.clone(),
            input: request.input_url.to_string(),
            acceleration_settings: accelerated.then(AccelerationSettings::preferred),
            output_groups,
            profiles: request.profiles.clone(),
        })
    }

    async fn poll_until_complete(
        &self,
        job_id: &str,
        request: &CloudRequest,
        hooks: &JobHooks,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let mut interval = self.config.poll_interval;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
            interval = self.config.poll_interval;

            if started.elapsed() > self.config.max_job_duration {
                warn!(request_id = %request.request_id, job_id, "Cloud job exceeded wall-clock budget, cancelling");
                if let Err(e) = self.api.cancel_job(job_id).await {
                    warn!(job_id, error = %e, "Cancel request failed");
                }
                return Err(PipelineError::Timeout {
                    reason: format!(
                        "cloud job {job_id} exceeded {:?}",
                        self.config.max_job_duration
                    ),
                });
            }

            let job = match self.api.get_job(job_id).await {
                Ok(job) => job,
                Err(CloudApiError::RateLimited) => {
                    debug!(job_id, "Provider rate limited polling, backing off");
                    interval = self.config.rate_limited_poll_interval;
                    continue;
                }
                Err(CloudApiError::Network { source }) => {
                    // Transient poll failures must not kill a running job.
                    warn!(job_id, error = %source, "Poll failed, will retry");
                    continue;
                }
                Err(err) => return Err(PipelineError::cloud(err.to_string())),
            };

            match job.status {
                CloudJobStatus::Submitted | CloudJobStatus::Progressing => {
                    // A missing percent is not progress zero; report nothing.
                    if let Some(percent) = job.percent_complete {
                        (hooks.report_progress)(f64::from(percent) / 100.0);
                    }
                }
                CloudJobStatus::Complete => {
                    (hooks.report_progress)(1.0);
                    return Ok(());
                }
                CloudJobStatus::Error => {
                    if let Some(code) = job.error_code
                        && ACCELERATION_ERROR_CODES.contains(&code)
                    {
                        return Err(PipelineError::AccelerationIncompatible);
                    }
                    return Err(PipelineError::cloud(
                        job.error_message
                            .unwrap_or_else(|| "provider reported an unspecified error".to_string()),
                    ));
                }
                CloudJobStatus::Canceled => return Err(PipelineError::CloudJobCanceled),
            }
        }
    }
}

fn map_submit_error(err: CloudApiError) -> PipelineError {
    PipelineError::cloud(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::api::{CloudJob, MockCloudApi};
    use std::sync::Mutex;
    use std::time::Duration;
    use transfer_engine::{GatewayConfig, GatewayPool, TransferError};
    use vod_types::InputVideo;

    struct NoProbe;

    #[async_trait::async_trait]
    impl Prober for NoProbe {
        async fn probe(&self, _access_url: &Url) -> Result<InputVideo, TransferError> {
            Err(TransferError::Probe {
                reason: "not probed in tests".to_string(),
            })
        }
    }

    fn transcoder(api: MockCloudApi) -> (CloudTranscoder, Arc<StoreRouter>) {
        let client = reqwest::Client::new();
        let stores = Arc::new(StoreRouter::new());
        let fetch = Arc::new(FetchLayer::new(
            client.clone(),
            Arc::new(GatewayPool::new(GatewayConfig::default(), client.clone())),
            stores.clone(),
        ));
        let mut config = CloudConfig::new(Url::parse("memory://managed/prefix").unwrap());
        config.poll_interval = Duration::from_millis(5);
        config.rate_limited_poll_interval = Duration::from_millis(10);
        let transcoder = CloudTranscoder::new(
            Arc::new(api),
            fetch,
            stores.clone(),
            Arc::new(NoProbe),
            client,
            config,
        );
        (transcoder, stores)
    }

    fn request() -> CloudRequest {
        CloudRequest {
            request_id: "req-1".to_string(),
            input_url: Url::parse("https://signed.example/in.mp4").unwrap(),
            hls_output: Some(Url::parse("memory://user/out/hls").unwrap()),
            mp4_output: None,
            profiles: vec![EncodedProfile::new("360p0", 640, 360, 900_000)],
        }
    }

    fn job(status: CloudJobStatus) -> CloudJob {
        CloudJob {
            id: "job-1".to_string(),
            status,
            percent_complete: None,
            error_code: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn reports_progress_then_completes() {
        let mut api = MockCloudApi::new();
        api.expect_create_job()
            .times(1)
            .returning(|_| Ok(job(CloudJobStatus::Submitted)));
        let mut polls = 0;
        api.expect_get_job().returning(move |_| {
            polls += 1;
            Ok(match polls {
                1 => CloudJob {
                    percent_complete: Some(40),
                    ..job(CloudJobStatus::Progressing)
                },
                _ => job(CloudJobStatus::Complete),
            })
        });

        let (transcoder, _stores) = transcoder(api);
        let ratios = Arc::new(Mutex::new(Vec::new()));
        let ratios_clone = ratios.clone();
        let mut hooks = JobHooks::noop();
        hooks.report_progress = Arc::new(move |r| ratios_clone.lock().unwrap().push(r));

        let outputs = transcoder
            .transcode(&request(), true, &hooks, &CancellationToken::new())
            .await
            .unwrap();

        let ratios = ratios.lock().unwrap();
        assert_eq!(*ratios, vec![0.4, 1.0]);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, "hls");
    }

    #[tokio::test]
    async fn acceleration_error_codes_become_sentinel() {
        let mut api = MockCloudApi::new();
        api.expect_create_job()
            .times(1)
            .returning(|_| Ok(job(CloudJobStatus::Submitted)));
        api.expect_get_job().returning(|_| {
            Ok(CloudJob {
                error_code: Some(1550),
                error_message: Some("acceleration fault".to_string()),
                ..job(CloudJobStatus::Error)
            })
        });

        let (transcoder, _stores) = transcoder(api);
        let err = transcoder
            .transcode(&request(), true, &JobHooks::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AccelerationIncompatible));
    }

    #[tokio::test]
    async fn provider_error_carries_message() {
        let mut api = MockCloudApi::new();
        api.expect_create_job()
            .times(1)
            .returning(|_| Ok(job(CloudJobStatus::Submitted)));
        api.expect_get_job().returning(|_| {
            Ok(CloudJob {
                error_code: Some(9999),
                error_message: Some("input unreadable".to_string()),
                ..job(CloudJobStatus::Error)
            })
        });

        let (transcoder, _stores) = transcoder(api);
        let err = transcoder
            .transcode(&request(), true, &JobHooks::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("input unreadable"));
    }

    #[tokio::test]
    async fn canceled_job_is_an_error() {
        let mut api = MockCloudApi::new();
        api.expect_create_job()
            .times(1)
            .returning(|_| Ok(job(CloudJobStatus::Submitted)));
        api.expect_get_job()
            .returning(|_| Ok(job(CloudJobStatus::Canceled)));

        let (transcoder, _stores) = transcoder(api);
        let err = transcoder
            .transcode(&request(), true, &JobHooks::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CloudJobCanceled));
    }

    #[tokio::test]
    async fn wall_clock_budget_cancels_on_provider() {
        let mut api = MockCloudApi::new();
        api.expect_create_job()
            .times(1)
            .returning(|_| Ok(job(CloudJobStatus::Submitted)));
        api.expect_get_job()
            .returning(|_| Ok(job(CloudJobStatus::Progressing)));
        api.expect_cancel_job().times(1).returning(|_| Ok(()));

        let client = reqwest::Client::new();
        let stores = Arc::new(StoreRouter::new());
        let fetch = Arc::new(FetchLayer::new(
            client.clone(),
            Arc::new(GatewayPool::new(GatewayConfig::default(), client.clone())),
            stores.clone(),
        ));
        let mut config = CloudConfig::new(Url::parse("memory://managed/prefix").unwrap());
        config.poll_interval = Duration::from_millis(5);
        config.max_job_duration = Duration::from_millis(20);
        let transcoder = CloudTranscoder::new(
            Arc::new(api),
            fetch,
            stores,
            Arc::new(NoProbe),
            client,
            config,
        );

        let err = transcoder
            .transcode(&request(), true, &JobHooks::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
    }
}
