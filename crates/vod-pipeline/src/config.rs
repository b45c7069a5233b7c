use std::time::Duration;

use url::Url;

/// Numeric policy for the in-house segment dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Remote transcoder base URL.
    pub transcoder_url: Url,
    /// Segments in flight per job.
    pub concurrency: usize,
    /// Deadline for one segment POST, response included.
    pub segment_timeout: Duration,
}

impl DispatchConfig {
    pub fn new(transcoder_url: Url) -> Self {
        Self {
            transcoder_url,
            concurrency: 10,
            segment_timeout: Duration::from_secs(3 * 60),
        }
    }
}

/// Numeric policy for the cloud transcoding driver.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Writable prefix inside the provider-managed bucket.
    pub transfer_bucket: Url,
    /// Poll cadence while the job runs.
    pub poll_interval: Duration,
    /// Poll cadence after the provider rate-limits us.
    pub rate_limited_poll_interval: Duration,
    /// Total wall-clock budget before the job is cancelled on the provider.
    pub max_job_duration: Duration,
    /// Parallel workers for the output copy-back phase.
    pub copy_workers: usize,
}

impl CloudConfig {
    pub fn new(transfer_bucket: Url) -> Self {
        Self {
            transfer_bucket,
            poll_interval: Duration::from_secs(10),
            rate_limited_poll_interval: Duration::from_secs(15),
            max_job_duration: Duration::from_secs(60 * 60),
            copy_workers: 10,
        }
    }
}

/// Policy for backend selection and default profile derivation.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Inputs longer than this go straight to the cloud backend.
    pub max_in_house_duration: Duration,
    /// Bitrate floor for the synthesized half-bitrate profile.
    pub bitrate_floor: u32,
    /// Absolute floor applied when the source itself sits below the normal
    /// floor.
    pub absolute_bitrate_floor: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_in_house_duration: Duration::from_secs(2 * 60 * 60),
            bitrate_floor: 100_000,
            absolute_bitrate_floor: 5_000,
        }
    }
}
