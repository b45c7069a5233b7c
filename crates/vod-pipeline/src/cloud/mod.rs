// Cloud transcoding backend.

mod api;
mod driver;
mod output;

pub use api::{
    ACCELERATION_ERROR_CODES, ACCELERATION_PREFERRED, AccelerationSettings, CloudApi,
    CloudApiError, CloudJob, CloudJobStatus, CreateJobRequest, HttpCloudApi, OutputGroup,
    OutputGroupKind,
};
pub use driver::{CloudRequest, CloudTranscoder};

#[cfg(test)]
pub use api::MockCloudApi;
