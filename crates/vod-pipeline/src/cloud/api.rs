// Wire types and client for the cloud transcoding provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use vod_types::EncodedProfile;

pub const ACCELERATION_PREFERRED: &str = "PREFERRED";

/// Provider error codes that mean the input cannot be transcoded in
/// accelerated mode.
pub const ACCELERATION_ERROR_CODES: [u32; 4] = [1041, 1042, 1043, 1550];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccelerationSettings {
    pub mode: String,
}

impl AccelerationSettings {
    pub fn preferred() -> Self {
        Self {
            mode: ACCELERATION_PREFERRED.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputGroupKind {
    Hls,
    Mp4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputGroup {
    #[serde(rename = "type")]
    pub kind: OutputGroupKind,
    /// Destination inside the provider-managed bucket.
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub request_id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceleration_settings: Option<AccelerationSettings>,
    pub output_groups: Vec<OutputGroup>,
    pub profiles: Vec<EncodedProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloudJobStatus {
    Submitted,
    Progressing,
    Complete,
    Error,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudJob {
    pub id: String,
    pub status: CloudJobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CloudApiError {
    #[error("provider rate limited the request")]
    RateLimited,

    #[error("provider returned HTTP {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("provider request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },
}

/// Control-plane surface of the cloud transcoding provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create_job(&self, request: &CreateJobRequest) -> Result<CloudJob, CloudApiError>;
    async fn get_job(&self, id: &str) -> Result<CloudJob, CloudApiError>;
    async fn cancel_job(&self, id: &str) -> Result<(), CloudApiError>;
}

/// JSON-over-HTTP driver for the provider API.
pub struct HttpCloudApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpCloudApi {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    fn endpoint(&self, path: &str) -> Result<Url, CloudApiError> {
        self.base.join(path).map_err(|_| CloudApiError::Http {
            status: reqwest::StatusCode::BAD_REQUEST,
            body: format!("invalid endpoint path {path}"),
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudApiError> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CloudApiError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudApiError::Http { status, body });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn create_job(&self, request: &CreateJobRequest) -> Result<CloudJob, CloudApiError> {
        let response = self
            .client
            .post(self.endpoint("jobs")?)
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn get_job(&self, id: &str) -> Result<CloudJob, CloudApiError> {
        let response = self.client.get(self.endpoint(&format!("jobs/{id}"))?).send().await?;
        Self::decode(response).await
    }

    async fn cancel_job(&self, id: &str) -> Result<(), CloudApiError> {
        let response = self
            .client
            .post(self.endpoint(&format!("jobs/{id}/cancel"))?)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CloudApiError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudApiError::Http { status, body });
        }
        Ok(())
    }
}
