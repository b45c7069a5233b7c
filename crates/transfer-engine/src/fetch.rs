// Scheme-routed, retrying reader over every input source the pipeline
// accepts: plain HTTP(S), object-store locations and content-addressed
// networks behind the gateway pool.

use std::sync::Arc;

use futures::TryStreamExt;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::counter::{ByteCounter, ByteStream, counted};
use crate::decrypt::SegmentDecryptor;
use crate::error::TransferError;
use crate::gateway::{GatewayPool, GatewayScheme};
use crate::retry::{RetryAction, RetryPolicy, is_retryable_reqwest_error, retry_with_backoff};
use crate::store::{StoreRouter, is_store_url};
use crate::urlmap::join_url;

/// Result of one completed copy.
#[derive(Debug, Clone)]
pub struct CopiedFile {
    pub destination: Url,
    /// Bytes read from the source, before any decryption.
    pub bytes_read: u64,
    /// Bytes written to the destination store.
    pub bytes_written: u64,
}

pub struct FetchLayer {
    client: reqwest::Client,
    gateways: Arc<GatewayPool>,
    stores: Arc<StoreRouter>,
    http_retry: RetryPolicy,
}

impl FetchLayer {
    pub fn new(
        client: reqwest::Client,
        gateways: Arc<GatewayPool>,
        stores: Arc<StoreRouter>,
    ) -> Self {
        Self {
            client,
            gateways,
            stores,
            http_retry: RetryPolicy::http_open(),
        }
    }

    pub fn stores(&self) -> &Arc<StoreRouter> {
        &self.stores
    }

    /// Open any supported input URL as a byte stream.
    ///
    /// The returned counter observes every chunk that passes through, so the
    /// caller can read the transferred total after draining the stream.
    pub async fn open(
        &self,
        url: &Url,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<(ByteStream, ByteCounter), TransferError> {
        let stream = if is_store_url(url) {
            self.stores.get_stream(url).await?
        } else if GatewayScheme::from_url(url).is_some() {
            self.gateways.fetch(url, request_id).await?
        } else if matches!(url.scheme(), "http" | "https") {
            self.http_open(url, request_id, token).await?
        } else {
            return Err(TransferError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
            });
        };

        let counter = ByteCounter::new();
        Ok((counted(stream, counter.clone()), counter))
    }

    /// HTTP GET with retry. Server errors retry with backoff; 3xx/4xx are
    /// classified unretriable and a 404 becomes `NotFound`.
    async fn http_open(
        &self,
        url: &Url,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransferError> {
        retry_with_backoff(&self.http_retry, token, |attempt| async move {
            debug!(request_id, url = %url, attempt, "Opening HTTP source");
            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let stream = response.bytes_stream().map_err(TransferError::from);
                        RetryAction::Success(Box::pin(stream) as ByteStream)
                    } else if status == StatusCode::NOT_FOUND {
                        RetryAction::Fail(TransferError::not_found(url.as_str()))
                    } else if status.is_server_error() {
                        RetryAction::Retry(TransferError::http_status(status, url.as_str()))
                    } else {
                        RetryAction::Fail(TransferError::http_status(status, url.as_str()))
                    }
                }
                Err(err) => {
                    if is_retryable_reqwest_error(&err) {
                        RetryAction::Retry(TransferError::from(err))
                    } else {
                        RetryAction::Fail(TransferError::from(err))
                    }
                }
            }
        })
        .await
    }

    /// Copy one source object under `dst_base` as `filename`.
    pub async fn copy_file(
        &self,
        src: &Url,
        dst_base: &Url,
        filename: &str,
        request_id: &str,
        decryptor: Option<Arc<SegmentDecryptor>>,
        token: &CancellationToken,
    ) -> Result<CopiedFile, TransferError> {
        let destination = join_url(dst_base, filename)?;
        self.copy_to(src, &destination, request_id, decryptor, token)
            .await
    }

    /// Copy a source object to an exact destination URL, retrying the whole
    /// transfer on retryable failure.
    pub async fn copy_to(
        &self,
        src: &Url,
        destination: &Url,
        request_id: &str,
        decryptor: Option<Arc<SegmentDecryptor>>,
        token: &CancellationToken,
    ) -> Result<CopiedFile, TransferError> {
        let policy = RetryPolicy::whole_copy();
        retry_with_backoff(&policy, token, |attempt| {
            let decryptor = decryptor.clone();
            async move {
                if attempt > 0 {
                    warn!(request_id, src = %src, attempt, "Retrying copy");
                }
                match self
                    .copy_once(src, destination, request_id, decryptor, token)
                    .await
                {
                    Ok(copied) => RetryAction::Success(copied),
                    Err(err) => RetryAction::from_error(err),
                }
            }
        })
        .await
    }

    async fn copy_once(
        &self,
        src: &Url,
        destination: &Url,
        request_id: &str,
        decryptor: Option<Arc<SegmentDecryptor>>,
        token: &CancellationToken,
    ) -> Result<CopiedFile, TransferError> {
        let (stream, counter) = self.open(src, request_id, token).await?;
        let stream = match decryptor {
            Some(decryptor) => decryptor.decrypting_stream(stream),
            None => stream,
        };
        let bytes_written = self.stores.put_stream(destination, stream).await?;
        let copied = CopiedFile {
            destination: destination.clone(),
            bytes_read: counter.total(),
            bytes_written,
        };
        debug!(
            request_id,
            src = %src,
            dst = %copied.destination,
            read = copied.bytes_read,
            written = copied.bytes_written,
            "Copied input object"
        );
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use bytes::Bytes;

    fn layer() -> FetchLayer {
        let client = reqwest::Client::new();
        FetchLayer::new(
            client.clone(),
            Arc::new(GatewayPool::new(GatewayConfig::default(), client)),
            Arc::new(StoreRouter::new()),
        )
    }

    #[tokio::test]
    async fn copy_preserves_byte_count() {
        let layer = layer();
        let token = CancellationToken::new();
        let src = Url::parse("memory://fetch/src/video.mp4").unwrap();
        let payload = Bytes::from(vec![7u8; 4096]);
        layer.stores.put_bytes(&src, payload.clone()).await.unwrap();

        let dst_base = Url::parse("memory://fetch/work/req-1").unwrap();
        let copied = layer
            .copy_file(&src, &dst_base, "video.mp4", "req-1", None, &token)
            .await
            .unwrap();

        assert_eq!(copied.bytes_read, 4096);
        assert_eq!(copied.bytes_written, 4096);
        assert_eq!(
            copied.destination.as_str(),
            "memory://fetch/work/req-1/video.mp4"
        );
        let back = layer.stores.get_bytes(&copied.destination).await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let layer = layer();
        let token = CancellationToken::new();
        let url = Url::parse("ftp://host/file").unwrap();
        let err = match layer.open(&url, "req-1", &token).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, TransferError::UnsupportedScheme { .. }));
    }

    #[tokio::test]
    async fn store_miss_maps_to_not_found() {
        let layer = layer();
        let token = CancellationToken::new();
        let url = Url::parse("memory://fetch/missing.bin").unwrap();
        let err = match layer.open(&url, "req-1", &token).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.is_not_found());
    }
}
