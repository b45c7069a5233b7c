// Rendition playlist loading with fixed-interval retries.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use m3u8_rs::{MediaPlaylist, Playlist};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transfer_engine::{FetchLayer, RetryAction, RetryPolicy, TransferError, retry_with_backoff};
use url::Url;

use crate::error::ManifestError;

pub struct PlaylistLoader {
    fetch: Arc<FetchLayer>,
    retry: RetryPolicy,
}

impl PlaylistLoader {
    pub fn new(fetch: Arc<FetchLayer>) -> Self {
        Self {
            fetch,
            retry: RetryPolicy::fixed(10, Duration::from_secs(5)),
        }
    }

    /// Download and parse a media playlist. Master playlists are rejected;
    /// transfer failures retry on a fixed 5-second interval.
    pub async fn load(
        &self,
        url: &Url,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<MediaPlaylist, ManifestError> {
        let playlist = retry_with_backoff(&self.retry, token, |attempt| async move {
            debug!(request_id, url = %url, attempt, "Loading playlist");
            let bytes = match self.read_all(url, request_id, token).await {
                Ok(bytes) => bytes,
                Err(err) => return RetryAction::from_error(err),
            };
            match m3u8_rs::parse_playlist_res(&bytes) {
                Ok(Playlist::MediaPlaylist(playlist)) => RetryAction::Success(Ok(playlist)),
                Ok(Playlist::MasterPlaylist(_)) => {
                    // Not a transfer problem; retrying cannot change the answer.
                    RetryAction::Success(Err(ManifestError::MasterRejected {
                        url: url.to_string(),
                    }))
                }
                Err(e) => RetryAction::Retry(TransferError::Playlist {
                    reason: format!("failed to parse {url}: {e}"),
                }),
            }
        })
        .await??;
        Ok(playlist)
    }

    async fn read_all(
        &self,
        url: &Url,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let (mut stream, _counter) = self.fetch.open(url, request_id, token).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use transfer_engine::{GatewayConfig, GatewayPool, StoreRouter};

    fn loader_with_store() -> (PlaylistLoader, Arc<StoreRouter>) {
        let client = reqwest::Client::new();
        let stores = Arc::new(StoreRouter::new());
        let fetch = Arc::new(FetchLayer::new(
            client.clone(),
            Arc::new(GatewayPool::new(GatewayConfig::default(), client)),
            stores.clone(),
        ));
        (PlaylistLoader::new(fetch), stores)
    }

    #[tokio::test]
    async fn loads_media_playlist() {
        let (loader, stores) = loader_with_store();
        let url = Url::parse("memory://load/stream/index.m3u8").unwrap();
        let body = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
                    #EXTINF:9.5,\n0.ts\n#EXT-X-ENDLIST\n";
        stores
            .put_bytes(&url, Bytes::from(body.as_bytes().to_vec()))
            .await
            .unwrap();
        let playlist = loader
            .load(&url, "req-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(playlist.segments.len(), 1);
        assert!(playlist.end_list);
    }

    #[tokio::test]
    async fn rejects_master_playlist() {
        let (loader, stores) = loader_with_store();
        let url = Url::parse("memory://load2/stream/master.m3u8").unwrap();
        let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
                    360p/index.m3u8\n";
        stores
            .put_bytes(&url, Bytes::from(body.as_bytes().to_vec()))
            .await
            .unwrap();
        let err = loader
            .load(&url, "req-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::MasterRejected { .. }));
    }
}
