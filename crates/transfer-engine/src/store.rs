// Object-store URL resolution and transfer helpers.
//
// The pipeline addresses working and output locations by URL (`s3`,
// `s3+http(s)`, `gs`, `file`, `memory`). This module resolves such URLs to
// `object_store` instances, caching them per authority so repeated calls
// against the same bucket (or the same in-memory test store) share one
// instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::counter::ByteStream;
use crate::error::TransferError;

const STORE_SCHEMES: &[&str] = &["s3", "s3+http", "s3+https", "gs", "file", "memory"];

/// Whether the transfer engine treats this URL as an object-store location.
pub fn is_store_url(url: &Url) -> bool {
    STORE_SCHEMES.contains(&url.scheme())
}

/// A resolved object-store location.
pub struct StoreHandle {
    pub store: Arc<dyn ObjectStore>,
    pub path: StorePath,
    signer: Option<Arc<dyn Signer>>,
    public_url: Option<Url>,
}

/// Resolves store URLs and caches the underlying store clients.
#[derive(Default)]
pub struct StoreRouter {
    cache: Mutex<HashMap<String, (Arc<dyn ObjectStore>, Option<Arc<dyn Signer>>)>>,
}

impl StoreRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, url: &Url) -> Result<StoreHandle, TransferError> {
        match url.scheme() {
            "s3" => self.resolve_s3(url, None, false),
            "s3+http" => self.resolve_s3(url, Some(endpoint_of(url, "http")?), true),
            "s3+https" => self.resolve_s3(url, Some(endpoint_of(url, "https")?), false),
            "gs" => self.resolve_gcs(url),
            "file" => self.resolve_file(url),
            "memory" => self.resolve_memory(url),
            other => Err(TransferError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    fn cached(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<(Arc<dyn ObjectStore>, Option<Arc<dyn Signer>>), TransferError>,
    ) -> Result<(Arc<dyn ObjectStore>, Option<Arc<dyn Signer>>), TransferError> {
        if let Some(entry) = self.cache.lock().get(key) {
            return Ok(entry.clone());
        }
        let built = build()?;
        self.cache
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| built.clone());
        Ok(built)
    }

    fn resolve_s3(
        &self,
        url: &Url,
        endpoint: Option<String>,
        allow_http: bool,
    ) -> Result<StoreHandle, TransferError> {
        let host = url
            .host_str()
            .ok_or_else(|| TransferError::invalid_url(url.as_str(), "missing host"))?;

        // With an explicit endpoint the bucket is the first path segment;
        // plain `s3://` URLs put the bucket in the host.
        let (bucket, key) = if endpoint.is_some() {
            let mut segments = url.path().trim_start_matches('/').splitn(2, '/');
            let bucket = segments
                .next()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| TransferError::invalid_url(url.as_str(), "missing bucket"))?;
            (bucket.to_string(), segments.next().unwrap_or("").to_string())
        } else {
            (host.to_string(), url.path().trim_start_matches('/').to_string())
        };

        let cache_key = format!(
            "s3|{}|{}|{}|{}",
            endpoint.as_deref().unwrap_or("aws"),
            bucket,
            url.username(),
            url.password().unwrap_or_default()
        );
        let (store, signer) = self.cached(&cache_key, || {
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket.clone())
                .with_allow_http(allow_http);
            if let Some(endpoint) = &endpoint {
                builder = builder
                    .with_endpoint(endpoint.clone())
                    .with_virtual_hosted_style_request(false);
            }
            if std::env::var("AWS_REGION").is_err() && std::env::var("AWS_DEFAULT_REGION").is_err()
            {
                builder = builder.with_region("us-east-1");
            }
            if !url.username().is_empty() {
                builder = builder.with_access_key_id(decode_userinfo(url.username()));
            }
            if let Some(password) = url.password() {
                builder = builder.with_secret_access_key(decode_userinfo(password));
            }
            let s3 = Arc::new(builder.build()?);
            Ok((
                s3.clone() as Arc<dyn ObjectStore>,
                Some(s3 as Arc<dyn Signer>),
            ))
        })?;

        let public_url = match &endpoint {
            Some(endpoint) => Url::parse(&format!("{endpoint}/{bucket}/{key}")).ok(),
            None => Url::parse(&format!("https://{bucket}.s3.amazonaws.com/{key}")).ok(),
        };

        Ok(StoreHandle {
            store,
            path: store_path(&key, url)?,
            signer,
            public_url,
        })
    }

    fn resolve_gcs(&self, url: &Url) -> Result<StoreHandle, TransferError> {
        let bucket = url
            .host_str()
            .ok_or_else(|| TransferError::invalid_url(url.as_str(), "missing bucket"))?
            .to_string();
        let key = url.path().trim_start_matches('/').to_string();
        let cache_key = format!("gs|{bucket}");
        let (store, signer) = self.cached(&cache_key, || {
            let gcs = Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket.clone())
                    .build()?,
            );
            Ok((gcs as Arc<dyn ObjectStore>, None))
        })?;
        let public_url = Url::parse(&format!("https://storage.googleapis.com/{bucket}/{key}")).ok();
        Ok(StoreHandle {
            store,
            path: store_path(&key, url)?,
            signer,
            public_url,
        })
    }

    fn resolve_file(&self, url: &Url) -> Result<StoreHandle, TransferError> {
        let (store, signer) = self.cached("file", || {
            Ok((
                Arc::new(LocalFileSystem::new()) as Arc<dyn ObjectStore>,
                None,
            ))
        })?;
        Ok(StoreHandle {
            store,
            path: store_path(url.path().trim_start_matches('/'), url)?,
            signer,
            public_url: None,
        })
    }

    fn resolve_memory(&self, url: &Url) -> Result<StoreHandle, TransferError> {
        let authority = url.host_str().unwrap_or_default();
        let cache_key = format!("memory|{authority}");
        let (store, signer) = self.cached(&cache_key, || {
            Ok((Arc::new(InMemory::new()) as Arc<dyn ObjectStore>, None))
        })?;
        Ok(StoreHandle {
            store,
            path: store_path(url.path().trim_start_matches('/'), url)?,
            signer,
            public_url: None,
        })
    }

    /// Stream `data` into the location `url` names. Returns bytes written.
    pub async fn put_stream(&self, url: &Url, mut data: ByteStream) -> Result<u64, TransferError> {
        let handle = self.resolve(url)?;
        let upload = handle.store.put_multipart(&handle.path).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut written: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            writer.write(&chunk);
        }
        writer.finish().await?;
        debug!(url = %url, bytes = written, "Uploaded object");
        Ok(written)
    }

    pub async fn put_bytes(&self, url: &Url, data: Bytes) -> Result<u64, TransferError> {
        let handle = self.resolve(url)?;
        let len = data.len() as u64;
        handle.store.put(&handle.path, PutPayload::from(data)).await?;
        Ok(len)
    }

    /// Open the object `url` names as a byte stream.
    pub async fn get_stream(&self, url: &Url) -> Result<ByteStream, TransferError> {
        let handle = self.resolve(url)?;
        let result = handle.store.get(&handle.path).await?;
        Ok(Box::pin(result.into_stream().map_err(TransferError::from)))
    }

    pub async fn get_bytes(&self, url: &Url) -> Result<Bytes, TransferError> {
        let handle = self.resolve(url)?;
        let result = handle.store.get(&handle.path).await?;
        Ok(result.bytes().await?)
    }

    /// List object keys under the prefix `url` names, relative to the prefix.
    pub async fn list_suffixes(&self, url: &Url) -> Result<Vec<String>, TransferError> {
        let handle = self.resolve(url)?;
        let prefix = handle.path.clone();
        let mut entries = handle.store.list(Some(&prefix));
        let mut suffixes = Vec::new();
        while let Some(meta) = entries.try_next().await? {
            let full = meta.location.as_ref();
            let suffix = full
                .strip_prefix(prefix.as_ref())
                .map(|s| s.trim_start_matches('/'))
                .unwrap_or(full);
            suffixes.push(suffix.to_string());
        }
        Ok(suffixes)
    }

    /// Access URL policy: `http(s)`/`file` URLs pass through untouched; store
    /// URLs prefer their public HTTPS form when a HEAD of it succeeds, and
    /// fall back to a presigned GET (24 h unless overridden).
    pub async fn signed_access_url(
        &self,
        client: &reqwest::Client,
        url: &Url,
        ttl: Duration,
    ) -> Result<Url, TransferError> {
        if matches!(url.scheme(), "http" | "https" | "file") {
            return Ok(url.clone());
        }
        let handle = self.resolve(url)?;

        if let Some(public) = &handle.public_url {
            match client.head(public.clone()).send().await {
                Ok(response)
                    if response.status().is_success() || response.status().is_redirection() =>
                {
                    debug!(url = %public, "Public URL is reachable, skipping presign");
                    return Ok(public.clone());
                }
                _ => {}
            }
        }

        match &handle.signer {
            Some(signer) => {
                let signed = signer
                    .signed_url(http::Method::GET, &handle.path, ttl)
                    .await?;
                Ok(signed)
            }
            None => Ok(handle.public_url.clone().unwrap_or_else(|| url.clone())),
        }
    }
}

fn endpoint_of(url: &Url, scheme: &str) -> Result<String, TransferError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransferError::invalid_url(url.as_str(), "missing endpoint host"))?;
    Ok(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

fn store_path(key: &str, url: &Url) -> Result<StorePath, TransferError> {
    StorePath::from_url_path(key)
        .map_err(|e| TransferError::invalid_url(url.as_str(), e.to_string()))
}

// Userinfo in store URLs is percent-encoded; credentials must be decoded
// before they are handed to the store client.
fn decode_userinfo(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn store_url_detection() {
        assert!(is_store_url(&url("s3://bucket/key")));
        assert!(is_store_url(&url("s3+https://host:9000/bucket/key")));
        assert!(is_store_url(&url("gs://bucket/key")));
        assert!(is_store_url(&url("memory://test/key")));
        assert!(!is_store_url(&url("https://host/key")));
        assert!(!is_store_url(&url("ipfs://cid")));
    }

    #[test]
    fn memory_store_is_shared_per_authority() {
        let router = StoreRouter::new();
        let a1 = router.resolve(&url("memory://bucket-a/x")).unwrap();
        let a2 = router.resolve(&url("memory://bucket-a/y")).unwrap();
        let b = router.resolve(&url("memory://bucket-b/x")).unwrap();
        assert!(Arc::ptr_eq(&a1.store, &a2.store));
        assert!(!Arc::ptr_eq(&a1.store, &b.store));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let router = StoreRouter::new();
        let location = url("memory://rt/work/req/file.bin");
        let payload = Bytes::from_static(b"0123456789");
        let written = router.put_bytes(&location, payload.clone()).await.unwrap();
        assert_eq!(written, 10);
        let back = router.get_bytes(&location).await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn put_stream_counts_bytes_written() {
        let router = StoreRouter::new();
        let location = url("memory://stream/out.ts");
        let chunks: Vec<Result<Bytes, TransferError>> = vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"efgh")),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let written = router.put_stream(&location, stream).await.unwrap();
        assert_eq!(written, 8);
        let back = router.get_bytes(&location).await.unwrap();
        assert_eq!(back.as_ref(), b"abcdefgh");
    }

    #[tokio::test]
    async fn list_suffixes_strips_prefix() {
        let router = StoreRouter::new();
        router
            .put_bytes(&url("memory://list/out/a/0.ts"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        router
            .put_bytes(&url("memory://list/out/b/1.ts"), Bytes::from_static(b"y"))
            .await
            .unwrap();
        let mut suffixes = router.list_suffixes(&url("memory://list/out")).await.unwrap();
        suffixes.sort();
        assert_eq!(suffixes, vec!["a/0.ts".to_string(), "b/1.ts".to_string()]);
    }

    #[test]
    fn userinfo_is_percent_decoded() {
        assert_eq!(decode_userinfo("abc%2Fdef"), "abc/def");
        assert_eq!(decode_userinfo("plain"), "plain");
    }
}
