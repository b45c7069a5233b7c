// Round-robin, failure-aware client for content-addressed gateways.
//
// Two gateway families are recognised: content-hash networks (ipfs) and
// permanent-storage networks (ar). A single cursor is shared by all calls and
// advances exactly once per call, so consecutive jobs naturally start from
// different gateways even when every gateway is healthy.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::TryStreamExt;
use tracing::{debug, warn};
use url::Url;

use crate::counter::ByteStream;
use crate::error::TransferError;

/// Family of content-addressed network a URL belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayScheme {
    ContentHash,
    PermanentStorage,
}

impl GatewayScheme {
    /// Classify a URL, either by scheme or by the hosted-gateway heuristics:
    /// `arweave.net` hosts, `w3s.link` hosts, and `/ipfs/` paths.
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.scheme() {
            "ipfs" => return Some(Self::ContentHash),
            "ar" => return Some(Self::PermanentStorage),
            _ => {}
        }
        let host = url.host_str().unwrap_or_default();
        if host == "arweave.net" {
            return Some(Self::PermanentStorage);
        }
        if host.contains("w3s.link") || url.path().contains("/ipfs/") {
            return Some(Self::ContentHash);
        }
        None
    }
}

/// Extract the network resource id a gateway resolves.
///
/// Content-hash URLs keep host and path (`ipfs://<cid>/file` → `<cid>/file`);
/// permanent-storage URLs are identified by host alone (`ar://<id>` → `<id>`).
/// Hosted-gateway forms are unwrapped back to the underlying id.
pub fn resource_id(scheme: GatewayScheme, url: &Url) -> Result<String, TransferError> {
    let host = url.host_str().unwrap_or_default();
    let path = url.path().trim_matches('/');

    let id = match (scheme, url.scheme()) {
        (GatewayScheme::ContentHash, "ipfs") | (GatewayScheme::PermanentStorage, "ar") => {
            if path.is_empty() {
                host.to_string()
            } else {
                format!("{host}/{path}")
            }
        }
        (GatewayScheme::PermanentStorage, _) => path.to_string(),
        (GatewayScheme::ContentHash, _) => {
            if let Some((_, rest)) = url.path().split_once("/ipfs/") {
                rest.trim_matches('/').to_string()
            } else {
                // w3s.link style: the cid is the leading host label.
                let cid = host.split('.').next().unwrap_or_default();
                if path.is_empty() {
                    cid.to_string()
                } else {
                    format!("{cid}/{path}")
                }
            }
        }
    };

    if id.is_empty() {
        return Err(TransferError::invalid_url(
            url.as_str(),
            "no content-addressed resource id",
        ));
    }
    Ok(id)
}

/// Append a resource id to a gateway base URL.
///
/// The id lands on the base's path; any query the base carries (gateway
/// access tokens live there) is preserved on the final URL.
fn gateway_resource_url(base: &Url, resource: &str) -> Result<Url, TransferError> {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransferError::invalid_url(base.as_str(), "gateway URL cannot be a base"))?;
        segments.pop_if_empty();
        for part in resource.split('/').filter(|p| !p.is_empty()) {
            segments.push(part);
        }
    }
    Ok(url)
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Gateways fronting content-hash networks, in preference order.
    pub content_hash: Vec<Url>,
    /// Gateways fronting permanent-storage networks, in preference order.
    pub permanent_storage: Vec<Url>,
}

pub struct GatewayPool {
    config: GatewayConfig,
    client: reqwest::Client,
    /// Next starting index, shared across schemes and jobs. Advisory load
    /// balancing, not a correctness boundary.
    cursor: AtomicUsize,
}

impl GatewayPool {
    pub fn new(config: GatewayConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            cursor: AtomicUsize::new(0),
        }
    }

    fn gateways(&self, scheme: GatewayScheme) -> &[Url] {
        match scheme {
            GatewayScheme::ContentHash => &self.config.content_hash,
            GatewayScheme::PermanentStorage => &self.config.permanent_storage,
        }
    }

    /// Fetch a content-addressed URL through the configured gateways.
    ///
    /// Starting at the cursor, each gateway is tried once. A 404 is a
    /// statement about the resource, not the gateway, and fails the call
    /// immediately as `NotFound`. Other failures move on to the next
    /// gateway; when every gateway has been tried the last error is
    /// returned. The cursor advances exactly once per call regardless of
    /// outcome.
    pub async fn fetch(&self, url: &Url, request_id: &str) -> Result<ByteStream, TransferError> {
        let scheme = GatewayScheme::from_url(url).ok_or_else(|| {
            TransferError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
            }
        })?;
        let resource = resource_id(scheme, url)?;
        let gateways = self.gateways(scheme);
        if gateways.is_empty() {
            return Err(TransferError::GatewaysExhausted {
                reason: format!("no gateways configured for {scheme:?}"),
            });
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut last_error: Option<TransferError> = None;

        for offset in 0..gateways.len() {
            let gateway = &gateways[(start + offset) % gateways.len()];
            let target = gateway_resource_url(gateway, &resource)?;
            debug!(request_id, gateway = %gateway, resource = %resource, "Trying gateway");

            match self.client.get(target.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let stream = response
                            .bytes_stream()
                            .map_err(TransferError::from);
                        return Ok(Box::pin(stream));
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(TransferError::not_found(url.as_str()));
                    }
                    warn!(request_id, gateway = %gateway, %status, "Gateway returned error status");
                    last_error = Some(TransferError::http_status(status, target.as_str()));
                }
                Err(err) => {
                    warn!(request_id, gateway = %gateway, error = %err, "Gateway request failed");
                    last_error = Some(TransferError::from(err));
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no gateway attempted".to_string());
        Err(TransferError::GatewaysExhausted { reason })
    }
}
