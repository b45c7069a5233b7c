// Copy-back of finished cloud outputs from the provider-managed bucket to
// the caller's destinations.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use transfer_engine::{FetchLayer, Prober, StoreRouter, join_url};
use url::Url;

use vod_types::{OutputDescriptor, OutputVideoFile};

use crate::cloud::driver::CloudRequest;
use crate::error::PipelineError;

/// Copy every file under `provider_prefix` to the caller's HLS/MP4
/// destinations, preserving the relative path under the prefix. Files are
/// produced by a listing task and drained by a bounded pool of workers; the
/// first failure cancels the rest.
pub async fn copy_outputs(
    fetch: Arc<FetchLayer>,
    stores: Arc<StoreRouter>,
    prober: Arc<dyn Prober>,
    client: reqwest::Client,
    provider_prefix: &Url,
    request: &CloudRequest,
    workers: usize,
    token: &CancellationToken,
) -> Result<Vec<OutputDescriptor>, PipelineError> {
    let files = stores.list_suffixes(provider_prefix).await?;
    debug!(request_id = %request.request_id, files = files.len(), "Copying cloud outputs back");

    let copy_token = token.child_token();
    let (tx, rx) = mpsc::channel::<String>(workers.max(1) * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let lister = {
        let files = files.clone();
        let token = copy_token.clone();
        tokio::spawn(async move {
            for file in files {
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(file) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut pool: JoinSet<Result<(), PipelineError>> = JoinSet::new();
    for _ in 0..workers.max(1) {
        let rx = rx.clone();
        let fetch = fetch.clone();
        let stores = stores.clone();
        let prefix = provider_prefix.clone();
        let hls_output = request.hls_output.clone();
        let mp4_output = request.mp4_output.clone();
        let request_id = request.request_id.clone();
        let token = copy_token.clone();
        pool.spawn(async move {
            loop {
                let file = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        _ = token.cancelled() => return Err(PipelineError::Cancelled),
                        file = rx.recv() => match file {
                            Some(file) => file,
                            None => return Ok(()),
                        },
                    }
                };

                let Some(destination) = destination_for(&file, &hls_output, &mp4_output)? else {
                    debug!(request_id, file, "No destination configured, skipping");
                    continue;
                };
                let source = join_url(&prefix, &file)?;
                let (stream, _counter) = fetch.open(&source, &request_id, &token).await?;
                stores.put_stream(&destination, stream).await?;
                debug!(request_id, src = %source, dst = %destination, "Copied output file");
            }
        });
    }

    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    copy_token.cancel();
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    copy_token.cancel();
                    first_error = Some(PipelineError::Internal {
                        reason: format!("copy worker panicked: {join_err}"),
                    });
                }
            }
        }
    }
    lister.abort();

    if let Some(err) = first_error {
        return Err(err);
    }

    build_descriptors(&stores, &prober, &client, &files, request).await
}

fn destination_for(
    file: &str,
    hls_output: &Option<Url>,
    mp4_output: &Option<Url>,
) -> Result<Option<Url>, PipelineError> {
    if let Some(rest) = file.strip_prefix("hls/") {
        return match hls_output {
            Some(base) => Ok(Some(join_url(base, rest)?)),
            None => Ok(None),
        };
    }
    if let Some(rest) = file.strip_prefix("mp4/") {
        return match mp4_output {
            Some(base) => Ok(Some(join_url(base, rest)?)),
            None => Ok(None),
        };
    }
    Ok(None)
}

/// Describe what was published. MP4 files are probed post-copy so the
/// terminal payload can carry their size and dimensions.
async fn build_descriptors(
    stores: &Arc<StoreRouter>,
    prober: &Arc<dyn Prober>,
    client: &reqwest::Client,
    files: &[String],
    request: &CloudRequest,
) -> Result<Vec<OutputDescriptor>, PipelineError> {
    let mut outputs = Vec::new();

    if let Some(hls_output) = &request.hls_output {
        let manifest = join_url(hls_output, "index.m3u8")?;
        outputs.push(OutputDescriptor {
            kind: "hls".to_string(),
            manifest: manifest.to_string(),
            videos: request
                .profiles
                .iter()
                .map(|p| OutputVideoFile {
                    location: format!("{}/index.m3u8", p.name),
                    size_bytes: None,
                    width: Some(p.width),
                    height: Some(p.height),
                    bitrate: Some(p.bitrate),
                })
                .collect(),
        });
    }

    if let Some(mp4_output) = &request.mp4_output {
        let mut videos = Vec::new();
        for file in files {
            let Some(rest) = file.strip_prefix("mp4/") else {
                continue;
            };
            let location = join_url(mp4_output, rest)?;
            let mut video = OutputVideoFile {
                location: location.to_string(),
                size_bytes: None,
                width: None,
                height: None,
                bitrate: None,
            };
            let access = stores
                .signed_access_url(client, &location, std::time::Duration::from_secs(24 * 60 * 60))
                .await?;
            match prober.probe(&access).await {
                Ok(probed) => {
                    video.size_bytes = Some(probed.size_bytes);
                    if let Some(track) = probed.primary_video_track() {
                        video.width = track.width;
                        video.height = track.height;
                        video.bitrate = u32::try_from(track.bitrate).ok();
                    }
                }
                Err(err) => {
                    warn!(request_id = %request.request_id, file, error = %err, "MP4 probe failed");
                }
            }
            videos.push(video);
        }
        outputs.push(OutputDescriptor {
            kind: "mp4".to_string(),
            manifest: mp4_output.to_string(),
            videos,
        });
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_preserve_relative_path() {
        let hls = Some(Url::parse("s3://user/out/hls").unwrap());
        let mp4 = Some(Url::parse("s3://user/out/mp4").unwrap());

        let got = destination_for("hls/360p0/0.ts", &hls, &mp4).unwrap().unwrap();
        assert_eq!(got.as_str(), "s3://user/out/hls/360p0/0.ts");

        let got = destination_for("mp4/static360p0.mp4", &hls, &mp4).unwrap().unwrap();
        assert_eq!(got.as_str(), "s3://user/out/mp4/static360p0.mp4");

        assert!(destination_for("logs/job.txt", &hls, &mp4).unwrap().is_none());
        assert!(destination_for("mp4/static360p0.mp4", &hls, &None).unwrap().is_none());
    }
}
