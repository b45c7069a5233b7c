// Output manifest generation: one media playlist per rendition plus the
// master playlist enumerating them.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use m3u8_rs::{
    MasterPlaylist, MediaPlaylist, MediaPlaylistType, MediaSegment, QuotedOrUnquoted, Resolution,
    VariantStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transfer_engine::{RetryAction, RetryPolicy, StoreRouter, join_url, retry_with_backoff};
use url::Url;
use vod_types::EncodedProfile;

use crate::error::ManifestError;

/// Renditions at or above this pixel size are considered 2K+.
const TOP_SWAP_DIMENSION: u32 = 2160;

pub struct ManifestGenerator {
    stores: Arc<StoreRouter>,
    upload_retry: RetryPolicy,
}

impl ManifestGenerator {
    pub fn new(stores: Arc<StoreRouter>) -> Self {
        Self {
            stores,
            upload_retry: RetryPolicy::whole_copy(),
        }
    }

    /// Order renditions the way players should see them: descending bitrate,
    /// ties broken by descending pixel count. When the top rendition is 2K or
    /// larger it swaps with the second so players that eagerly fetch the
    /// first variant do not start with the most expensive one.
    pub fn sort_renditions(renditions: &[EncodedProfile]) -> Vec<EncodedProfile> {
        let mut sorted = renditions.to_vec();
        sorted.sort_by(|a, b| {
            b.bitrate
                .cmp(&a.bitrate)
                .then_with(|| b.pixels().cmp(&a.pixels()))
        });
        if sorted.len() > 1
            && (sorted[0].width >= TOP_SWAP_DIMENSION || sorted[0].height >= TOP_SWAP_DIMENSION)
        {
            sorted.swap(0, 1);
        }
        sorted
    }

    /// Write master and per-rendition playlists for `source` under
    /// `dest_base`. The master playlist goes up only after every rendition
    /// playlist is in place. Returns the master playlist URL.
    pub async fn generate(
        &self,
        source: &MediaPlaylist,
        dest_base: &Url,
        renditions: &[EncodedProfile],
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<Url, ManifestError> {
        let ordered = Self::sort_renditions(renditions);

        for rendition in &ordered {
            let playlist = Self::rendition_playlist(source, rendition);
            let playlist_url = join_url(dest_base, &format!("{}/index.m3u8", rendition.name))
                .map_err(ManifestError::from)?;
            self.upload_playlist(&playlist_url, render_media(&playlist), request_id, token)
                .await?;
        }

        let master = Self::master_playlist(source, &ordered);
        let master_url = join_url(dest_base, "index.m3u8").map_err(ManifestError::from)?;
        self.upload_playlist(&master_url, render_master(&master), request_id, token)
            .await?;
        debug!(request_id, master = %master_url, renditions = ordered.len(), "Wrote output manifests");
        Ok(master_url)
    }

    /// A rendition playlist mirrors the source window: same version, target
    /// duration and segment count, with one `<seqId>.ts` entry per source
    /// segment carrying the source duration.
    fn rendition_playlist(source: &MediaPlaylist, _rendition: &EncodedProfile) -> MediaPlaylist {
        let segments = source
            .segments
            .iter()
            .enumerate()
            .map(|(i, src)| MediaSegment {
                uri: format!("{}.ts", source.media_sequence + i as u64),
                duration: src.duration,
                ..Default::default()
            })
            .collect();

        MediaPlaylist {
            version: source.version,
            target_duration: source.target_duration,
            media_sequence: source.media_sequence,
            playlist_type: Some(MediaPlaylistType::Vod),
            end_list: true,
            segments,
            ..Default::default()
        }
    }

    fn master_playlist(source: &MediaPlaylist, ordered: &[EncodedProfile]) -> MasterPlaylist {
        let variants = ordered
            .iter()
            .enumerate()
            .map(|(index, rendition)| {
                let mut other = HashMap::new();
                other.insert(
                    "NAME".to_string(),
                    QuotedOrUnquoted::Quoted(format!("{index}-{}", rendition.name)),
                );
                VariantStream {
                    uri: format!("{}/index.m3u8", rendition.name),
                    bandwidth: u64::from(rendition.bitrate),
                    resolution: Some(Resolution {
                        width: u64::from(rendition.width),
                        height: u64::from(rendition.height),
                    }),
                    frame_rate: rendition.fps.map(f64::from),
                    other_attributes: Some(other),
                    ..Default::default()
                }
            })
            .collect();

        MasterPlaylist {
            version: source.version,
            variants,
            independent_segments: true,
            ..Default::default()
        }
    }

    async fn upload_playlist(
        &self,
        url: &Url,
        body: Vec<u8>,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<(), ManifestError> {
        let bytes = Bytes::from(body);
        retry_with_backoff(&self.upload_retry, token, |_attempt| {
            let bytes = bytes.clone();
            async move {
                match self.stores.put_bytes(url, bytes).await {
                    Ok(_) => RetryAction::Success(()),
                    Err(err) => RetryAction::from_error(err),
                }
            }
        })
        .await
        .map_err(|e| {
            debug!(request_id, url = %url, error = %e, "Playlist upload failed");
            ManifestError::from(e)
        })
    }
}

fn render_media(playlist: &MediaPlaylist) -> Vec<u8> {
    let mut out = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = playlist.write_to(&mut out);
    out
}

fn render_master(playlist: &MasterPlaylist) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = playlist.write_to(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, width: u32, height: u32, bitrate: u32) -> EncodedProfile {
        EncodedProfile::new(name, width, height, bitrate)
    }

    fn source_playlist(segment_durations: &[f32]) -> MediaPlaylist {
        let segments = segment_durations
            .iter()
            .enumerate()
            .map(|(i, d)| MediaSegment {
                uri: format!("{i}.ts"),
                duration: *d,
                ..Default::default()
            })
            .collect();
        MediaPlaylist {
            version: Some(3),
            target_duration: 11,
            playlist_type: Some(MediaPlaylistType::Vod),
            end_list: true,
            segments,
            ..Default::default()
        }
    }

    #[test]
    fn renditions_sort_by_bitrate_then_pixels() {
        let sorted = ManifestGenerator::sort_renditions(&[
            profile("a", 640, 360, 900_000),
            profile("b", 1280, 720, 3_000_000),
            profile("c", 1920, 1080, 3_000_000),
        ]);
        assert_eq!(sorted[0].name, "c");
        assert_eq!(sorted[1].name, "b");
        assert_eq!(sorted[2].name, "a");
    }

    #[test]
    fn top_rendition_swaps_when_2k_or_larger() {
        let sorted = ManifestGenerator::sort_renditions(&[
            profile("uhd", 3840, 2160, 12_000_000),
            profile("hd", 1920, 1080, 5_000_000),
            profile("sd", 640, 360, 900_000),
        ]);
        assert_eq!(sorted[0].name, "hd");
        assert_eq!(sorted[1].name, "uhd");
        assert_eq!(sorted[2].name, "sd");
    }

    #[test]
    fn no_swap_below_2k() {
        let sorted = ManifestGenerator::sort_renditions(&[
            profile("hd", 1920, 1080, 5_000_000),
            profile("sd", 640, 360, 900_000),
        ]);
        assert_eq!(sorted[0].name, "hd");
    }

    #[test]
    fn rendition_playlist_mirrors_window() {
        let source = source_playlist(&[10.0, 7.5]);
        let playlist = ManifestGenerator::rendition_playlist(&source, &profile("360p0", 640, 360, 900_000));
        assert_eq!(playlist.segments.len(), 2);
        assert_eq!(playlist.segments[0].uri, "0.ts");
        assert_eq!(playlist.segments[1].uri, "1.ts");
        assert_eq!(playlist.target_duration, 11);
        assert!(playlist.end_list);
        assert!((playlist.segments[1].duration - 7.5).abs() < 1e-6);
    }

    #[test]
    fn master_lists_variants_with_bandwidth_and_name() {
        let source = source_playlist(&[10.0]);
        let master = ManifestGenerator::master_playlist(
            &source,
            &[profile("720p0", 1280, 720, 3_000_000), profile("360p0", 640, 360, 900_000)],
        );
        assert_eq!(master.variants.len(), 2);
        assert_eq!(master.variants[0].bandwidth, 3_000_000);
        assert_eq!(master.variants[0].uri, "720p0/index.m3u8");
        let name = master.variants[1]
            .other_attributes
            .as_ref()
            .and_then(|m| m.get("NAME"))
            .cloned();
        assert!(matches!(name, Some(QuotedOrUnquoted::Quoted(s)) if s == "1-360p0"));
        // Bandwidths are non-increasing.
        assert!(master.variants[0].bandwidth >= master.variants[1].bandwidth);
    }

    #[tokio::test]
    async fn generate_writes_all_playlists() {
        let stores = Arc::new(StoreRouter::new());
        let generator = ManifestGenerator::new(stores.clone());
        let dest = Url::parse("memory://gen/out").unwrap();
        let source = source_playlist(&[10.0, 7.5]);

        let master_url = generator
            .generate(
                &source,
                &dest,
                &[profile("360p0", 640, 360, 900_000)],
                "req-1",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(master_url.as_str(), "memory://gen/out/index.m3u8");

        let master = stores.get_bytes(&master_url).await.unwrap();
        let master_text = String::from_utf8(master.to_vec()).unwrap();
        assert!(master_text.contains("BANDWIDTH=900000"));
        assert!(master_text.contains("RESOLUTION=640x360"));

        let rendition = stores
            .get_bytes(&Url::parse("memory://gen/out/360p0/index.m3u8").unwrap())
            .await
            .unwrap();
        let rendition_text = String::from_utf8(rendition.to_vec()).unwrap();
        assert!(rendition_text.contains("#EXT-X-ENDLIST"));
        assert!(rendition_text.contains("0.ts"));
        assert!(rendition_text.contains("1.ts"));
    }
}
