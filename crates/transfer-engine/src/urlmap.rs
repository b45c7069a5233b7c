// URL layout helpers for mirroring a source HLS bundle under a destination.

use url::Url;

use crate::error::TransferError;

/// Compute where a source segment lands under the destination manifest.
///
/// The destination keeps the source's relative layout: take the longest
/// common path prefix of the source manifest and the segment, keep the
/// segment's suffix beyond it, and join that suffix under the destination
/// manifest's directory. Hosts are ignored in the comparison, so the rule
/// also applies when manifest and segments live on different CDNs.
pub fn segment_transfer_location(
    source_manifest: &Url,
    dest_manifest: &Url,
    segment: &Url,
) -> Result<Url, TransferError> {
    let manifest_segments: Vec<&str> = source_manifest
        .path_segments()
        .map(|s| s.collect())
        .unwrap_or_default();
    let segment_segments: Vec<&str> = segment
        .path_segments()
        .map(|s| s.collect())
        .unwrap_or_default();

    let mut common = 0;
    while common < manifest_segments.len()
        && common < segment_segments.len()
        && manifest_segments[common] == segment_segments[common]
    {
        common += 1;
    }

    let mut out = dest_manifest.clone();
    {
        let mut path = out.path_segments_mut().map_err(|_| {
            TransferError::invalid_url(dest_manifest.as_str(), "destination cannot be a base")
        })?;
        // dir(D): drop the destination manifest filename.
        path.pop();
        for part in &segment_segments[common..] {
            if !part.is_empty() {
                path.push(part);
            }
        }
    }
    Ok(out)
}

/// Join path components under a base URL, preserving authority and query.
pub fn join_url(base: &Url, rel: &str) -> Result<Url, TransferError> {
    let mut out = base.clone();
    {
        let mut path = out
            .path_segments_mut()
            .map_err(|_| TransferError::invalid_url(base.as_str(), "URL cannot be a base"))?;
        path.pop_if_empty();
        for part in rel.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
    }
    Ok(out)
}

/// The URL's directory: everything up to and excluding the final segment.
pub fn dir_url(url: &Url) -> Result<Url, TransferError> {
    let mut out = url.clone();
    {
        let mut path = out
            .path_segments_mut()
            .map_err(|_| TransferError::invalid_url(url.as_str(), "URL cannot be a base"))?;
        path.pop();
    }
    Ok(out)
}

/// Final path segment, if any.
pub fn file_name(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|segments| segments.last().map(str::to_string))
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn same_directory_segment_maps_next_to_destination_manifest() {
        let got = segment_transfer_location(
            &url("https://a/x/y/out.m3u8"),
            &url("s3://u:p@h/X/Y/out.m3u8"),
            &url("https://a/x/y/0.ts"),
        )
        .unwrap();
        assert_eq!(got.as_str(), "s3://u:p@h/X/Y/0.ts");
    }

    #[test]
    fn nested_segment_keeps_relative_suffix() {
        let got = segment_transfer_location(
            &url("https://a/x/y/out.m3u8"),
            &url("s3://u:p@h/X/Y/out.m3u8"),
            &url("https://a/x/y/sub/1.ts"),
        )
        .unwrap();
        assert_eq!(got.as_str(), "s3://u:p@h/X/Y/sub/1.ts");
    }

    #[test]
    fn cross_host_segment_carries_full_path() {
        let got = segment_transfer_location(
            &url("https://a/x/y/out.m3u8"),
            &url("s3://u:p@h/X/Y/out.m3u8"),
            &url("https://cdn.other/z/0.ts"),
        )
        .unwrap();
        assert_eq!(got.as_str(), "s3://u:p@h/X/Y/z/0.ts");
    }

    #[test]
    fn mapping_is_deterministic() {
        let m = url("https://a/x/y/out.m3u8");
        let d = url("s3://u:p@h/X/Y/out.m3u8");
        let s = url("https://a/x/y/sub/1.ts");
        let once = segment_transfer_location(&m, &d, &s).unwrap();
        let twice = segment_transfer_location(&m, &d, &s).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn join_and_dir_helpers() {
        let base = url("s3://key:secret@bucket/work/req-1");
        let joined = join_url(&base, "source/0.ts").unwrap();
        assert_eq!(joined.as_str(), "s3://key:secret@bucket/work/req-1/source/0.ts");
        let dir = dir_url(&joined).unwrap();
        assert_eq!(dir.as_str(), "s3://key:secret@bucket/work/req-1/source");
        assert_eq!(file_name(&joined).as_deref(), Some("0.ts"));
    }
}
