// Probed description of a source asset, as reported by the external prober.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTrack {
    #[serde(rename = "type")]
    pub kind: TrackKind,
    pub codec: String,
    /// Bits per second.
    pub bitrate: u64,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub start_time_secs: f64,

    // Video-only fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,

    // Audio-only fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_bits: Option<u32>,
}

impl InputTrack {
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }
}

/// Probed description of a source: container format, totals and an ordered
/// track list. When any video track exists, the first one encountered is the
/// primary track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputVideo {
    pub format: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub tracks: Vec<InputTrack>,
}

impl InputVideo {
    /// The designated primary video track: the first video track in probe
    /// order, if any.
    pub fn primary_video_track(&self) -> Option<&InputTrack> {
        self.tracks.iter().find(|t| t.is_video())
    }

    pub fn has_video(&self) -> bool {
        self.primary_video_track().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_track(codec: &str, width: u32) -> InputTrack {
        InputTrack {
            kind: TrackKind::Video,
            codec: codec.to_string(),
            bitrate: 1_000_000,
            duration_secs: 10.0,
            size_bytes: 1_250_000,
            start_time_secs: 0.0,
            width: Some(width),
            height: Some(width * 9 / 16),
            pixel_format: Some("yuv420p".to_string()),
            fps: Some(30.0),
            channels: None,
            sample_rate: None,
            sample_bits: None,
        }
    }

    fn audio_track() -> InputTrack {
        InputTrack {
            kind: TrackKind::Audio,
            codec: "aac".to_string(),
            bitrate: 128_000,
            duration_secs: 10.0,
            size_bytes: 160_000,
            start_time_secs: 0.0,
            width: None,
            height: None,
            pixel_format: None,
            fps: None,
            channels: Some(2),
            sample_rate: Some(48_000),
            sample_bits: Some(16),
        }
    }

    #[test]
    fn primary_video_track_is_first_video_in_order() {
        let video = InputVideo {
            format: "mp4".to_string(),
            duration_secs: 10.0,
            size_bytes: 2_000_000,
            tracks: vec![audio_track(), video_track("h264", 1920), video_track("h264", 640)],
        };
        let primary = video.primary_video_track().unwrap();
        assert_eq!(primary.width, Some(1920));
    }

    #[test]
    fn audio_only_input_has_no_primary_video() {
        let video = InputVideo {
            format: "mp4".to_string(),
            duration_secs: 10.0,
            size_bytes: 160_000,
            tracks: vec![audio_track()],
        };
        assert!(video.primary_video_track().is_none());
        assert!(!video.has_video());
    }

    #[test]
    fn track_kind_serializes_lowercase() {
        let json = serde_json::to_string(&TrackKind::Video).unwrap();
        assert_eq!(json, "\"video\"");
    }
}
