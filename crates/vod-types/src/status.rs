// Transcode status envelope and stage-weighted completion.
//
// Every stage owns a slice of the overall [0,1] completion range so that a
// job's reported ratio never regresses when it moves from one stage to the
// next. The aggregator compares weighted values, not raw ones.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::probe::{InputTrack, InputVideo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeStatus {
    #[serde(rename = "preparing")]
    Preparing,
    #[serde(rename = "preparing-completed")]
    PreparingCompleted,
    #[serde(rename = "transcoding")]
    Transcoding,
    #[serde(rename = "success")]
    Completed,
    #[serde(rename = "error")]
    Error,
}

impl TranscodeStatus {
    /// Position in the stage progression. `Error` is terminal but carries no
    /// position: it is unordered with respect to progress.
    pub fn stage_index(self) -> Option<u8> {
        match self {
            Self::Preparing => Some(0),
            Self::PreparingCompleted => Some(1),
            Self::Transcoding => Some(2),
            Self::Completed => Some(3),
            Self::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for TranscodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Preparing => "preparing",
            Self::PreparingCompleted => "preparing-completed",
            Self::Transcoding => "transcoding",
            Self::Completed => "success",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Map a (stage, intra-stage ratio) pair onto the overall completion range.
///
/// preparing → [0, 0.4], transcoding → [0.4, 0.9], completed → [0.9, 1.0].
/// `preparing-completed` is the fixed boundary between the first two.
/// An error carries its last observed ratio through unchanged.
pub fn overall_completion(status: TranscodeStatus, ratio: f64) -> f64 {
    let ratio = ratio.clamp(0.0, 1.0);
    match status {
        TranscodeStatus::Preparing => ratio * 0.4,
        TranscodeStatus::PreparingCompleted => 0.4,
        TranscodeStatus::Transcoding => 0.4 + ratio * 0.5,
        TranscodeStatus::Completed => 0.9 + ratio * 0.1,
        TranscodeStatus::Error => ratio,
    }
}

/// Identity assigned to an incoming job: an opaque request identifier plus
/// the URL progress callbacks are delivered to. Immutable for the job's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub request_id: String,
    pub callback_url: String,
}

impl RequestFingerprint {
    pub fn new(request_id: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            callback_url: callback_url.into(),
        }
    }
}

/// Probed input description included in the terminal success payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSpec {
    pub format: String,
    pub duration: f64,
    pub bytes: u64,
    pub tracks: Vec<InputTrack>,
}

impl From<&InputVideo> for VideoSpec {
    fn from(video: &InputVideo) -> Self {
        Self {
            format: video.format.clone(),
            duration: video.duration_secs,
            bytes: video.size_bytes,
            tracks: video.tracks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVideoFile {
    pub location: String,
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

/// One published output group: the manifest (or directory) location plus the
/// files written under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub manifest: String,
    pub videos: Vec<OutputVideoFile>,
}

/// Playable form of the transferred source, for callers that want to preview
/// the input while the job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePlayback {
    pub url: String,
    pub duration: f64,
}

/// Progress envelope delivered to the caller's callback URL.
///
/// `completion_ratio` is always serialized, including at zero. The rich
/// payload (`type`, `video_spec`, `outputs`, `source_playback`) is present
/// only on terminal success. The callback URL itself is routing state, not
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub request_id: String,
    #[serde(skip)]
    pub callback_url: String,
    pub status: TranscodeStatus,
    pub completion_ratio: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unretriable: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_spec: Option<VideoSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_playback: Option<SourcePlayback>,
}

impl StatusMessage {
    pub fn progress(fingerprint: &RequestFingerprint, status: TranscodeStatus, ratio: f64) -> Self {
        Self {
            request_id: fingerprint.request_id.clone(),
            callback_url: fingerprint.callback_url.clone(),
            status,
            completion_ratio: ratio.clamp(0.0, 1.0),
            timestamp: Utc::now().timestamp_millis(),
            error: None,
            unretriable: false,
            kind: None,
            video_spec: None,
            outputs: None,
            source_playback: None,
        }
    }

    pub fn completed(
        fingerprint: &RequestFingerprint,
        video_spec: VideoSpec,
        outputs: Vec<OutputDescriptor>,
        source_playback: Option<SourcePlayback>,
    ) -> Self {
        let mut msg = Self::progress(fingerprint, TranscodeStatus::Completed, 1.0);
        msg.kind = Some("video".to_string());
        msg.video_spec = Some(video_spec);
        msg.outputs = Some(outputs);
        msg.source_playback = source_playback;
        msg
    }

    /// Terminal failure. The error text is preserved verbatim; the last
    /// observed ratio is carried so the caller sees where the job died.
    pub fn failed(
        fingerprint: &RequestFingerprint,
        error: impl Into<String>,
        unretriable: bool,
        last_ratio: f64,
    ) -> Self {
        let mut msg = Self::progress(fingerprint, TranscodeStatus::Error, last_ratio);
        msg.error = Some(error.into());
        msg.unretriable = unretriable;
        msg
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stage-weighted overall completion, the value the aggregator's
    /// monotonicity check compares.
    pub fn weighted_completion(&self) -> f64 {
        overall_completion(self.status, self.completion_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> RequestFingerprint {
        RequestFingerprint::new("req-1", "https://callback.example/hook")
    }

    #[rstest::rstest]
    #[case(TranscodeStatus::Preparing, 0.0, 0.0)]
    #[case(TranscodeStatus::Preparing, 0.5, 0.2)]
    #[case(TranscodeStatus::PreparingCompleted, 0.0, 0.4)]
    #[case(TranscodeStatus::PreparingCompleted, 1.0, 0.4)]
    #[case(TranscodeStatus::Transcoding, 0.0, 0.4)]
    #[case(TranscodeStatus::Transcoding, 1.0, 0.9)]
    #[case(TranscodeStatus::Completed, 0.0, 0.9)]
    #[case(TranscodeStatus::Completed, 1.0, 1.0)]
    #[case(TranscodeStatus::Error, 0.77, 0.77)]
    fn stage_weighting_matches_ranges(
        #[case] status: TranscodeStatus,
        #[case] ratio: f64,
        #[case] expected: f64,
    ) {
        assert!((overall_completion(status, ratio) - expected).abs() < 1e-9);
    }

    #[test]
    fn weighting_clamps_out_of_range_ratios() {
        assert!((overall_completion(TranscodeStatus::Preparing, 7.0) - 0.4).abs() < 1e-9);
        assert!(overall_completion(TranscodeStatus::Transcoding, -1.0) >= 0.4);
    }

    #[test]
    fn completion_ratio_serialized_at_zero() {
        let msg = StatusMessage::progress(&fingerprint(), TranscodeStatus::Preparing, 0.0);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"completion_ratio\":0.0"));
        assert!(json.contains("\"status\":\"preparing\""));
        // No rich payload outside terminal success.
        assert!(!json.contains("video_spec"));
        assert!(!json.contains("unretriable"));
    }

    #[test]
    fn terminal_success_carries_rich_payload() {
        let spec = VideoSpec {
            format: "mp4".to_string(),
            duration: 30.0,
            bytes: 1024,
            tracks: vec![],
        };
        let outputs = vec![OutputDescriptor {
            kind: "hls".to_string(),
            manifest: "s3://bucket/out/index.m3u8".to_string(),
            videos: vec![],
        }];
        let msg = StatusMessage::completed(&fingerprint(), spec, outputs, None);
        assert!(msg.is_terminal());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"status\":\"success\""));
        assert!(json.contains("\"type\":\"video\""));
        assert!(json.contains("\"video_spec\""));
        assert!(json.contains("\"outputs\""));
    }

    #[test]
    fn marshal_unmarshal_round_trips_serialized_fields() {
        let mut msg = StatusMessage::failed(&fingerprint(), "probe failed: no video", true, 0.3);
        let json = serde_json::to_string(&msg).unwrap();
        let back: StatusMessage = serde_json::from_str(&json).unwrap();
        // The callback URL is internal routing state and is not serialized.
        msg.callback_url = String::new();
        assert_eq!(msg, back);
        assert_eq!(back.error.as_deref(), Some("probe failed: no video"));
        assert!(back.unretriable);
    }

    #[test]
    fn error_is_terminal_and_unordered() {
        let msg = StatusMessage::failed(&fingerprint(), "boom", false, 0.77);
        assert!(msg.is_terminal());
        assert_eq!(msg.status.stage_index(), None);
        assert!((msg.weighted_completion() - 0.77).abs() < 1e-9);
    }
}
