use serde::{Deserialize, Serialize};

/// A target rendition: the encoding parameters one output variant is
/// produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    /// Codec override. `copy` requests passthrough, which the transcoding
    /// pipeline rejects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

impl EncodedProfile {
    pub fn new(name: impl Into<String>, width: u32, height: u32, bitrate: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            bitrate,
            fps: None,
            gop: None,
            quality: None,
            codec: None,
        }
    }

    /// Pixel count, used as the bitrate tie-breaker when ordering renditions.
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_copy(&self) -> bool {
        self.codec.as_deref() == Some("copy")
    }

    /// A profile is usable iff all of its dimensions and its bitrate are
    /// strictly positive.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.bitrate > 0
    }
}

impl std::fmt::Display for EncodedProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}x{} @ {}bps)",
            self.name, self.width, self.height, self.bitrate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_requires_positive_dimensions_and_bitrate() {
        let mut p = EncodedProfile::new("360p0", 640, 360, 900_000);
        assert!(p.is_valid());
        p.width = 0;
        assert!(!p.is_valid());
        p.width = 640;
        p.bitrate = 0;
        assert!(!p.is_valid());
    }

    #[test]
    fn copy_detection() {
        let mut p = EncodedProfile::new("passthrough", 1920, 1080, 4_000_000);
        assert!(!p.is_copy());
        p.codec = Some("copy".to_string());
        assert!(p.is_copy());
    }

    #[test]
    fn serde_round_trip() {
        let p = EncodedProfile {
            name: "720p0".to_string(),
            width: 1280,
            height: 720,
            bitrate: 3_000_000,
            fps: Some(30),
            gop: None,
            quality: Some(27),
            codec: None,
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: EncodedProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
