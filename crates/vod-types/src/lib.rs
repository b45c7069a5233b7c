// Shared data model for the VOD transcoding pipeline.
//
// These types cross crate boundaries: probed input descriptions, encoding
// profiles, job arguments, transcode status envelopes and per-rendition
// segment payloads. Everything here is plain data; behaviour lives in the
// engine crates.

mod job;
mod probe;
mod profile;
mod segment;
mod status;

pub use job::{DecryptionMaterial, JobArgs, JobHooks, ProgressHook, SegmentHook, SourceSizeHook};
pub use probe::{InputTrack, InputVideo, TrackKind};
pub use profile::EncodedProfile;
pub use segment::{RenditionPayload, RenditionSegment};
pub use status::{
    OutputDescriptor, OutputVideoFile, RequestFingerprint, SourcePlayback, StatusMessage,
    TranscodeStatus, VideoSpec, overall_completion,
};
