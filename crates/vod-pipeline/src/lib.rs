// VOD transcoding pipeline core.
//
// A job flows orchestrator → transfer stage → backend router, which runs it
// either on the in-house backend (external segmenter + segment dispatcher +
// manifest generation) or on the cloud transcoding provider. Progress from
// every stage funnels into the shared aggregator, which delivers periodic
// callbacks to the requester.

pub mod cloud;
mod config;
mod dispatch;
mod error;
mod multipart;
mod orchestrator;
mod progress;
mod router;
mod segmenter;

pub use config::{CloudConfig, DispatchConfig, RouterConfig};
pub use dispatch::{DispatchOutcome, HttpSegmentTranscoder, SegmentDispatcher, SegmentTranscoder};
pub use error::PipelineError;
pub use multipart::{MultipartPart, mixed_boundary, parse_parts, part_to_rendition};
pub use orchestrator::JobOrchestrator;
pub use progress::{AggregatorConfig, ProgressAggregator};
pub use router::{
    BackendKind, BackendRouter, InHouseBackend, LocalStreamRegistry, StreamRegistry,
    TranscodeOutcome, effective_profiles,
};
pub use segmenter::Segmenter;
