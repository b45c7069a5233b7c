// HLS manifest handling for the VOD pipeline: loading source playlists,
// generating master and rendition playlists for transcoded output, and
// clipping a playlist to a time range.

mod clip;
mod error;
mod generate;
mod load;

pub use clip::{ClipGenerator, SegmentReencoder};
pub use error::ManifestError;
pub use generate::ManifestGenerator;
pub use load::PlaylistLoader;
