// Retryable input transfer for the VOD pipeline.
//
// Routes any supported input URL (HTTP, object store, content-addressed
// networks) into a byte stream, copies assets into the working store with
// integrity accounting, and prepares inputs for transcoding: copy, sign,
// probe.

mod client;
mod counter;
mod decrypt;
mod error;
mod fetch;
mod gateway;
mod retry;
mod store;
mod transfer;
mod urlmap;

pub use client::{DEFAULT_USER_AGENT, HttpConfig};
pub use counter::{ByteCounter, ByteStream, counted};
pub use decrypt::SegmentDecryptor;
pub use error::TransferError;
pub use fetch::{CopiedFile, FetchLayer};
pub use gateway::{GatewayConfig, GatewayPool, GatewayScheme, resource_id};
pub use retry::{RetryAction, RetryPolicy, is_retryable_reqwest_error, retry_with_backoff};
pub use store::{StoreHandle, StoreRouter, is_store_url};
pub use transfer::{PreparedInput, Prober, TransferConfig, TransferStage};
pub use urlmap::{dir_url, file_name, join_url, segment_transfer_location};
