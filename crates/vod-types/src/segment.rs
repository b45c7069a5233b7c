use bytes::Bytes;
use url::Url;

/// One transcoded segment for one rendition, as produced by the remote
/// transcoder. The payload is either the segment bytes inline or a reference
/// the caller must fetch, never both.
#[derive(Debug, Clone)]
pub struct RenditionSegment {
    pub rendition_name: String,
    pub payload: RenditionPayload,
}

#[derive(Debug, Clone)]
pub enum RenditionPayload {
    Inline(Bytes),
    Reference(Url),
}

impl RenditionSegment {
    pub fn inline(rendition_name: impl Into<String>, data: Bytes) -> Self {
        Self {
            rendition_name: rendition_name.into(),
            payload: RenditionPayload::Inline(data),
        }
    }

    pub fn reference(rendition_name: impl Into<String>, url: Url) -> Self {
        Self {
            rendition_name: rendition_name.into(),
            payload: RenditionPayload::Reference(url),
        }
    }
}
