use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::header::HeaderMap;

/// A decoded JSON response. `data` is the sole access channel to the body.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub data: serde_json::Value,
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
}

/// A decoded text response.
#[derive(Debug, Clone)]
pub struct TextResponse {
    pub text: String,
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
}

/// A raw bytes response.
#[derive(Debug, Clone)]
pub struct BytesResponse {
    pub content: Bytes,
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
}

/// Tagged union over the buffered response shapes, for callers which hold
/// heterogeneous responses. The typed getters on Client return the concrete
/// shapes directly.
#[derive(Debug, Clone)]
pub enum Response {
    Json(JsonResponse),
    Text(TextResponse),
    Bytes(BytesResponse),
}

impl Response {
    pub fn url(&self) -> &str {
        match self {
            Response::Json(r) => &r.url,
            Response::Text(r) => &r.url,
            Response::Bytes(r) => &r.url,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Response::Json(r) => r.status,
            Response::Text(r) => r.status,
            Response::Bytes(r) => r.status,
        }
    }
}

impl JsonResponse {
    /// A best-effort version stamp for the fetched resource: ETag if present,
    /// else Last-Modified, else None. Adapters record this as source_version.
    pub fn version_stamp(&self) -> Option<String> {
        for name in [reqwest::header::ETAG, reqwest::header::LAST_MODIFIED] {
            if let Some(value) = self.headers.get(&name) {
                if let Ok(value) = value.to_str() {
                    return Some(value.trim_matches('"').to_string());
                }
            }
        }
        None
    }
}

/// An unbuffered byte stream response, for large payloads. Chunks surface
/// transport failures as they occur.
pub struct ByteStream {
    pub stream: BoxStream<'static, crate::Result<Bytes>>,
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("url", &self.url)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
