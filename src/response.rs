use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

/// A successful response from the request executor.
///
/// `body` is `None` for `204 No Content`; every other success carries the
/// raw bytes as received, decoding is left to the caller.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Option<Bytes>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Builds a canned response for stub rules and tests.
    pub fn canned(status: u16, body: impl Into<Bytes>) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        let body: Bytes = body.into();
        let body = if body.is_empty() { None } else { Some(body) };
        Self::new(status, HeaderMap::new(), body)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// True only for `200 OK`, the strict contract some RPC surfaces expect.
    pub fn status_ok(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Case-insensitive response header lookup. Values that are not valid
    /// UTF-8 are treated as absent.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The body as text, lossily decoded; empty for bodyless responses.
    pub fn text_lossy(&self) -> String {
        self.body
            .as_deref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
            .unwrap_or_default()
    }

    /// Decodes the body as JSON. A bodyless response decodes as JSON `null`,
    /// so `Option<T>` targets map `204` to `None`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self.body.as_deref() {
            Some(body) => serde_json::from_slice(body),
            None => serde_json::from_slice(b"null"),
        }
    }
}
