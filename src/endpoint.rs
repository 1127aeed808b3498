use std::collections::BTreeMap;

use http::Method;

/// Request headers as sent by the caller. Stored sorted so derived
/// artifacts (request targets, cURL repro strings) are deterministic.
pub type Headers = BTreeMap<String, String>;

/// Query parameters, sorted by name before encoding.
pub type QueryParams = BTreeMap<String, String>;

/// A logical API endpoint: an absolute URL path plus an HTTP method.
///
/// `Endpoint` is the stub-rule key and the correlation key carried in
/// errors and log lines, so two requests to the same path with different
/// methods are distinct endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    path: String,
    method: Method,
}

impl Endpoint {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} {}", self.method, self.path)
    }
}
