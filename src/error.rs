use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::endpoint::{Endpoint, Headers, QueryParams};
use crate::util::{curl_command, stringify_body};

type SharedCause = Arc<dyn std::error::Error + Send + Sync>;

/// Stable machine-readable error codes.
///
/// `as_str` values are a contract: SDKs match on them and dashboards group
/// by them, so existing codes never change meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    MalformedTarget,
    Transport,
    Protocol,
    NotConfigured,
    NotConnected,
    Disconnected,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedTarget => "malformed_target",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::NotConfigured => "not_configured",
            Self::NotConnected => "not_connected",
            Self::Disconnected => "disconnected",
        }
    }

    pub const fn all() -> [ErrorKind; 6] {
        [
            Self::MalformedTarget,
            Self::Transport,
            Self::Protocol,
            Self::NotConfigured,
            Self::NotConnected,
            Self::Disconnected,
        ]
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// How severely a failure should surface to the end user.
///
/// `Silent` failures are swallowed by callers, `AuthProblem` routes to the
/// re-authentication flow; the rest map to UI severity levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Violation {
    Silent,
    #[default]
    Warning,
    Error,
    Fatal,
    AuthProblem,
}

impl Violation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Silent => "silent",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::AuthProblem => "auth_problem",
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A request or session failure with full request context attached.
///
/// `status` is the HTTP status when the server produced a structured
/// response, `0` when the failure happened before one existed (malformed
/// target, transport error, session errors). `method` is `None` for duplex
/// session failures, which have no HTTP method.
#[derive(Clone, Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub violation: Violation,
    pub message: String,
    pub url: String,
    pub status: u16,
    pub method: Option<Method>,
    pub headers: Headers,
    pub params: QueryParams,
    pub raw_body: Option<Bytes>,
    pub response_headers: HeaderMap,
    pub cause: Option<SharedCause>,
}

impl ApiError {
    fn base(kind: ErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            violation: Violation::default(),
            message: message.into(),
            url: url.into(),
            status: 0,
            method: None,
            headers: Headers::new(),
            params: QueryParams::new(),
            raw_body: None,
            response_headers: HeaderMap::new(),
            cause: None,
        }
    }

    /// The request target could not be built from the endpoint path and
    /// query parameters. Never retried: the same input fails the same way.
    pub fn malformed_target(endpoint: &Endpoint, headers: &Headers, params: &QueryParams) -> Self {
        let mut error = Self::base(
            ErrorKind::MalformedTarget,
            endpoint.path(),
            "unable to build request target",
        );
        error.method = Some(endpoint.method().clone());
        error.headers = headers.clone();
        error.params = params.clone();
        error
    }

    /// The request left the client but no structured response came back.
    pub fn transport(
        endpoint: &Endpoint,
        url: impl Into<String>,
        headers: &Headers,
        params: &QueryParams,
        cause: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        let mut error = Self::base(ErrorKind::Transport, url, cause.to_string());
        error.method = Some(endpoint.method().clone());
        error.headers = headers.clone();
        error.params = params.clone();
        error.cause = Some(cause.into());
        error
    }

    /// The server answered with a non-success status.
    pub fn protocol(
        endpoint: &Endpoint,
        url: impl Into<String>,
        status: StatusCode,
        body: &Bytes,
        response_headers: HeaderMap,
        headers: &Headers,
        params: &QueryParams,
    ) -> Self {
        let snippet = stringify_body(body);
        let mut error = Self::base(ErrorKind::Protocol, url, format!("bad response: {snippet}"));
        error.status = status.as_u16();
        error.method = Some(endpoint.method().clone());
        error.headers = headers.clone();
        error.params = params.clone();
        error.raw_body = Some(body.clone());
        error.response_headers = response_headers;
        error
    }

    /// A session operation that requires a stored configuration ran without
    /// one, or `configure` was called while a connection was live.
    pub fn not_configured(url_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::base(ErrorKind::NotConfigured, url_path, message)
    }

    /// A send was attempted with no live connection. No transport call is
    /// made in this case.
    pub fn not_connected(url_path: impl Into<String>) -> Self {
        Self::base(
            ErrorKind::NotConnected,
            url_path,
            "no live connection for this session",
        )
    }

    /// The connection dropped underneath the session.
    pub fn disconnected(
        url_path: impl Into<String>,
        cause: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        let mut error = Self::base(ErrorKind::Disconnected, url_path, cause.to_string());
        error.cause = Some(cause.into());
        error
    }

    /// A session-level transport failure (send or handshake).
    pub fn session_transport(
        url_path: impl Into<String>,
        cause: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        let mut error = Self::base(ErrorKind::Transport, url_path, cause.to_string());
        error.cause = Some(cause.into());
        error
    }

    pub fn with_violation(mut self, violation: Violation) -> Self {
        self.violation = violation;
        self
    }

    /// Renders a cURL command reproducing the failed request, suitable for
    /// pasting into a terminal when triaging SDK bug reports.
    pub fn curl_command(&self) -> String {
        let method = self.method.clone().unwrap_or(Method::GET);
        curl_command(&method, &self.url, &self.headers, self.raw_body.as_ref())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}: {}", self.status, self.kind)?;
        if let Some(method) = &self.method {
            write!(formatter, " {method}")?;
        }
        write!(formatter, " {}: {}", self.url, self.message)
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}
