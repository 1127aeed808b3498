use bytes::Bytes;
use http::{Method, StatusCode};
use tracing::{debug, info_span, warn, Instrument};

use crate::endpoint::{Endpoint, Headers, QueryParams};
use crate::error::{ApiError, ErrorKind};
use crate::response::ApiResponse;
use crate::retry::RetryPolicy;
use crate::transport::{HttpTransport, HyperTransport, TransportBuildError, TransportRequest};
use crate::util::{build_request_target, curl_command, merge_headers};
use crate::ApiResult;

const BODY_METHODS: [Method; 4] = [Method::POST, Method::PUT, Method::DELETE, Method::PATCH];

/// The request executor: one attempt per retry-policy step, with target
/// building, status classification, and begin/end log lines around each
/// attempt.
pub struct RpcClient<T: HttpTransport = HyperTransport> {
    transport: T,
    default_headers: Headers,
}

impl RpcClient<HyperTransport> {
    /// An executor over the production hyper transport.
    pub fn new() -> Result<Self, TransportBuildError> {
        Ok(Self::with_transport(HyperTransport::new()?))
    }
}

impl<T: HttpTransport> RpcClient<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            default_headers: Headers::new(),
        }
    }

    /// Adds a header sent with every request. Per-request headers with the
    /// same name win.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub async fn get(
        &self,
        path: impl Into<String>,
        headers: &Headers,
        query: &QueryParams,
    ) -> ApiResult<ApiResponse> {
        self.execute(&Endpoint::get(path), headers, query, None, RetryPolicy::none())
            .await
    }

    pub async fn head(
        &self,
        path: impl Into<String>,
        headers: &Headers,
        query: &QueryParams,
    ) -> ApiResult<ApiResponse> {
        self.execute(&Endpoint::head(path), headers, query, None, RetryPolicy::none())
            .await
    }

    pub async fn post(
        &self,
        path: impl Into<String>,
        headers: &Headers,
        query: &QueryParams,
        body: Option<Bytes>,
    ) -> ApiResult<ApiResponse> {
        self.execute(&Endpoint::post(path), headers, query, body, RetryPolicy::none())
            .await
    }

    pub async fn put(
        &self,
        path: impl Into<String>,
        headers: &Headers,
        query: &QueryParams,
        body: Option<Bytes>,
    ) -> ApiResult<ApiResponse> {
        self.execute(&Endpoint::put(path), headers, query, body, RetryPolicy::none())
            .await
    }

    pub async fn delete(
        &self,
        path: impl Into<String>,
        headers: &Headers,
        query: &QueryParams,
        body: Option<Bytes>,
    ) -> ApiResult<ApiResponse> {
        self.execute(&Endpoint::delete(path), headers, query, body, RetryPolicy::none())
            .await
    }

    pub async fn patch(
        &self,
        path: impl Into<String>,
        headers: &Headers,
        query: &QueryParams,
        body: Option<Bytes>,
    ) -> ApiResult<ApiResponse> {
        self.execute(&Endpoint::patch(path), headers, query, body, RetryPolicy::none())
            .await
    }

    /// Executes a request under the given retry policy.
    ///
    /// Malformed targets fail immediately regardless of the policy: the
    /// same input builds the same (broken) target every time.
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        headers: &Headers,
        query: &QueryParams,
        body: Option<Bytes>,
        retry: RetryPolicy,
    ) -> ApiResult<ApiResponse> {
        let mut retry = retry;
        let mut attempt: u32 = 1;
        loop {
            let span = info_span!(
                "apiwire.request",
                method = %endpoint.method(),
                path = endpoint.path(),
                attempt,
            );
            let result = self
                .attempt(endpoint, headers, query, body.clone())
                .instrument(span)
                .await;

            match result {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if error.kind == ErrorKind::MalformedTarget || !retry.should_retry(&error) {
                        return Err(error);
                    }
                    let delay = retry.delay_value();
                    warn!(
                        method = %endpoint.method(),
                        path = endpoint.path(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request",
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    retry = retry.next();
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        headers: &Headers,
        query: &QueryParams,
        body: Option<Bytes>,
    ) -> ApiResult<ApiResponse> {
        let merged = merge_headers(&self.default_headers, headers);
        let Some(uri) = build_request_target(endpoint.path(), query) else {
            return Err(ApiError::malformed_target(endpoint, &merged, query));
        };
        let body = if BODY_METHODS.contains(endpoint.method()) {
            body
        } else {
            None
        };

        debug!(
            curl = %curl_command(endpoint.method(), &uri.to_string(), &merged, body.as_ref()),
            "beginning request",
        );

        let request = TransportRequest {
            method: endpoint.method().clone(),
            uri: uri.clone(),
            headers: merged.clone(),
            body,
        };
        let response = match self.transport.perform(request).await {
            Ok(response) => response,
            Err(cause) => {
                let error = ApiError::transport(endpoint, uri.to_string(), &merged, query, cause);
                debug!(error = %error, "request failed");
                return Err(error);
            }
        };

        if response.status == StatusCode::NO_CONTENT {
            debug!(status = response.status.as_u16(), "request completed");
            return Ok(ApiResponse::new(response.status, response.headers, None));
        }
        if !response.status.is_success() {
            let error = ApiError::protocol(
                endpoint,
                uri.to_string(),
                response.status,
                &response.body,
                response.headers,
                &merged,
                query,
            );
            debug!(error = %error, "request failed");
            return Err(error);
        }

        debug!(
            status = response.status.as_u16(),
            body_len = response.body.len(),
            "request completed",
        );
        Ok(ApiResponse::new(
            response.status,
            response.headers,
            Some(response.body),
        ))
    }
}
