use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tracing::debug;

use crate::endpoint::{Endpoint, Headers, QueryParams};
use crate::response::ApiResponse;
use crate::retry::RetryPolicy;
use crate::rpc::RpcClient;
use crate::session::{ConnectionStatus, SessionConfig, SessionItem, SessionStream, WsSession};
use crate::transport::{HttpTransport, WsMessage, WsTransport};
use crate::util::lock_unpoisoned;
use crate::ApiResult;

const INJECTED_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum StubRuleError {
    #[error("stub payload is not valid json: {source}")]
    InvalidPayload {
        #[source]
        source: serde_json::Error,
    },
}

/// A request executor with a canned-response table in front of it.
///
/// Rules are keyed by endpoint (path + method). A hit returns the canned
/// response without touching the transport or the retry policy; a miss
/// forwards the call unchanged. Intended for deterministic SDK tests and
/// demo builds.
pub struct StubbedRpcClient<T: HttpTransport> {
    inner: RpcClient<T>,
    rules: Mutex<HashMap<Endpoint, ApiResponse>>,
}

impl<T: HttpTransport> StubbedRpcClient<T> {
    pub fn new(inner: RpcClient<T>) -> Self {
        Self {
            inner,
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a canned response for an endpoint, replacing any existing
    /// rule for the same endpoint.
    pub fn upsert(&self, endpoint: Endpoint, response: ApiResponse) {
        lock_unpoisoned(&self.rules).insert(endpoint, response);
    }

    /// Registers many rules at once; later entries win on duplicate keys.
    pub fn upsert_all(&self, rules: impl IntoIterator<Item = (Endpoint, ApiResponse)>) {
        let mut table = lock_unpoisoned(&self.rules);
        for (endpoint, response) in rules {
            table.insert(endpoint, response);
        }
    }

    pub fn remove(&self, endpoint: &Endpoint) {
        lock_unpoisoned(&self.rules).remove(endpoint);
    }

    pub fn remove_all(&self) {
        lock_unpoisoned(&self.rules).clear();
    }

    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        headers: &Headers,
        query: &QueryParams,
        body: Option<Bytes>,
        retry: RetryPolicy,
    ) -> ApiResult<ApiResponse> {
        if let Some(canned) = lock_unpoisoned(&self.rules).get(endpoint).cloned() {
            debug!(endpoint = %endpoint, status = canned.status().as_u16(), "response stubbed");
            return Ok(canned);
        }
        self.inner.execute(endpoint, headers, query, body, retry).await
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
}

/// Matches outbound duplex payloads by normalized-JSON fingerprint.
///
/// Both the fingerprint and the per-send comparison use the rule's own
/// ignored-key set, so volatile fields (timestamps, request ids) can be
/// excluded. Construction fails for payloads that are not valid JSON, a
/// rule that could never match anything.
#[derive(Clone, Debug)]
pub struct WsStubRule {
    fingerprint: String,
    incoming: Bytes,
    ignored_keys: BTreeSet<String>,
    deep: bool,
}

impl WsStubRule {
    pub fn new(
        outgoing: &[u8],
        incoming: impl Into<Bytes>,
        ignored_keys: impl IntoIterator<Item = impl Into<String>>,
        deep: bool,
    ) -> Result<Self, StubRuleError> {
        let ignored_keys: BTreeSet<String> =
            ignored_keys.into_iter().map(Into::into).collect();
        let fingerprint = crate::normalize::normalized_json_string(outgoing, &ignored_keys, deep)
            .map_err(|source| StubRuleError::InvalidPayload { source })?;
        Ok(Self {
            fingerprint,
            incoming: incoming.into(),
            ignored_keys,
            deep,
        })
    }

    fn matches(&self, payload: &[u8]) -> bool {
        crate::normalize::normalized_json_string(payload, &self.ignored_keys, self.deep)
            .is_ok_and(|fingerprint| fingerprint == self.fingerprint)
    }
}

/// A duplex session with send interception.
///
/// When an outbound payload matches a rule, the rule's canned incoming
/// payload is injected into the same stream real inbound messages arrive
/// on, and the transport never sees the send. Everything else, lifecycle
/// included, delegates to the wrapped session.
pub struct StubbedWsSession<T: WsTransport> {
    inner: WsSession<T>,
    rules: Mutex<Vec<WsStubRule>>,
    injected: broadcast::Sender<SessionItem>,
}

impl<T: WsTransport> StubbedWsSession<T> {
    pub fn new(inner: WsSession<T>) -> Self {
        let (injected, _) = broadcast::channel(INJECTED_CHANNEL_CAPACITY);
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
            injected,
        }
    }

    /// Replaces the whole rule list. Rules are tried in order; the first
    /// match wins.
    pub fn set_rules(&self, rules: Vec<WsStubRule>) {
        *lock_unpoisoned(&self.rules) = rules;
    }

    pub fn clear_rules(&self) {
        lock_unpoisoned(&self.rules).clear();
    }

    pub async fn configure(&self, config: SessionConfig) -> ApiResult<()> {
        self.inner.configure(config).await
    }

    pub async fn connect(&self) -> ApiResult<()> {
        self.inner.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub async fn send_text(&self, text: impl Into<String>) -> ApiResult<()> {
        self.send(WsMessage::Text(text.into())).await
    }

    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> ApiResult<()> {
        self.send(WsMessage::Binary(payload.into())).await
    }

    pub async fn send(&self, message: WsMessage) -> ApiResult<()> {
        let payload = message.payload();
        let canned = lock_unpoisoned(&self.rules)
            .iter()
            .find(|rule| rule.matches(&payload))
            .map(|rule| rule.incoming.clone());
        if let Some(incoming) = canned {
            debug!(payload_len = incoming.len(), "incoming message stubbed");
            let _ = self.injected.send(Ok(incoming));
            return Ok(());
        }
        self.inner.send(message).await
    }

    /// Real inbound traffic and injected stub payloads, merged into one
    /// stream.
    pub fn subscribe(&self) -> SessionStream {
        SessionStream::merged(self.inner.subscribe_receiver(), self.injected.subscribe())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_watch()
    }
}
