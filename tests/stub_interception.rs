use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri};

use apiwire::{
    ApiResponse, BoxError, Endpoint, Headers, HttpTransport, QueryParams, RpcClient,
    SessionConfig, StubbedRpcClient, StubbedWsSession, TransportRequest, TransportResponse,
    WsMessage, WsReceiver, WsSender, WsSession, WsStubRule, WsTransport,
};

struct CountingHttpTransport {
    calls: Arc<AtomicUsize>,
}

impl CountingHttpTransport {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl HttpTransport for CountingHttpTransport {
    async fn perform(&self, _request: TransportRequest) -> Result<TransportResponse, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TransportResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"live\":true}"),
        })
    }
}

struct SilentWsTransport {
    sent: Arc<Mutex<Vec<WsMessage>>>,
}

impl SilentWsTransport {
    fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sent(&self) -> Arc<Mutex<Vec<WsMessage>>> {
        Arc::clone(&self.sent)
    }
}

struct SilentWsSender {
    sent: Arc<Mutex<Vec<WsMessage>>>,
}

struct SilentWsReceiver;

#[async_trait]
impl WsTransport for SilentWsTransport {
    type Sender = SilentWsSender;
    type Receiver = SilentWsReceiver;

    async fn open(
        &self,
        _uri: Uri,
        _headers: Headers,
    ) -> Result<(Self::Sender, Self::Receiver), BoxError> {
        Ok((
            SilentWsSender {
                sent: Arc::clone(&self.sent),
            },
            SilentWsReceiver,
        ))
    }
}

#[async_trait]
impl WsSender for SilentWsSender {
    async fn send(&mut self, message: WsMessage) -> Result<(), BoxError> {
        self.sent.lock().expect("sent lock").push(message);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn close(&mut self, _close_code: u16) -> Result<(), BoxError> {
        Ok(())
    }
}

#[async_trait]
impl WsReceiver for SilentWsReceiver {
    async fn receive(&mut self) -> Result<Option<Bytes>, BoxError> {
        futures_util::future::pending().await
    }
}

fn connected_stub_session() -> (StubbedWsSession<SilentWsTransport>, Arc<Mutex<Vec<WsMessage>>>)
{
    let transport = SilentWsTransport::new();
    let sent = transport.sent();
    (StubbedWsSession::new(WsSession::new(transport)), sent)
}

async fn connect(session: &StubbedWsSession<SilentWsTransport>) {
    let config = SessionConfig::new("wss://feed.example.com/v1/stream")
        .ping_interval(Duration::from_secs(3600));
    session.configure(config).await.expect("configure");
    session.connect().await.expect("connect");
}

#[tokio::test]
async fn stubbed_endpoint_returns_the_canned_response_without_transport_calls() {
    let transport = CountingHttpTransport::new();
    let calls = transport.calls();
    let client = StubbedRpcClient::new(RpcClient::with_transport(transport));

    client.upsert(Endpoint::get("/stub"), ApiResponse::canned(201, "stubbed"));

    let response = client
        .get("/stub", &Headers::new(), &QueryParams::new())
        .await
        .expect("stub hit");

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.text_lossy(), "stubbed");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unmatched_endpoints_are_forwarded() {
    let transport = CountingHttpTransport::new();
    let calls = transport.calls();
    let client = StubbedRpcClient::new(RpcClient::with_transport(transport));

    client.upsert(Endpoint::get("/stub"), ApiResponse::canned(201, "stubbed"));

    let response = client
        .get("https://api.example.com/v1/live", &Headers::new(), &QueryParams::new())
        .await
        .expect("live request");

    assert_eq!(response.text_lossy(), "{\"live\":true}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stub_keying_distinguishes_methods_on_the_same_path() {
    let transport = CountingHttpTransport::new();
    let calls = transport.calls();
    let client = StubbedRpcClient::new(RpcClient::with_transport(transport));

    client.upsert(
        Endpoint::get("https://api.example.com/v1/items"),
        ApiResponse::canned(200, "reads"),
    );

    client
        .post(
            "https://api.example.com/v1/items",
            &Headers::new(),
            &QueryParams::new(),
            None,
        )
        .await
        .expect("post is not stubbed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upsert_replaces_and_remove_restores_forwarding() {
    let transport = CountingHttpTransport::new();
    let calls = transport.calls();
    let client = StubbedRpcClient::new(RpcClient::with_transport(transport));
    let endpoint = Endpoint::get("https://api.example.com/v1/items");

    client.upsert(endpoint.clone(), ApiResponse::canned(200, "first"));
    client.upsert(endpoint.clone(), ApiResponse::canned(200, "second"));
    let response = client
        .get("https://api.example.com/v1/items", &Headers::new(), &QueryParams::new())
        .await
        .expect("stub hit");
    assert_eq!(response.text_lossy(), "second");

    client.remove(&endpoint);
    client
        .get("https://api.example.com/v1/items", &Headers::new(), &QueryParams::new())
        .await
        .expect("forwarded");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn remove_all_clears_the_whole_table() {
    let transport = CountingHttpTransport::new();
    let calls = transport.calls();
    let client = StubbedRpcClient::new(RpcClient::with_transport(transport));

    client.upsert_all([
        (Endpoint::get("/a"), ApiResponse::canned(200, "a")),
        (Endpoint::get("/b"), ApiResponse::canned(200, "b")),
    ]);
    client.remove_all();

    client
        .get("https://api.example.com/a", &Headers::new(), &QueryParams::new())
        .await
        .expect("forwarded");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn ws_stub_rule_rejects_unparsable_payloads() {
    let result = WsStubRule::new(b"not json", Bytes::from_static(b"{}"), ["ts"], false);
    assert!(result.is_err());
}

#[tokio::test]
async fn matching_send_injects_the_canned_incoming_message() {
    let (session, sent) = connected_stub_session();
    connect(&session).await;
    let mut stream = session.subscribe();

    let rule = WsStubRule::new(
        br#"{"op":"subscribe","channel":"ticker","ts":1}"#,
        Bytes::from_static(br#"{"op":"subscribed","channel":"ticker"}"#),
        ["ts"],
        false,
    )
    .expect("rule builds");
    session.set_rules(vec![rule]);

    session
        .send_text(r#"{ "channel": "ticker", "op": "subscribe", "ts": 999 }"#)
        .await
        .expect("stubbed send");

    let item = stream.next().await.expect("injected item");
    assert_eq!(
        item.expect("data item"),
        Bytes::from_static(br#"{"op":"subscribed","channel":"ticker"}"#)
    );
    assert!(sent.lock().expect("sent lock").is_empty());
}

#[tokio::test]
async fn non_matching_sends_reach_the_transport() {
    let (session, sent) = connected_stub_session();
    connect(&session).await;

    let rule = WsStubRule::new(
        br#"{"op":"subscribe"}"#,
        Bytes::from_static(b"{}"),
        Vec::<String>::new(),
        false,
    )
    .expect("rule builds");
    session.set_rules(vec![rule]);

    session
        .send_text(r#"{"op":"unsubscribe"}"#)
        .await
        .expect("forwarded send");

    assert_eq!(sent.lock().expect("sent lock").len(), 1);
}

#[tokio::test]
async fn non_json_sends_are_never_intercepted() {
    let (session, sent) = connected_stub_session();
    connect(&session).await;

    let rule = WsStubRule::new(br#"{"op":"subscribe"}"#, Bytes::new(), ["ts"], false)
        .expect("rule builds");
    session.set_rules(vec![rule]);

    session.send_text("plain text frame").await.expect("forwarded");
    assert_eq!(sent.lock().expect("sent lock").len(), 1);
}

#[tokio::test]
async fn first_matching_rule_wins() {
    let (session, _sent) = connected_stub_session();
    connect(&session).await;
    let mut stream = session.subscribe();

    let first = WsStubRule::new(
        br#"{"op":"subscribe"}"#,
        Bytes::from_static(b"first"),
        Vec::<String>::new(),
        false,
    )
    .expect("rule builds");
    let second = WsStubRule::new(
        br#"{"op":"subscribe"}"#,
        Bytes::from_static(b"second"),
        Vec::<String>::new(),
        false,
    )
    .expect("rule builds");
    session.set_rules(vec![first, second]);

    session.send_text(r#"{"op":"subscribe"}"#).await.expect("send");
    let item = stream.next().await.expect("injected item");
    assert_eq!(item.expect("data item"), Bytes::from_static(b"first"));
}

#[tokio::test]
async fn clear_rules_restores_forwarding() {
    let (session, sent) = connected_stub_session();
    connect(&session).await;

    let rule = WsStubRule::new(
        br#"{"op":"subscribe"}"#,
        Bytes::from_static(b"{}"),
        Vec::<String>::new(),
        false,
    )
    .expect("rule builds");
    session.set_rules(vec![rule]);
    session.clear_rules();

    session.send_text(r#"{"op":"subscribe"}"#).await.expect("send");
    assert_eq!(sent.lock().expect("sent lock").len(), 1);
}

#[tokio::test]
async fn deep_ignored_keys_match_nested_differences() {
    let (session, sent) = connected_stub_session();
    connect(&session).await;
    let mut stream = session.subscribe();

    let rule = WsStubRule::new(
        br#"{"op":"order","payload":{"id":"a","ts":1}}"#,
        Bytes::from_static(b"ack"),
        ["ts"],
        true,
    )
    .expect("rule builds");
    session.set_rules(vec![rule]);

    session
        .send_text(r#"{"op":"order","payload":{"ts":42,"id":"a"}}"#)
        .await
        .expect("stubbed send");

    let item = stream.next().await.expect("injected item");
    assert_eq!(item.expect("data item"), Bytes::from_static(b"ack"));
    assert!(sent.lock().expect("sent lock").is_empty());
}
