use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::endpoint::Headers;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

// RFC 6455: the peer sent a close frame without a status code.
const NO_STATUS_CLOSURE: u16 = 1005;

/// The peer ended the connection with a close frame. Receivers surface this
/// as the receive error so the session can publish the actual close code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("connection closed by peer (code {close_code})")]
pub struct PeerClosed {
    pub close_code: u16,
}

/// One fully-built HTTP request as handed to the transport.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

/// The raw transport-level response, before executor classification.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The seam between the request executor and the wire. Production traffic
/// goes through [`HyperTransport`]; tests substitute deterministic fakes.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn perform(&self, request: TransportRequest) -> Result<TransportResponse, BoxError>;
}

#[derive(Debug, Error)]
pub enum TransportBuildError {
    #[error("failed to initialize tls backend: {message}")]
    Tls { message: String },
}

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// HTTP transport over the hyper legacy client with rustls (ring provider,
/// webpki roots), HTTP/1.1 + HTTP/2, and a per-request timeout.
pub struct HyperTransport {
    client: HttpsClient,
    request_timeout: Duration,
}

impl HyperTransport {
    pub fn new() -> Result<Self, TransportBuildError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> Result<Self, TransportBuildError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| TransportBuildError::Tls {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
            .build(https);
        Ok(Self {
            client,
            request_timeout,
        })
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn perform(&self, request: TransportRequest) -> Result<TransportResponse, BoxError> {
        let mut builder = http::Request::builder()
            .method(request.method)
            .uri(request.uri);
        for (name, value) in &request.headers {
            let name: HeaderName = name.parse()?;
            let value: HeaderValue = value.parse()?;
            builder = builder.header(name, value);
        }
        let request = builder.body(Full::new(request.body.unwrap_or_default()))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| BoxError::from("transport timed out"))??;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await?.to_bytes();
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// An outbound duplex frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

impl WsMessage {
    /// The frame payload as raw bytes, used for stub-rule fingerprinting.
    pub fn payload(&self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Self::Binary(payload) => payload.clone(),
        }
    }
}

/// The write half of a duplex connection.
#[async_trait]
pub trait WsSender: Send + 'static {
    async fn send(&mut self, message: WsMessage) -> Result<(), BoxError>;
    async fn ping(&mut self) -> Result<(), BoxError>;
    async fn close(&mut self, close_code: u16) -> Result<(), BoxError>;
}

/// The read half of a duplex connection. `Ok(None)` is a non-data frame
/// (ping, pong); an `Err` means the connection is no longer usable.
#[async_trait]
pub trait WsReceiver: Send + 'static {
    async fn receive(&mut self) -> Result<Option<Bytes>, BoxError>;
}

/// Opens duplex connections. A successful `open` performs the handshake and
/// hands back both halves; no traffic flows until the session starts its
/// loops.
#[async_trait]
pub trait WsTransport: Send + Sync + 'static {
    type Sender: WsSender;
    type Receiver: WsReceiver;

    async fn open(
        &self,
        uri: Uri,
        headers: Headers,
    ) -> Result<(Self::Sender, Self::Receiver), BoxError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production duplex transport over tokio-tungstenite with rustls.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteTransport;

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self
    }
}

pub struct TungsteniteSender {
    sink: SplitSink<WsStream, Message>,
}

pub struct TungsteniteReceiver {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl WsTransport for TungsteniteTransport {
    type Sender = TungsteniteSender;
    type Receiver = TungsteniteReceiver;

    async fn open(
        &self,
        uri: Uri,
        headers: Headers,
    ) -> Result<(Self::Sender, Self::Receiver), BoxError> {
        let mut request = uri.to_string().into_client_request()?;
        for (name, value) in &headers {
            let name: HeaderName = name.parse()?;
            let value: HeaderValue = value.parse()?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request).await?;
        let (sink, stream) = stream.split();
        Ok((TungsteniteSender { sink }, TungsteniteReceiver { stream }))
    }
}

#[async_trait]
impl WsSender for TungsteniteSender {
    async fn send(&mut self, message: WsMessage) -> Result<(), BoxError> {
        let frame = match message {
            WsMessage::Text(text) => Message::text(text),
            WsMessage::Binary(payload) => Message::binary(payload),
        };
        self.sink.send(frame).await.map_err(Into::into)
    }

    async fn ping(&mut self) -> Result<(), BoxError> {
        self.sink
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(Into::into)
    }

    async fn close(&mut self, close_code: u16) -> Result<(), BoxError> {
        let frame = CloseFrame {
            code: close_code.into(),
            reason: Utf8Bytes::default(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl WsReceiver for TungsteniteReceiver {
    async fn receive(&mut self) -> Result<Option<Bytes>, BoxError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Bytes::from(text))),
            Some(Ok(Message::Binary(payload))) => Ok(Some(payload)),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(None),
            Some(Ok(Message::Close(frame))) => {
                let close_code =
                    frame.map_or(NO_STATUS_CLOSURE, |frame| u16::from(frame.code));
                Err(Box::new(PeerClosed { close_code }))
            }
            Some(Err(source)) => Err(Box::new(source)),
            None => Err(BoxError::from("stream ended")),
        }
    }
}
