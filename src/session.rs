use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, Headers, QueryParams};
use crate::error::ApiError;
use crate::transport::{
    PeerClosed, TungsteniteTransport, WsMessage, WsReceiver, WsSender, WsTransport,
};
use crate::util::build_request_target;
use crate::ApiResult;

const NORMAL_CLOSURE: u16 = 1000;
const ABNORMAL_CLOSURE: u16 = 1006;
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// One item on the inbound stream: a payload in transport order, or the
/// error that ended the connection.
pub type SessionItem = Result<Bytes, ApiError>;

/// Resolves the handshake headers at (re)configure time, so short-lived
/// credentials are fresh on every reconnect.
pub type HeaderResolver = Arc<dyn Fn() -> BoxFuture<'static, Headers> + Send + Sync>;

/// Wraps an async closure into a [`HeaderResolver`].
pub fn resolver<F, Fut>(resolve: F) -> HeaderResolver
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Headers> + Send + 'static,
{
    Arc::new(move || Box::pin(resolve()))
}

/// Connection parameters for a duplex session, stored on `configure` and
/// replayed on every reconnect.
#[derive(Clone)]
pub struct SessionConfig {
    pub url_path: String,
    pub ping_interval: Duration,
    pub reconnect_interval: Duration,
    pub headers: HeaderResolver,
}

impl SessionConfig {
    pub fn new(url_path: impl Into<String>) -> Self {
        Self {
            url_path: url_path.into(),
            ping_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            headers: resolver(|| async { Headers::new() }),
        }
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn headers(mut self, headers: HeaderResolver) -> Self {
        self.headers = headers;
        self
    }
}

/// Equality compares the data fields; the header resolver is compared by
/// handle identity, two configs built from separate identical closures are
/// not equal.
impl PartialEq for SessionConfig {
    fn eq(&self, other: &Self) -> bool {
        self.url_path == other.url_path
            && self.ping_interval == other.ping_interval
            && self.reconnect_interval == other.reconnect_interval
            && Arc::ptr_eq(&self.headers, &other.headers)
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionConfig")
            .field("url_path", &self.url_path)
            .field("ping_interval", &self.ping_interval)
            .field("reconnect_interval", &self.reconnect_interval)
            .finish_non_exhaustive()
    }
}

/// Observable connection lifecycle. `Initial` until the first connect;
/// `Disconnected` carries the close code: 1000 after an explicit
/// disconnect, the peer's code (or 1006 when the connection just broke)
/// after a receive failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Initial,
    Connected,
    Disconnected { close_code: u16 },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Derives the published close code from a receive failure.
pub(crate) fn observed_close_code(cause: &(dyn std::error::Error + Send + Sync + 'static)) -> u16 {
    cause
        .downcast_ref::<PeerClosed>()
        .map_or(ABNORMAL_CLOSURE, |closed| closed.close_code)
}

type SharedSender<S> = Arc<Mutex<S>>;

struct SessionState<S, R> {
    config: Option<SessionConfig>,
    pending: Option<(S, R)>,
    sender: Option<SharedSender<S>>,
    keep_connected: bool,
    epoch: u64,
    receive_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
}

impl<S, R> SessionState<S, R> {
    fn new() -> Self {
        Self {
            config: None,
            pending: None,
            sender: None,
            keep_connected: false,
            epoch: 0,
            receive_task: None,
            keepalive_task: None,
        }
    }
}

struct Shared<T: WsTransport> {
    transport: T,
    state: Mutex<SessionState<T::Sender, T::Receiver>>,
    messages: broadcast::Sender<SessionItem>,
    status: watch::Sender<ConnectionStatus>,
}

/// A persistent duplex session over one WebSocket connection at a time.
///
/// Lifecycle: `configure` stores the config and opens a handle, `connect`
/// starts the receive and keepalive loops, `disconnect` tears everything
/// down. A failure inside the receive loop publishes the error and then
/// reconnects with the stored config, indefinitely, until the caller
/// disconnects. All state transitions go through one async mutex, so
/// lifecycle calls serialize. The live sender sits behind its own lock;
/// the session gate is never held across wire I/O on it, so a stalled
/// peer cannot block `disconnect`.
pub struct WsSession<T: WsTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: WsTransport> Clone for WsSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for WsSession<TungsteniteTransport> {
    fn default() -> Self {
        Self::new(TungsteniteTransport::new())
    }
}

impl<T: WsTransport> WsSession<T> {
    pub fn new(transport: T) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Initial);
        Self {
            shared: Arc::new(Shared {
                transport,
                state: Mutex::new(SessionState::new()),
                messages,
                status,
            }),
        }
    }

    /// Stores the config and opens a transport handle without starting
    /// traffic. Rejected while a connection is live; `disconnect` first.
    pub async fn configure(&self, config: SessionConfig) -> ApiResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.keep_connected && state.sender.is_some() {
            return Err(ApiError::not_configured(
                config.url_path,
                "configure rejected while connected",
            ));
        }

        let handle = self.open_handle(&config).await?;
        debug!(url_path = %config.url_path, "session configured");
        state.pending = Some(handle);
        state.config = Some(config);
        Ok(())
    }

    /// Starts traffic on the handle opened by `configure`: publishes
    /// `Connected` and spawns the receive and keepalive loops.
    pub async fn connect(&self) -> ApiResult<()> {
        let mut state = self.shared.state.lock().await;
        let Some(config) = state.config.clone() else {
            return Err(ApiError::not_configured("", "connect before configure"));
        };
        let Some((sender, receiver)) = state.pending.take() else {
            return Err(ApiError::not_configured(
                config.url_path,
                "no configured handle to connect",
            ));
        };

        debug!(url_path = %config.url_path, "session connected");
        self.start_traffic(&mut state, config.ping_interval, sender, receiver);
        Ok(())
    }

    /// Tears the session down: stops both loops, closes the handle with a
    /// normal closure, publishes `Disconnected`. Idempotent, any state.
    pub async fn disconnect(&self) {
        self.teardown(true, NORMAL_CLOSURE).await;
    }

    async fn open_handle(&self, config: &SessionConfig) -> ApiResult<(T::Sender, T::Receiver)> {
        let Some(uri) = build_request_target(&config.url_path, &QueryParams::new()) else {
            return Err(ApiError::malformed_target(
                &Endpoint::get(config.url_path.clone()),
                &Headers::new(),
                &QueryParams::new(),
            ));
        };

        let headers = (config.headers)().await;
        self.shared
            .transport
            .open(uri, headers)
            .await
            .map_err(|cause| ApiError::session_transport(config.url_path.clone(), cause))
    }

    fn start_traffic(
        &self,
        state: &mut SessionState<T::Sender, T::Receiver>,
        ping_interval: Duration,
        sender: T::Sender,
        receiver: T::Receiver,
    ) {
        state.sender = Some(Arc::new(Mutex::new(sender)));
        state.keep_connected = true;
        self.shared.status.send_replace(ConnectionStatus::Connected);

        state.receive_task = Some(tokio::spawn(receive_loop(self.clone(), receiver)));
        state.keepalive_task = Some(tokio::spawn(keepalive_loop(self.clone(), ping_interval)));
    }

    /// `explicit` marks a caller-initiated disconnect; only those bump the
    /// epoch and thereby cancel an in-flight reconnect.
    async fn teardown(&self, explicit: bool, close_code: u16) {
        let (sender, receive_task, keepalive_task) = {
            let mut state = self.shared.state.lock().await;
            state.keep_connected = false;
            if explicit {
                state.epoch += 1;
            }
            state.pending = None;
            (
                state.sender.take(),
                state.receive_task.take(),
                state.keepalive_task.take(),
            )
        };

        // Awaiting the aborted handles guarantees both loops have released
        // the sender lock before the close frame goes out.
        if let Some(task) = receive_task {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = keepalive_task {
            task.abort();
            let _ = task.await;
        }

        if let Some(sender) = sender {
            let mut sender = sender.lock().await;
            if let Err(error) = sender.close(NORMAL_CLOSURE).await {
                debug!(error = %error, "close frame not delivered");
            }
        }

        // Bound separately: the borrow guard blocks the watch writer.
        let previous = { self.shared.status.borrow().clone() };
        if explicit {
            // An explicit disconnect always settles on a normal closure,
            // even when an error-driven teardown published first.
            if previous != ConnectionStatus::Initial {
                self.shared
                    .status
                    .send_replace(ConnectionStatus::Disconnected { close_code });
            }
        } else if previous.is_connected() {
            self.shared
                .status
                .send_replace(ConnectionStatus::Disconnected { close_code });
        }
        debug!(close_code, "session disconnected");
    }

    pub async fn send_text(&self, text: impl Into<String>) -> ApiResult<()> {
        self.send(WsMessage::Text(text.into())).await
    }

    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> ApiResult<()> {
        self.send(WsMessage::Binary(payload.into())).await
    }

    /// Sends one outbound frame. Fails without touching the transport when
    /// no connection is live.
    pub async fn send(&self, message: WsMessage) -> ApiResult<()> {
        let (sender, url_path) = {
            let state = self.shared.state.lock().await;
            let url_path = state
                .config
                .as_ref()
                .map(|config| config.url_path.clone())
                .unwrap_or_default();
            match &state.sender {
                Some(sender) => (Arc::clone(sender), url_path),
                None => return Err(ApiError::not_connected(url_path)),
            }
        };

        let mut sender = sender.lock().await;
        sender
            .send(message)
            .await
            .map_err(|cause| ApiError::session_transport(url_path, cause))
    }

    /// Inbound messages and connection errors, in transport order.
    pub fn subscribe(&self) -> SessionStream {
        SessionStream::single(self.shared.messages.subscribe())
    }

    pub(crate) fn subscribe_receiver(&self) -> broadcast::Receiver<SessionItem> {
        self.shared.messages.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// A watch handle for status transitions; the current value is visible
    /// immediately.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    // Boxed to break the receive_loop -> reconnect -> start_traffic ->
    // receive_loop future cycle, which is otherwise unprovable as `Send`.
    fn reconnect(&self, close_code: u16) -> BoxFuture<'_, ()> {
        Box::pin(self.reconnect_inner(close_code))
    }

    async fn reconnect_inner(&self, close_code: u16) {
        // Epoch and keep-connected are read in one critical section; any
        // explicit disconnect from here on bumps the epoch and cancels the
        // resume.
        let (config, resume_epoch) = {
            let state = self.shared.state.lock().await;
            if !state.keep_connected {
                debug!("reconnect skipped, session no longer keeps the connection");
                return;
            }
            let Some(config) = state.config.clone() else {
                return;
            };
            (config, state.epoch)
        };

        self.teardown(false, close_code).await;

        if !config.reconnect_interval.is_zero() {
            tokio::time::sleep(config.reconnect_interval).await;
        }

        warn!(url_path = %config.url_path, "reconnecting session");
        if let Err(error) = self.resume(config, resume_epoch).await {
            warn!(error = %error, "reconnect failed");
        }
    }

    /// Re-opens and restarts traffic in a single critical section, so an
    /// explicit disconnect can never land between the epoch check and the
    /// new handle going live.
    async fn resume(&self, config: SessionConfig, resume_epoch: u64) -> ApiResult<()> {
        let mut state = self.shared.state.lock().await;
        if state.epoch != resume_epoch {
            debug!("reconnect cancelled by explicit disconnect");
            return Ok(());
        }

        let (sender, receiver) = self.open_handle(&config).await?;
        let ping_interval = config.ping_interval;
        state.config = Some(config);
        self.start_traffic(&mut state, ping_interval, sender, receiver);
        Ok(())
    }
}

async fn receive_loop<T: WsTransport>(session: WsSession<T>, mut receiver: T::Receiver) {
    loop {
        match receiver.receive().await {
            Ok(Some(payload)) => {
                debug!(payload_len = payload.len(), "message received");
                let _ = session.shared.messages.send(Ok(payload));
            }
            Ok(None) => {}
            Err(cause) => {
                let close_code = observed_close_code(cause.as_ref());
                let url_path = {
                    let state = session.shared.state.lock().await;
                    state
                        .config
                        .as_ref()
                        .map(|config| config.url_path.clone())
                        .unwrap_or_default()
                };
                let error = ApiError::disconnected(url_path, cause);
                warn!(error = %error, close_code, "receive failed");
                let _ = session.shared.messages.send(Err(error));

                // The receive task itself gets aborted during disconnect, so
                // the reconnect runs detached.
                tokio::spawn(async move { session.reconnect(close_code).await });
                return;
            }
        }
    }
}

async fn keepalive_loop<T: WsTransport>(session: WsSession<T>, ping_interval: Duration) {
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ticker = tokio::time::interval_at(start, ping_interval);
    loop {
        ticker.tick().await;
        // The session gate is released before the ping goes out; a stalled
        // peer must not block disconnect or send.
        let sender = {
            let state = session.shared.state.lock().await;
            if !state.keep_connected || !session.shared.status.borrow().is_connected() {
                continue;
            }
            match &state.sender {
                Some(sender) => Arc::clone(sender),
                None => continue,
            }
        };

        let mut sender = sender.lock().await;
        // Ping failures are logged only; the receive loop owns reconnects.
        match sender.ping().await {
            Ok(()) => debug!("ping"),
            Err(error) => debug!(error = %error, "ping failed"),
        }
    }
}

enum Polled {
    Primary(Result<SessionItem, RecvError>),
    Injected(Result<SessionItem, RecvError>),
}

/// A pull-based view over the session's inbound broadcast, optionally
/// merged with a second channel of injected (stubbed) messages.
pub struct SessionStream {
    primary: Option<broadcast::Receiver<SessionItem>>,
    injected: Option<broadcast::Receiver<SessionItem>>,
}

impl SessionStream {
    pub(crate) fn single(primary: broadcast::Receiver<SessionItem>) -> Self {
        Self {
            primary: Some(primary),
            injected: None,
        }
    }

    pub(crate) fn merged(
        primary: broadcast::Receiver<SessionItem>,
        injected: broadcast::Receiver<SessionItem>,
    ) -> Self {
        Self {
            primary: Some(primary),
            injected: Some(injected),
        }
    }

    /// The next inbound item, or `None` once every source is closed.
    /// Subscribers that fall behind the channel capacity skip the
    /// overwritten items and continue from the oldest retained one.
    pub async fn next(&mut self) -> Option<SessionItem> {
        loop {
            let polled = match (&mut self.primary, &mut self.injected) {
                (None, None) => return None,
                (Some(primary), None) => Polled::Primary(primary.recv().await),
                (None, Some(injected)) => Polled::Injected(injected.recv().await),
                (Some(primary), Some(injected)) => {
                    tokio::select! {
                        item = primary.recv() => Polled::Primary(item),
                        item = injected.recv() => Polled::Injected(item),
                    }
                }
            };

            match polled {
                Polled::Primary(Ok(item)) | Polled::Injected(Ok(item)) => return Some(item),
                Polled::Primary(Err(RecvError::Closed)) => self.primary = None,
                Polled::Injected(Err(RecvError::Closed)) => self.injected = None,
                Polled::Primary(Err(RecvError::Lagged(_)))
                | Polled::Injected(Err(RecvError::Lagged(_))) => {}
            }
        }
    }
}
