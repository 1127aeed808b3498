//! `apiwire` is an internal REST/RPC + WebSocket transport crate for API SDKs.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use apiwire::prelude::{Headers, QueryParams, RetryPolicy, RpcClient};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RpcClient::new()?.default_header("x-client-name", "my-sdk");
//!
//!     let response = client
//!         .execute(
//!             &apiwire::Endpoint::get("https://api.example.com/v1/items"),
//!             &Headers::new(),
//!             &QueryParams::from([("limit".to_owned(), "10".to_owned())]),
//!             None,
//!             RetryPolicy::backoff(2, Duration::from_millis(100), Duration::from_millis(800)),
//!         )
//!         .await?;
//!
//!     let item: Item = response.json()?;
//!     println!("fetched id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `RetryPolicy::backoff(...)` for SDK traffic; `none()` for writes
//!   without an idempotency guarantee.
//! - Keep one `WsSession` per upstream; it reconnects on its own after
//!   receive failures until `disconnect` is called.

mod endpoint;
mod error;
mod normalize;
mod response;
mod retry;
mod rpc;
mod session;
mod stub;
mod transport;
mod util;

pub use crate::endpoint::{Endpoint, Headers, QueryParams};
pub use crate::error::{ApiError, ErrorKind, Violation};
pub use crate::normalize::normalized_json_string;
pub use crate::response::ApiResponse;
pub use crate::retry::RetryPolicy;
pub use crate::rpc::RpcClient;
pub use crate::session::{
    resolver, ConnectionStatus, HeaderResolver, SessionConfig, SessionItem, SessionStream,
    WsSession,
};
pub use crate::stub::{StubRuleError, StubbedRpcClient, StubbedWsSession, WsStubRule};
pub use crate::transport::{
    BoxError, HttpTransport, HyperTransport, PeerClosed, TransportBuildError, TransportRequest,
    TransportResponse, TungsteniteTransport, WsMessage, WsReceiver, WsSender, WsTransport,
};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub mod prelude {
    pub use crate::{
        ApiError, ApiResponse, ApiResult, ConnectionStatus, Endpoint, ErrorKind, Headers,
        QueryParams, RetryPolicy, RpcClient, SessionConfig, StubbedRpcClient, StubbedWsSession,
        Violation, WsSession, WsStubRule,
    };
}
