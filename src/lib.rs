//! Intercepting HTTP/HTTPS proxy core.
//!
//! This crate provides the per-client engine of a man-in-the-middle
//! proxy: it accepts client TCP connections, parses HTTP/1.x requests,
//! transparently intercepts TLS by minting server certificates on demand,
//! and pumps request/response sessions to the origin or through an
//! upstream proxy.
//!
//! # Architecture
//!
//! Each accepted client runs as one task:
//! 1. The dispatcher tells `CONNECT` handshakes from plain requests
//!    (explicit endpoints), or terminates TLS immediately (transparent
//!    endpoints).
//! 2. On `CONNECT`, the first client byte is peeked: a TLS ClientHello is
//!    answered with a certificate minted for the wildcard-normalized
//!    hostname; anything else is relayed opaquely.
//! 3. The session loop parses requests, fires embedder hooks, reuses one
//!    upstream connection per host, negotiates `Expect: 100-continue`,
//!    streams fixed-length and chunked bodies, and hands WebSocket
//!    upgrades to a raw byte tunnel.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wiretap::{CaState, Endpoint, ProxyConfig, ProxyEvents, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wiretap::ProxyError> {
//!     let config = ProxyConfig {
//!         endpoints: vec![Endpoint::Explicit {
//!             listen: "127.0.0.1:8080".parse().unwrap(),
//!         }],
//!         ..Default::default()
//!     };
//!     let ca = Arc::new(CaState::generate()?);
//!     let server = ProxyServer::bind(config, ProxyEvents::new(), ca).await?;
//!     server.run().await
//! }
//! ```

pub mod ca;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod proxy;

pub use ca::{CaState, CertCache};
pub use config::{Endpoint, ExternalProxy, ProxyConfig, TlsVersion};
pub use error::ProxyError;
pub use hooks::{
    BasicProxyAuthenticator, BeforeRequestArgs, ConnectEvent, ProxyAuthenticator, ProxyEvents,
    ResponseEvent, SessionInfo,
};
pub use http::{ConnectRequest, HeaderCollection, HttpVersion, Request, Response};
pub use proxy::{server_connection_count, ProxyServer};
