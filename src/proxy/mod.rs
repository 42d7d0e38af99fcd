//! The per-client proxy engine: dispatcher, session loop, TLS
//! interception, upstream acquisition, and the raw tunnel.

mod client;
mod server;
mod session;
mod tls;
mod tunnel;
mod upstream;

pub use client::ClientConnection;
pub use server::ProxyServer;
pub use tls::{is_tls_client_hello, TlsInterceptor};
pub use upstream::{server_connection_count, Scheme, UpstreamConnection, UpstreamConnector};
