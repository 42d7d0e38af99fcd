//! Proxy server: TCP accept loop and per-client dispatch.
//!
//! Each accepted connection runs as an independent task. Explicit
//! endpoints read the first request line to tell `CONNECT` handshakes from
//! plain requests; transparent endpoints optionally terminate TLS right
//! away. Both converge on the session loop.

use std::net::SocketAddr;
use std::sync::Arc;

use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::ca::{CaState, CertCache};
use crate::config::{Endpoint, InterceptionFilter, ProxyConfig};
use crate::error::ProxyError;
use crate::hooks::{check_proxy_authorization, ConnectEvent, ProxyAuthenticator, ProxyEvents};
use crate::http::message::parse_request_line;
use crate::http::ConnectRequest;
use crate::proxy::client::ClientConnection;
use crate::proxy::session;
use crate::proxy::tls::{is_tls_client_hello, TlsInterceptor};
use crate::proxy::tunnel;
use crate::proxy::upstream::UpstreamConnector;

/// Shared state for serving client connections.
pub(crate) struct ServeContext {
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) events: Arc<ProxyEvents>,
    pub(crate) connector: Arc<UpstreamConnector>,
    pub(crate) authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub(crate) filter: Arc<InterceptionFilter>,
    pub(crate) interceptor: Arc<TlsInterceptor>,
    pub(crate) cert_cache: Arc<CertCache>,
}

/// The intercepting proxy server.
pub struct ProxyServer {
    context: Arc<ServeContext>,
    listeners: Vec<(TcpListener, Endpoint)>,
}

impl ProxyServer {
    /// Binds every configured endpoint.
    pub async fn bind(
        config: ProxyConfig,
        events: ProxyEvents,
        ca: Arc<CaState>,
    ) -> Result<Self, ProxyError> {
        Self::bind_with_authenticator(config, events, ca, None).await
    }

    /// Binds with a proxy authenticator enforced on explicit endpoints.
    pub async fn bind_with_authenticator(
        config: ProxyConfig,
        events: ProxyEvents,
        ca: Arc<CaState>,
        authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    ) -> Result<Self, ProxyError> {
        if config.endpoints.is_empty() {
            return Err(ProxyError::Config("no endpoints configured".to_string()));
        }
        let filter = Arc::new(config.interception_filter()?);
        let cert_cache = Arc::new(CertCache::new(ca));
        let interceptor = Arc::new(TlsInterceptor::new(
            Arc::clone(&cert_cache),
            config.tls_versions(),
            config.buffer_size,
        ));
        let connector = Arc::new(UpstreamConnector::new(config.buffer_size));

        let mut listeners = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let listener = TcpListener::bind(endpoint.listen_addr()).await?;
            info!(
                "proxy listening on {} ({:?})",
                listener.local_addr()?,
                endpoint
            );
            listeners.push((listener, endpoint.clone()));
        }

        let context = Arc::new(ServeContext {
            config: Arc::new(config),
            events: Arc::new(events),
            connector,
            authenticator,
            filter,
            interceptor,
            cert_cache,
        });

        Ok(Self { context, listeners })
    }

    /// Bound addresses, in endpoint order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    /// The leaf certificate cache, for embedders that export the CA or
    /// inspect minting.
    pub fn cert_cache(&self) -> &Arc<CertCache> {
        &self.context.cert_cache
    }

    /// Accepts connections forever on every endpoint.
    pub async fn run(self) -> Result<(), ProxyError> {
        let mut tasks = Vec::with_capacity(self.listeners.len());
        for (listener, endpoint) in self.listeners {
            let context = Arc::clone(&self.context);
            tasks.push(tokio::spawn(accept_loop(context, listener, endpoint)));
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn accept_loop(context: Arc<ServeContext>, listener: TcpListener, endpoint: Endpoint) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                let context = Arc::clone(&context);
                let endpoint = endpoint.clone();
                tokio::spawn(handle_client(context, stream, peer, endpoint));
            }
            Err(e) => {
                warn!("accept error: {}", e);
            }
        }
    }
}

/// Serves one client connection to completion.
///
/// Every error is caught here; reportable ones go to the exception hook.
/// All connection resources are dropped by the time this returns.
async fn handle_client(
    context: Arc<ServeContext>,
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Endpoint,
) {
    let result = match &endpoint {
        Endpoint::Explicit { .. } => serve_explicit(&context, stream, peer).await,
        Endpoint::Transparent {
            tls_enabled,
            generic_cert_name,
            ..
        } => serve_transparent(&context, stream, peer, *tls_enabled, generic_cert_name).await,
    };
    if let Err(error) = result {
        if error.is_reportable() {
            context.events.emit_error(&error);
        }
        debug!("client {} finished: {}", peer, error);
    }
}

/// Explicit endpoint: `CONNECT` opens a tunnel or an intercepted TLS
/// session; anything else goes straight to the session loop.
async fn serve_explicit(
    ctx: &ServeContext,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let mut client = ClientConnection::new(stream, peer, ctx.config.buffer_size);
    let Some(line) = client.io().read_line().await? else {
        return Ok(());
    };
    if line.is_empty() {
        return Ok(());
    }
    let (method, target, version) = parse_request_line(&line)?;
    if method != "CONNECT" {
        return session::run_loop(ctx, client, Some(line), None, None, true).await;
    }

    let (host, port) = ConnectRequest::parse_authority(&target)?;
    let headers = client.io().read_headers().await?;
    let connect = ConnectRequest {
        authority: target,
        host,
        port,
        version,
        headers,
    };

    let event = Arc::new(ConnectEvent {
        connect: connect.clone(),
        status: 0,
    });
    ctx.events.emit_tunnel_connect_request(&event).await;

    let excluded = ctx.filter.is_excluded(&connect.host);
    if !excluded
        && let Some(authenticator) = &ctx.authenticator
        && !check_proxy_authorization(&connect.headers, authenticator.as_ref())
    {
        client
            .io()
            .write_all(
                b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                  Proxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n",
            )
            .await?;
        let denied = Arc::new(ConnectEvent {
            connect,
            status: 407,
        });
        ctx.events.emit_tunnel_connect_response(&denied).await;
        return Err(ProxyError::AuthDenied);
    }

    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc2822)
        .unwrap_or_default();
    client
        .io()
        .write_all(
            format!(
                "{} 200 Connection established\r\nTimestamp: {}\r\n\r\n",
                connect.version, timestamp
            )
            .as_bytes(),
        )
        .await?;
    client.io().flush().await?;
    let established = Arc::new(ConnectEvent {
        connect: connect.clone(),
        status: 200,
    });
    ctx.events.emit_tunnel_connect_response(&established).await;

    // The peeked byte stays buffered for the TLS handshake.
    let first_byte = client.io().peek_byte().await?;
    let is_hello = first_byte.is_some_and(is_tls_client_hello);
    if excluded || !is_hello {
        debug!(
            "tunneling {} opaquely (excluded: {}, tls: {})",
            connect.authority, excluded, is_hello
        );
        let up = ctx
            .connector
            .create_client(&connect.host, connect.port, connect.version, false, None)
            .await?;
        let (upstream_io, _guard) = up.into_parts();
        tunnel::relay(client.into_io(), upstream_io, &ctx.events).await;
        return Ok(());
    }

    let intercepted = ctx
        .interceptor
        .accept(client.into_io(), &connect.host)
        .await?;
    let client = ClientConnection::resume_tls(intercepted, peer);
    let https_hostname = connect.host.clone();
    session::run_loop(ctx, client, None, Some(connect), Some(https_hostname), true).await
}

/// Transparent endpoint: optional immediate TLS accept with the fixed
/// generic certificate name (no SNI dispatch), then the session loop.
async fn serve_transparent(
    ctx: &ServeContext,
    stream: TcpStream,
    peer: SocketAddr,
    tls_enabled: bool,
    generic_cert_name: &str,
) -> Result<(), ProxyError> {
    let client = ClientConnection::new(stream, peer, ctx.config.buffer_size);
    if tls_enabled {
        let intercepted = ctx
            .interceptor
            .accept_with_cert_name(client.into_io(), generic_cert_name)
            .await?;
        let client = ClientConnection::resume_tls(intercepted, peer);
        session::run_loop(
            ctx,
            client,
            None,
            None,
            Some(generic_cert_name.to_string()),
            false,
        )
        .await
    } else {
        session::run_loop(ctx, client, None, None, None, false).await
    }
}
