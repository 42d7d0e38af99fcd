//! Per-client session loop.
//!
//! One client connection runs exactly one loop: parse a request, fire
//! hooks, ensure a suitable upstream, forward the exchange, and decide
//! whether to continue. The loop is strictly sequential; the next request
//! is read only after the previous response has been fully forwarded.

use std::io::Write as _;
use std::sync::Arc;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ExternalProxy;
use crate::error::ProxyError;
use crate::hooks::{check_proxy_authorization, BeforeRequestArgs, ResponseEvent, SessionInfo};
use crate::http::{
    prepare_request_headers, BodyMode, ConnectRequest, HeaderCollection, Request, Response,
};
use crate::proxy::client::ClientConnection;
use crate::proxy::server::ServeContext;
use crate::proxy::tunnel;
use crate::proxy::upstream::UpstreamConnection;

/// Runs the session loop until the client is done, an error tears the
/// connection down, or a WebSocket upgrade hands both sockets to the raw
/// tunnel.
///
/// `first_line` carries a request line the dispatcher already consumed.
/// `https_hostname` is set when a TLS context exists: the CONNECT host
/// after interception, or the generic certificate name on a transparent
/// TLS endpoint. `authenticate` is true on explicit endpoints only.
pub(crate) async fn run_loop(
    ctx: &ServeContext,
    mut client: ClientConnection,
    mut first_line: Option<String>,
    connect: Option<ConnectRequest>,
    https_hostname: Option<String>,
    authenticate: bool,
) -> Result<(), ProxyError> {
    let mut upstream: Option<UpstreamConnection> = None;

    loop {
        // S0/S1: read and parse; a clean EOF or empty line ends the loop.
        let Some(mut request) = client.io().read_request_head(first_line.take()).await? else {
            return Ok(());
        };
        let url = build_url(&request, https_hostname.as_deref(), connect.as_ref())?;
        request.set_url(url);

        // S2: proxy auth, unless a prior CONNECT already authenticated.
        if authenticate
            && connect.is_none()
            && let Some(authenticator) = &ctx.authenticator
            && !check_proxy_authorization(request.headers(), authenticator.as_ref())
        {
            client
                .io()
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n",
                )
                .await?;
            return Err(ProxyError::AuthDenied);
        }

        // S3: parallel BeforeRequest fan-out, then lock.
        let args = Arc::new(BeforeRequestArgs::new(request));
        ctx.events.emit_before_request(&args).await;
        let mut request = BeforeRequestArgs::reclaim(args).await;
        if request.is_cancelled() {
            return Err(ProxyError::HookCancelled);
        }

        let host = request
            .url_host()
            .ok_or_else(|| ProxyError::MalformedRequest("request has no authority".to_string()))?
            .to_string();
        let port = request.url_port();

        // S4: reuse the upstream while the host is unchanged, otherwise
        // dispose it (decrementing the connection counter) and reconnect.
        let mut up = match upstream.take() {
            Some(existing) if existing.matches_host(&host) => existing,
            stale => {
                drop(stale);
                let proxy = resolve_proxy(ctx, &request, &host, port).await;
                if let Some(proxy) = &proxy {
                    debug!("session to {} uses upstream proxy {}", host, proxy);
                }
                ctx.connector
                    .create_client(&host, port, request.version, request.is_https(), proxy)
                    .await?
            }
        };

        // S5: WebSocket upgrades replay the head verbatim, then both
        // sockets belong to the raw tunnel and this loop is done.
        if request.upgrade_to_websocket() {
            up.io
                .write_all(request.raw_head())
                .await
                .map_err(ProxyError::UpstreamIo)?;
            up.io.flush().await.map_err(ProxyError::UpstreamIo)?;
            let (upstream_io, _guard) = up.into_parts();
            tunnel::relay(client.into_io(), upstream_io, &ctx.events).await;
            return Ok(());
        }

        // S6/S7
        let response = forward_exchange(ctx, &mut client, &mut up, &mut request).await?;
        upstream = Some(up);

        // S8
        if !response.keep_alive {
            return Ok(());
        }
    }
}

/// Reconstructs the absolute request URI.
///
/// Inside a TLS context the authority comes from the `Host` header,
/// falling back to the CONNECT authority. Explicit plaintext requests are
/// already absolute-form. Transparent plaintext requests require a `Host`
/// header; without one the request is malformed.
fn build_url(
    request: &Request,
    https_hostname: Option<&str>,
    connect: Option<&ConnectRequest>,
) -> Result<String, ProxyError> {
    if let Some(generic_host) = https_hostname {
        let authority = request
            .host()
            .map(str::to_string)
            .or_else(|| connect.map(|c| c.authority.clone()))
            .unwrap_or_else(|| generic_host.to_string());
        return Ok(format!("https://{}{}", authority, origin_target(request)));
    }
    if request.target.contains("://") {
        return Ok(request.target.clone());
    }
    let host = request.host().ok_or_else(|| {
        ProxyError::MalformedRequest("origin-form request without Host header".to_string())
    })?;
    Ok(format!("http://{}{}", host, origin_target(request)))
}

fn origin_target(request: &Request) -> String {
    if request.target.starts_with('/') {
        request.target.clone()
    } else {
        format!("/{}", request.target.trim_start_matches('/'))
    }
}

/// Effective upstream proxy for this session: the registered resolver
/// decides when present (returning none means direct), otherwise the
/// statically configured proxy for the scheme applies.
async fn resolve_proxy(
    ctx: &ServeContext,
    request: &Request,
    host: &str,
    port: u16,
) -> Option<ExternalProxy> {
    let info = SessionInfo {
        method: request.method.clone(),
        url: request.url().to_string(),
        host: host.to_string(),
        port,
        is_https: request.is_https(),
    };
    if let Some(resolved) = ctx.events.resolve_upstream_proxy(info).await {
        return resolved;
    }
    if request.is_https() {
        ctx.config.upstream_https_proxy.clone()
    } else {
        ctx.config.upstream_http_proxy.clone()
    }
}

/// Forwards one request/response exchange.
///
/// Precondition: the request is locked. Headers are prepared here, the
/// optional `Expect: 100-continue` interim is negotiated, the body is
/// streamed (or the hook-cached body re-compressed and written), and the
/// response is piped back per its framing.
async fn forward_exchange(
    ctx: &ServeContext,
    client: &mut ClientConnection,
    up: &mut UpstreamConnection,
    request: &mut Request,
) -> Result<Response, ProxyError> {
    prepare_request_headers(request.headers_mut());

    // A hook-provided body is re-compressed to the original encoding and
    // sent with a rewritten Content-Length. Never re-encoded as chunked.
    let cached_body = match request.body().map(<[u8]>::to_vec) {
        Some(body) => {
            let encoding = request
                .headers()
                .get("Content-Encoding")
                .map(|e| e.trim().to_ascii_lowercase());
            let bytes = recompress(&body, encoding.as_deref())?;
            request.headers_mut().remove("Transfer-Encoding");
            request
                .headers_mut()
                .set("Content-Length", &bytes.len().to_string());
            Some(bytes)
        }
        None => None,
    };

    let authority = authority_for(request);
    request.headers_mut().set("Host", &authority);

    // Absolute-form only when speaking plaintext through an upstream proxy.
    let absolute_form = !request.is_https() && up.via_proxy().is_some();
    let head = request.to_wire(absolute_form);
    up.io
        .write_all(&head)
        .await
        .map_err(ProxyError::UpstreamIo)?;
    up.io.flush().await.map_err(ProxyError::UpstreamIo)?;

    let mut expectation_failed = false;
    let mut early_response = None;
    if request.expect_continue() && ctx.config.enable_100_continue {
        let interim = up.io.read_response_head(request.version).await?;
        if interim.is_100_continue() {
            client
                .io()
                .write_all(format!("{} 100 Continue\r\n\r\n", request.version).as_bytes())
                .await?;
            client.io().flush().await?;
        } else if interim.status == 417 {
            client
                .io()
                .write_all(
                    format!("{} 417 Expectation Failed\r\n\r\n", request.version).as_bytes(),
                )
                .await?;
            client.io().flush().await?;
            expectation_failed = true;
        } else {
            // The upstream skipped the interim and answered outright.
            early_response = Some(interim);
        }
    }

    let forward_body = !expectation_failed && early_response.is_none();
    if let Some(bytes) = cached_body {
        if forward_body {
            up.io
                .write_all(&bytes)
                .await
                .map_err(ProxyError::UpstreamIo)?;
            up.io.flush().await.map_err(ProxyError::UpstreamIo)?;
        }
    } else if forward_body && request.has_body() {
        if request.is_chunked() {
            client.io().copy_chunked(&mut up.io).await?;
        } else if let Some(length) = request.content_length() {
            client
                .io()
                .copy_exact(&mut up.io, length)
                .await
                .map_err(ProxyError::Io)?;
        }
    }

    if expectation_failed {
        return Ok(Response {
            version: request.version,
            status: 417,
            reason: "Expectation Failed".to_string(),
            headers: HeaderCollection::new(),
            keep_alive: false,
            expectation_failed: true,
        });
    }

    let mut response = match early_response {
        Some(response) => response,
        None => {
            let mut response = up.io.read_response_head(request.version).await?;
            // Swallow stray interim responses outside the expect flow.
            // 101 is final: the connection is switching protocols.
            while (100..200).contains(&response.status) && response.status != 101 {
                response = up.io.read_response_head(request.version).await?;
            }
            response
        }
    };

    // A client that asked to close gets its wish regardless of the server.
    if request.headers().has_token("Connection", "close") {
        response.keep_alive = false;
    }

    let event = Arc::new(ResponseEvent {
        method: request.method.clone(),
        url: request.url().to_string(),
        status: response.status,
    });
    ctx.events.emit_before_response(&event).await;

    client.io().write_all(&response.to_wire()).await?;
    match response.body_mode(&request.method) {
        BodyMode::None => {}
        BodyMode::ContentLength(length) => {
            up.io
                .copy_exact(client.io(), length)
                .await
                .map_err(ProxyError::UpstreamIo)?;
        }
        BodyMode::Chunked => {
            up.io.copy_chunked(client.io()).await?;
        }
        BodyMode::CloseDelimited => {
            up.io
                .copy_to_end(client.io())
                .await
                .map_err(ProxyError::UpstreamIo)?;
            response.keep_alive = false;
        }
    }
    client.io().flush().await?;

    ctx.events.emit_after_response(&event).await;
    Ok(response)
}

/// Authority for the `Host` header: the URL host, with the port appended
/// only when it differs from the scheme default.
fn authority_for(request: &Request) -> String {
    let host = request.url_host().unwrap_or_default().to_string();
    let port = request.url_port();
    let default = if request.is_https() { 443 } else { 80 };
    if port == default {
        host
    } else {
        format!("{host}:{port}")
    }
}

/// Re-compresses a mutated body to match the original `Content-Encoding`.
/// Unknown encodings pass through unchanged.
fn recompress(body: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, ProxyError> {
    match encoding {
        Some("gzip") => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        Some("deflate") => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        _ => Ok(body.to_vec()),
    }
}
