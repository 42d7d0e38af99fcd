//! Embedder hook surface consumed by the session loop.
//!
//! Hook lists are read-only once the server starts. Subscribers of one
//! event run concurrently and the loop joins on all of them before moving
//! on, so a slow or cancelled subscriber never starves resource cleanup.

use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::{join_all, BoxFuture};
use tokio::sync::Mutex;

use crate::config::ExternalProxy;
use crate::error::ProxyError;
use crate::http::{ConnectRequest, HeaderCollection, Request};

type Subscriber<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, ()> + Send + Sync>;

fn subscriber<T, F, Fut>(f: F) -> Subscriber<T>
where
    F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |args| -> BoxFuture<'static, ()> { Box::pin(f(args)) })
}

/// Arguments seen by `BeforeRequest` subscribers.
///
/// All subscribers share one instance; mutation goes through the request's
/// lock-checked setters, so a subscriber that stashes the `Arc` and fires
/// late is rejected instead of corrupting an in-flight exchange.
pub struct BeforeRequestArgs {
    request: Mutex<Request>,
}

impl BeforeRequestArgs {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request: Mutex::new(request),
        }
    }

    /// Exclusive access to the request.
    pub async fn request(&self) -> tokio::sync::MutexGuard<'_, Request> {
        self.request.lock().await
    }

    pub(crate) fn into_request(self) -> Request {
        self.request.into_inner()
    }

    /// Takes the request back out after fan-out, locking it first so any
    /// stashed reference is rejected from then on.
    pub(crate) async fn reclaim(args: Arc<Self>) -> Request {
        args.request.lock().await.lock();
        match Arc::try_unwrap(args) {
            Ok(args) => args.into_request(),
            Err(shared) => shared.request.lock().await.clone(),
        }
    }
}

/// A CONNECT handshake observed on an explicit endpoint.
pub struct ConnectEvent {
    pub connect: ConnectRequest,
    /// Status sent to the client; meaningful on the response event.
    pub status: u16,
}

/// A completed or in-flight exchange, for the observational response hooks.
pub struct ResponseEvent {
    pub method: String,
    pub url: String,
    pub status: u16,
}

/// Identity of the session, handed to the upstream-proxy resolvers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub method: String,
    pub url: String,
    pub host: String,
    pub port: u16,
    pub is_https: bool,
}

type ProxyResolver =
    Arc<dyn Fn(SessionInfo) -> BoxFuture<'static, Option<ExternalProxy>> + Send + Sync>;

/// Hook registry, immutable once the server starts.
#[derive(Default)]
pub struct ProxyEvents {
    tunnel_connect_request: Vec<Subscriber<ConnectEvent>>,
    tunnel_connect_response: Vec<Subscriber<ConnectEvent>>,
    before_request: Vec<Subscriber<BeforeRequestArgs>>,
    before_response: Vec<Subscriber<ResponseEvent>>,
    after_response: Vec<Subscriber<ResponseEvent>>,
    http_proxy_resolver: Option<ProxyResolver>,
    https_proxy_resolver: Option<ProxyResolver>,
    on_error: Vec<Arc<dyn Fn(&ProxyError) + Send + Sync>>,
    data_sent: Vec<Arc<dyn Fn(usize) + Send + Sync>>,
    data_received: Vec<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl ProxyEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tunnel_connect_request<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<ConnectEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tunnel_connect_request.push(subscriber(f));
    }

    pub fn on_tunnel_connect_response<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<ConnectEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tunnel_connect_response.push(subscriber(f));
    }

    pub fn on_before_request<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<BeforeRequestArgs>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.before_request.push(subscriber(f));
    }

    pub fn on_before_response<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<ResponseEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.before_response.push(subscriber(f));
    }

    pub fn on_after_response<F, Fut>(&mut self, f: F)
    where
        F: Fn(Arc<ResponseEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_response.push(subscriber(f));
    }

    /// Per-request upstream proxy for plaintext HTTP targets. Returning
    /// `None` means direct (or the statically configured proxy).
    pub fn set_http_proxy_resolver<F, Fut>(&mut self, f: F)
    where
        F: Fn(SessionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ExternalProxy>> + Send + 'static,
    {
        self.http_proxy_resolver = Some(Arc::new(
            move |info| -> BoxFuture<'static, Option<ExternalProxy>> { Box::pin(f(info)) },
        ));
    }

    /// Per-request upstream proxy for HTTPS targets.
    pub fn set_https_proxy_resolver<F, Fut>(&mut self, f: F)
    where
        F: Fn(SessionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ExternalProxy>> + Send + 'static,
    {
        self.https_proxy_resolver = Some(Arc::new(
            move |info| -> BoxFuture<'static, Option<ExternalProxy>> { Box::pin(f(info)) },
        ));
    }

    /// Terminal error sink.
    pub fn on_error<F>(&mut self, f: F)
    where
        F: Fn(&ProxyError) + Send + Sync + 'static,
    {
        self.on_error.push(Arc::new(f));
    }

    /// Observes bytes relayed client-to-upstream through a raw tunnel.
    pub fn on_data_sent<F>(&mut self, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.data_sent.push(Arc::new(f));
    }

    /// Observes bytes relayed upstream-to-client through a raw tunnel.
    pub fn on_data_received<F>(&mut self, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.data_received.push(Arc::new(f));
    }

    async fn emit<T>(subscribers: &[Subscriber<T>], args: &Arc<T>) {
        if subscribers.is_empty() {
            return;
        }
        join_all(subscribers.iter().map(|s| s(Arc::clone(args)))).await;
    }

    pub(crate) async fn emit_tunnel_connect_request(&self, args: &Arc<ConnectEvent>) {
        Self::emit(&self.tunnel_connect_request, args).await;
    }

    pub(crate) async fn emit_tunnel_connect_response(&self, args: &Arc<ConnectEvent>) {
        Self::emit(&self.tunnel_connect_response, args).await;
    }

    pub(crate) async fn emit_before_request(&self, args: &Arc<BeforeRequestArgs>) {
        Self::emit(&self.before_request, args).await;
    }

    pub(crate) async fn emit_before_response(&self, args: &Arc<ResponseEvent>) {
        Self::emit(&self.before_response, args).await;
    }

    pub(crate) async fn emit_after_response(&self, args: &Arc<ResponseEvent>) {
        Self::emit(&self.after_response, args).await;
    }

    pub(crate) async fn resolve_upstream_proxy(
        &self,
        info: SessionInfo,
    ) -> Option<Option<ExternalProxy>> {
        let resolver = if info.is_https {
            self.https_proxy_resolver.as_ref()?
        } else {
            self.http_proxy_resolver.as_ref()?
        };
        Some(resolver(info).await)
    }

    pub(crate) fn emit_error(&self, error: &ProxyError) {
        for hook in &self.on_error {
            hook(error);
        }
    }

    pub(crate) fn emit_data_sent(&self, bytes: usize) {
        for hook in &self.data_sent {
            hook(bytes);
        }
    }

    pub(crate) fn emit_data_received(&self, bytes: usize) {
        for hook in &self.data_received {
            hook(bytes);
        }
    }
}

/// Credential check for explicit-mode clients.
pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Single static credential pair.
pub struct BasicProxyAuthenticator {
    username: String,
    password: String,
}

impl BasicProxyAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl ProxyAuthenticator for BasicProxyAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }
}

/// Validates a `Proxy-Authorization: Basic ...` header against the
/// authenticator. Missing or undecodable credentials deny.
pub(crate) fn check_proxy_authorization(
    headers: &HeaderCollection,
    authenticator: &dyn ProxyAuthenticator,
) -> bool {
    let Some(value) = headers.get("Proxy-Authorization") else {
        return false;
    };
    let Some(encoded) = value.trim().strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((username, password)) => authenticator.authenticate(username, password),
        None => false,
    }
}
