//! Error taxonomy for the proxy core.
//!
//! Every error is caught at the session-loop boundary; none propagate out
//! of a client task. Terminal errors are reported through the embedder's
//! exception hook before the connection is torn down.

use thiserror::Error;

use crate::ca::CaError;

/// Errors that can occur while serving a client connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Clean EOF on a request-line read. Ends the session silently.
    #[error("client closed the connection")]
    ClientClosed,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Proxy authentication was required and denied.
    #[error("proxy authentication denied")]
    AuthDenied,

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(#[source] std::io::Error),

    /// Connect, DNS, or TLS failure before the upstream was usable.
    #[error("upstream unavailable for {host}: {reason}")]
    UpstreamUnavailable { host: String, reason: String },

    /// Read/write failure after the upstream connection was up.
    #[error("upstream I/O failed: {0}")]
    UpstreamIo(#[source] std::io::Error),

    /// A `BeforeRequest` hook cancelled the request. Not reported.
    #[error("request cancelled by hook")]
    HookCancelled,

    /// Mutation attempted after the request was locked for dispatch.
    #[error("request is locked")]
    RequestLocked,

    #[error("certificate error: {0}")]
    Certificate(#[from] CaError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether this error should be handed to the exception hook.
    ///
    /// Clean closes and hook cancellations end the session without a
    /// report; everything else is surfaced to the embedder.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, ProxyError::ClientClosed | ProxyError::HookCancelled)
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
