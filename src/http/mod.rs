//! HTTP/1.x wire handling: line/header codec, message heads, and the
//! ordered header collection.

pub mod codec;
pub mod headers;
pub mod message;

pub use codec::{AsyncIo, BoxedIo, BufferedConn};
pub use headers::{prepare_request_headers, HeaderCollection};
pub use message::{BodyMode, ConnectRequest, HttpVersion, Request, Response};
