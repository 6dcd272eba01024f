// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The response body type used throughout the router: a boxed
//! [`http_body::Body`] so every handler can return a uniform type whether
//! it's serving a small JSON blob, a full file, or a streamed proxy
//! response.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use std::convert::Infallible;

pub type Body = BoxBody<Bytes, std::io::Error>;

pub fn empty() -> Body {
    Empty::new().map_err(|never: Infallible| match never {}).boxed()
}

pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Wraps a `futures::Stream` of `Result<Bytes, std::io::Error>` chunks into
/// a streaming body, used for file ranges and half-duplex proxy relays.
pub fn streaming<S>(stream: S) -> Body
where
    S: futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    use futures::StreamExt;
    let frames = stream.map(|r| r.map(Frame::data));
    StreamBody::new(frames).boxed()
}

/// Converts an incoming request body (or any other `http_body::Body` whose
/// error implements `std::error::Error`) into our boxed body type, used
/// when relaying the proxied request body upstream.
pub fn from_incoming<B>(body: B) -> Body
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    body.map_err(|e| std::io::Error::other(e)).boxed()
}
