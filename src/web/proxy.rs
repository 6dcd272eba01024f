// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The reverse proxy fallback (`## 4.10`'s final route, and every
//! "otherwise proxy" branch above it): strips hop-by-hop headers both
//! ways, rewrites cookies and redirects that would otherwise leak or point
//! back at the upstream host, and relays the body as a stream rather than
//! buffering it.

use crate::body::{self, Body};
use bytes::Bytes;
use futures::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Rewrites one `Set-Cookie` value: drops `Domain=...`, drops `Secure`,
/// and forces `SameSite=Lax` (replacing whatever value was present, or
/// appending it if absent).
fn rewrite_set_cookie(value: &str) -> String {
    let mut parts: Vec<String> = value
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| !p.to_ascii_lowercase().starts_with("domain="))
        .filter(|p| !p.eq_ignore_ascii_case("secure"))
        .filter(|p| !p.to_ascii_lowercase().starts_with("samesite="))
        .map(str::to_string)
        .collect();
    parts.push("SameSite=Lax".to_string());
    parts.join("; ")
}

/// Rewrites an absolute `Location` header pointing at `upstream_host` to a
/// path-relative one, leaving anything else untouched.
fn rewrite_location(value: &str, upstream: &url::Url) -> String {
    let Ok(parsed) = url::Url::parse(value) else {
        return value.to_string();
    };
    if parsed.host_str() != upstream.host_str() {
        return value.to_string();
    }
    let mut rel = parsed.path().to_string();
    if let Some(q) = parsed.query() {
        rel.push('?');
        rel.push_str(q);
    }
    rel
}

/// Proxies `req` to `upstream` verbatim (method, path, query, headers,
/// body), returning a `502` JSON error response on network failure rather
/// than propagating one.
pub(super) async fn proxy(
    http: &reqwest::Client,
    upstream: &url::Url,
    req: Request<hyper::body::Incoming>,
) -> Response<Body> {
    let (parts, incoming) = req.into_parts();
    let mut target = upstream.clone();
    target.set_path(parts.uri.path());
    target.set_query(parts.uri.query());

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return bad_gateway("unsupported method"),
    };

    let mut builder = http.request(method, target.clone()).timeout(DEFAULT_TIMEOUT);
    for (name, value) in parts.headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) || name == http::header::HOST {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let body_stream = http_body_util::BodyStream::new(incoming)
        .filter_map(|f| async move { f.ok().and_then(|f| f.into_data().ok()) });
    builder = builder.body(reqwest::Body::wrap_stream(body_stream));

    let resp = match builder.send().await {
        Ok(r) => r,
        Err(e) => return bad_gateway(&e.to_string()),
    };

    let status = resp.status();
    let mut out_headers = http::HeaderMap::new();
    for (name, value) in resp.headers().iter() {
        let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) else {
            continue;
        };
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        let Ok(mut value_str) = value.to_str() else {
            if let Ok(v) = HeaderValue::from_bytes(value.as_bytes()) {
                out_headers.append(name, v);
            }
            continue;
        };
        let rewritten;
        if name == http::header::SET_COOKIE {
            rewritten = rewrite_set_cookie(value_str);
            value_str = &rewritten;
        } else if name == http::header::LOCATION {
            rewritten = rewrite_location(value_str, upstream);
            value_str = &rewritten;
        }
        if let Ok(v) = HeaderValue::from_str(value_str) {
            out_headers.append(name, v);
        }
    }

    let stream = resp.bytes_stream().map(|r| r.map_err(|e| std::io::Error::other(e)));
    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = out_headers;
    builder.body(body::streaming(stream)).unwrap_or_else(|_| bad_gateway("malformed response"))
}

fn bad_gateway(message: &str) -> Response<Body> {
    let payload = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body::full(Bytes::from(payload)))
        .expect("hardcoded response should be valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_domain_secure_and_forces_samesite_lax() {
        let rewritten = rewrite_set_cookie("session=abc; Domain=example.com; Secure; Path=/");
        assert!(!rewritten.to_ascii_lowercase().contains("domain="));
        assert!(!rewritten.to_ascii_lowercase().contains("secure"));
        assert!(rewritten.contains("SameSite=Lax"));
        assert!(rewritten.contains("session=abc"));
        assert!(rewritten.contains("Path=/"));
    }

    #[test]
    fn rewrites_absolute_location_on_same_host() {
        let upstream: url::Url = "https://upstream.example".parse().unwrap();
        let rel = rewrite_location("https://upstream.example/watch?v=abc", &upstream);
        assert_eq!(rel, "/watch?v=abc");
    }

    #[test]
    fn leaves_location_on_other_host_untouched() {
        let upstream: url::Url = "https://upstream.example".parse().unwrap();
        let loc = "https://other.example/path";
        assert_eq!(rewrite_location(loc, &upstream), loc);
    }
}
