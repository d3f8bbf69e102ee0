//! HTTP serving: protocol negotiation, the per-connection codec loop and request handlers.
//!
//! The stack for one connection is
//! [`HttpNegotiator`] → [`HttpCoreService`] → handler chain. The negotiator decides between
//! HTTP/1.1 and HTTP/2 from the TLS-ALPN result or, on cleartext connections, from the first
//! bytes on the wire ([`upgrade`]). The core service then runs the matching codec and feeds
//! every complete request to the handler chain.
use http::{header, HeaderValue, Response, StatusCode};
use monoio_http::common::body::FixedBody;

pub use self::{
    core::{HttpCoreService, Keepalive},
    negotiate::{HttpNegotiator, NegotiateError, Transport, TransportInfo},
};
pub mod handlers;
pub mod upgrade;

mod core;
mod negotiate;

pub const CLOSE: &str = "close";
pub const KEEPALIVE: &str = "Keep-Alive";
#[allow(clippy::declare_interior_mutable_const)]
pub const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
#[allow(clippy::declare_interior_mutable_const)]
pub const KEEPALIVE_VALUE: HeaderValue = HeaderValue::from_static(KEEPALIVE);

/// Size limits applied before a request reaches the handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpLimits {
    /// Largest HTTP/1.1 request body accepted; larger declared bodies get `413`.
    pub max_content_length: usize,
    /// Largest request head buffered while looking for an `h2c` upgrade offer.
    pub max_head_size: usize,
}

impl HttpLimits {
    pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 100 * 1024;
    pub const DEFAULT_MAX_HEAD_SIZE: usize = 8 * 1024;
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_content_length: Self::DEFAULT_MAX_CONTENT_LENGTH,
            max_head_size: Self::DEFAULT_MAX_HEAD_SIZE,
        }
    }
}

/// An empty response with `status_code`, optionally asking the client to close.
pub fn generate_response<B: FixedBody>(status_code: StatusCode, close: bool) -> Response<B> {
    let mut resp = Response::new(B::fixed_body(None));
    *resp.status_mut() = status_code;
    let headers = resp.headers_mut();
    if close {
        headers.insert(header::CONNECTION, CLOSE_VALUE);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    resp
}

#[cfg(test)]
mod tests {
    use monoio_http::common::body::HttpBody;

    use super::*;

    #[test]
    fn error_response_headers() {
        let resp: Response<HttpBody> = generate_response(StatusCode::PAYLOAD_TOO_LARGE, true);
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(resp.headers()[header::CONNECTION], CLOSE);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "0");

        let resp: Response<HttpBody> = generate_response(StatusCode::INTERNAL_SERVER_ERROR, false);
        assert!(resp.headers().get(header::CONNECTION).is_none());
    }

    #[test]
    fn default_limits() {
        let limits = HttpLimits::default();
        assert_eq!(limits.max_content_length, 102_400);
        assert_eq!(limits.max_head_size, 8192);
    }
}
