//! Protocol-level abstractions shared by the HTTP services.
//!
//! A connection is tagged with exactly one [`HttpVersion`] when it is accepted. The tag is
//! produced either from the TLS-ALPN result ([`HttpVersion::from_alpn`]) or by the cleartext
//! upgrade path, and travels with the stream in an [`HttpAccept`] tuple.
//!
//! Request handlers implement [`HttpHandler`], which is blanket-implemented for every
//! [`Service`] taking `(Request<B>, CX)` and returning a [`ResponseWithContinue`].
use std::future::Future;

use http::{Request, Response};
use service_async::Service;

use crate::sealed::SealedT;

/// ALPN identifiers advertised by the server, in preference order.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [HttpVersion::H2_ALPN, HttpVersion::HTTP11_ALPN];

/// Application protocol selected for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http11,
    Http2,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl HttpVersion {
    pub const H2_ALPN: &'static [u8] = b"h2";
    pub const HTTP11_ALPN: &'static [u8] = b"http/1.1";

    /// Maps the protocol picked during the TLS handshake.
    ///
    /// No selection falls back to HTTP/1.1. Any identifier other than `h2` or `http/1.1`
    /// is rejected.
    pub fn from_alpn(protocol: Option<&[u8]>) -> Result<Self, UnknownProtocol> {
        match protocol {
            None => Ok(HttpVersion::Http11),
            Some(Self::H2_ALPN) => Ok(HttpVersion::Http2),
            Some(Self::HTTP11_ALPN) => Ok(HttpVersion::Http11),
            Some(other) => Err(UnknownProtocol(String::from_utf8_lossy(other).into_owned())),
        }
    }
}

/// Response paired with whether the connection may serve another request.
pub type ResponseWithContinue<B> = (Response<B>, bool);
/// Negotiated protocol, the stream speaking it and the connection context.
pub type HttpAccept<Stream, CX> = (HttpVersion, Stream, CX);

pub trait HttpHandler<CX, B>: SealedT<(CX, B)> {
    type Body;
    type Error;

    fn handle(
        &self,
        request: Request<B>,
        ctx: CX,
    ) -> impl Future<Output = Result<ResponseWithContinue<Self::Body>, Self::Error>>;
}

impl<T, CX, IB, OB> SealedT<(CX, IB)> for T where
    T: Service<(Request<IB>, CX), Response = ResponseWithContinue<OB>>
{
}

impl<T, CX, IB, OB> HttpHandler<CX, IB> for T
where
    T: Service<(Request<IB>, CX), Response = ResponseWithContinue<OB>>,
{
    type Body = OB;
    type Error = T::Error;

    async fn handle(
        &self,
        req: Request<IB>,
        ctx: CX,
    ) -> Result<ResponseWithContinue<OB>, Self::Error> {
        self.call((req, ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_h2_selects_http2() {
        assert_eq!(HttpVersion::from_alpn(Some(b"h2")), Ok(HttpVersion::Http2));
    }

    #[test]
    fn alpn_http11_and_missing_select_http11() {
        assert_eq!(
            HttpVersion::from_alpn(Some(b"http/1.1")),
            Ok(HttpVersion::Http11)
        );
        assert_eq!(HttpVersion::from_alpn(None), Ok(HttpVersion::Http11));
    }

    #[test]
    fn alpn_unknown_token_is_rejected() {
        let err = HttpVersion::from_alpn(Some(b"spdy/3.1")).unwrap_err();
        assert_eq!(err.to_string(), "unknown protocol: spdy/3.1");
    }

    #[test]
    fn advertised_order_prefers_h2() {
        assert_eq!(ALPN_PROTOCOLS, [b"h2".as_slice(), b"http/1.1".as_slice()]);
    }
}
