//! HTTP/1.x connection persistence.
//!
//! [`ConnectionReuseHandler`] decides whether a connection may serve another request after
//! the current one and reflects that decision in the `Connection` response header:
//!
//! - HTTP/1.1 stays open unless the client sent `Connection: close`. A closing response
//!   carries `Connection: close`.
//! - HTTP/1.0 stays open only when the client asked for `Connection: keep-alive`, and the
//!   response then confirms it with `Connection: Keep-Alive`.
//! - HTTP/2 streams always continue; persistence is owned by the HTTP/2 connection itself.
use greeter_core::http::{HttpHandler, ResponseWithContinue};
use http::{HeaderMap, HeaderValue, Request, Version};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Service,
};
use tracing::debug;

use crate::http::{CLOSE, CLOSE_VALUE, KEEPALIVE, KEEPALIVE_VALUE};

#[derive(Clone)]
pub struct ConnectionReuseHandler<H> {
    inner: H,
}

impl<H, CX, B> Service<(Request<B>, CX)> for ConnectionReuseHandler<H>
where
    H: HttpHandler<CX, B>,
{
    type Response = ResponseWithContinue<H::Body>;
    type Error = H::Error;

    async fn call(
        &self,
        (mut request, ctx): (Request<B>, CX),
    ) -> Result<Self::Response, Self::Error> {
        let version = request.version();
        let keepalive = is_conn_keepalive(request.headers(), version);
        debug!("frontend keepalive {:?}", keepalive);

        match version {
            Version::HTTP_10 | Version::HTTP_11 => {
                let _ = request.headers_mut().remove(http::header::CONNECTION);

                let (mut response, mut cont) = self.inner.handle(request, ctx).await?;
                cont &= keepalive;

                let _ = response.headers_mut().remove(http::header::CONNECTION);
                match (version, cont) {
                    (Version::HTTP_10, true) => {
                        response
                            .headers_mut()
                            .insert(http::header::CONNECTION, KEEPALIVE_VALUE);
                    }
                    (Version::HTTP_11, false) => {
                        response
                            .headers_mut()
                            .insert(http::header::CONNECTION, CLOSE_VALUE);
                    }
                    _ => {}
                }
                *response.version_mut() = version;
                Ok((response, cont))
            }
            Version::HTTP_2 => {
                let (response, _) = self.inner.handle(request, ctx).await?;
                Ok((response, true))
            }
            // http 0.9 and unknown versions get a single exchange
            _ => {
                let (response, _) = self.inner.handle(request, ctx).await?;
                Ok((response, false))
            }
        }
    }
}

impl<F: MakeService> MakeService for ConnectionReuseHandler<F> {
    type Service = ConnectionReuseHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionReuseHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for ConnectionReuseHandler<F> {
    type Service = ConnectionReuseHandler<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionReuseHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

impl<F> ConnectionReuseHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| Self { inner })
    }
}

fn is_conn_keepalive(headers: &HeaderMap<HeaderValue>, version: Version) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match version {
        Version::HTTP_10 => has_token(KEEPALIVE),
        Version::HTTP_11 => !has_token(CLOSE),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http::{header::CONNECTION, Response};

    use super::*;

    struct Echo;

    impl Service<(Request<()>, ())> for Echo {
        type Response = (Response<()>, bool);
        type Error = Infallible;

        async fn call(&self, (req, _): (Request<()>, ())) -> Result<Self::Response, Self::Error> {
            // the handler never sees hop-by-hop connection headers
            assert!(req.headers().get(CONNECTION).is_none());
            Ok((Response::new(()), true))
        }
    }

    fn request(version: Version, connection: Option<&'static str>) -> Request<()> {
        let mut builder = Request::builder().version(version);
        if let Some(v) = connection {
            builder = builder.header(CONNECTION, v);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn keepalive_rules() {
        let headers = |v: &'static str| {
            let mut h = HeaderMap::new();
            h.insert(CONNECTION, HeaderValue::from_static(v));
            h
        };
        assert!(is_conn_keepalive(&HeaderMap::new(), Version::HTTP_11));
        assert!(is_conn_keepalive(&headers("Keep-Alive"), Version::HTTP_11));
        assert!(!is_conn_keepalive(&headers("close"), Version::HTTP_11));
        assert!(!is_conn_keepalive(&headers("TE, Close"), Version::HTTP_11));

        assert!(!is_conn_keepalive(&HeaderMap::new(), Version::HTTP_10));
        assert!(is_conn_keepalive(&headers("keep-alive"), Version::HTTP_10));

        assert!(!is_conn_keepalive(&HeaderMap::new(), Version::HTTP_09));
    }

    #[monoio::test]
    async fn http11_close_is_honored() {
        let handler = ConnectionReuseHandler { inner: Echo };
        let (resp, cont) = handler
            .call((request(Version::HTTP_11, Some("close")), ()))
            .await
            .unwrap();
        assert!(!cont);
        assert_eq!(resp.headers()[CONNECTION], CLOSE);

        let (resp, cont) = handler
            .call((request(Version::HTTP_11, None), ()))
            .await
            .unwrap();
        assert!(cont);
        assert!(resp.headers().get(CONNECTION).is_none());
    }

    #[monoio::test]
    async fn http10_keepalive_is_confirmed() {
        let handler = ConnectionReuseHandler { inner: Echo };
        let (resp, cont) = handler
            .call((request(Version::HTTP_10, Some("keep-alive")), ()))
            .await
            .unwrap();
        assert!(cont);
        assert_eq!(resp.headers()[CONNECTION], KEEPALIVE);
        assert_eq!(resp.version(), Version::HTTP_10);

        let (_, cont) = handler
            .call((request(Version::HTTP_10, None), ()))
            .await
            .unwrap();
        assert!(!cont);
    }

    #[monoio::test]
    async fn http2_always_continues() {
        let handler = ConnectionReuseHandler { inner: Echo };
        let (_, cont) = handler
            .call((request(Version::HTTP_2, None), ()))
            .await
            .unwrap();
        assert!(cont);
    }
}
