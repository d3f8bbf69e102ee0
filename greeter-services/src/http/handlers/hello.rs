//! The terminal handler: answers every request with a fixed greeting.
//!
//! The request body is read to the end and only its size is kept. The response is a
//! `200 OK` plain-text "Hello World" annotated with the protocol and the
//! [`NegotiationRoute`] of the connection:
//!
//! | protocol | route | body |
//! |---|---|---|
//! | HTTP/2 | ALPN | `Hello World - via HTTP/2` |
//! | HTTP/2 | h2c upgrade | `Hello World - via HTTP/2 (Cleartext Upgrade)` |
//! | HTTP/2 | prior knowledge | `Hello World - via HTTP/2 (Prior Knowledge)` |
//! | HTTP/1.1 | ALPN | `Hello World - via HTTP/1.1 (ALPN Negotiation)` |
//! | HTTP/1.1 | cleartext | `Hello World - via HTTP/1.1 (Direct. No Upgrade Attempted.)` |
use std::convert::Infallible;

use bytes::Bytes;
use greeter_core::{context::NegotiationRoute, AnyError};
use http::{header, HeaderValue, Request, Response, StatusCode, Version};
use monoio_http::common::body::{Body, FixedBody, HttpBody};
use service_async::{AsyncMakeService, MakeService, ParamRef, Service};
use tracing::debug;

const GREETING: &str = "Hello World";
#[allow(clippy::declare_interior_mutable_const)]
const TEXT_PLAIN: HeaderValue = HeaderValue::from_static("text/plain; charset=UTF-8");

#[derive(Debug, Clone, Copy, Default)]
pub struct HelloWorldHandler;

impl<CX> Service<(Request<HttpBody>, CX)> for HelloWorldHandler
where
    CX: ParamRef<NegotiationRoute>,
{
    type Response = (Response<HttpBody>, bool);
    type Error = AnyError;

    async fn call(
        &self,
        (request, ctx): (Request<HttpBody>, CX),
    ) -> Result<Self::Response, Self::Error> {
        let (parts, mut body) = request.into_parts();
        let mut received = 0;
        while let Some(chunk) = body.next_data().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("read request body failed: {e:?}"))?;
            received += chunk.len();
        }
        debug!(
            "{} {} {:?}: discarded {received} body bytes",
            parts.method, parts.uri, parts.version
        );

        let greeting = Bytes::from(hello_body(parts.version, *ctx.param_ref()));
        let content_length = HeaderValue::from(greeting.len());
        let mut response = Response::new(HttpBody::fixed_body(Some(greeting)));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, TEXT_PLAIN);
        headers.insert(header::CONTENT_LENGTH, content_length);
        Ok((response, true))
    }
}

/// Greeting for a request received over `version` on a connection negotiated via `route`.
pub fn hello_body(version: Version, route: NegotiationRoute) -> String {
    match (version, route) {
        (Version::HTTP_2, NegotiationRoute::Alpn) => format!("{GREETING} - via HTTP/2"),
        (Version::HTTP_2, route) => format!("{GREETING} - via HTTP/2 ({})", route.describe()),
        (version, route) => format!("{GREETING} - via {version:?} ({})", route.describe()),
    }
}

impl MakeService for HelloWorldHandler {
    type Service = Self;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(*self)
    }
}

impl AsyncMakeService for HelloWorldHandler {
    type Service = Self;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Route(NegotiationRoute);

    impl ParamRef<NegotiationRoute> for Route {
        fn param_ref(&self) -> &NegotiationRoute {
            &self.0
        }
    }

    #[test]
    fn greeting_per_route() {
        use NegotiationRoute::*;
        assert_eq!(hello_body(Version::HTTP_2, Alpn), "Hello World - via HTTP/2");
        assert_eq!(
            hello_body(Version::HTTP_2, CleartextUpgrade),
            "Hello World - via HTTP/2 (Cleartext Upgrade)"
        );
        assert_eq!(
            hello_body(Version::HTTP_2, PriorKnowledge),
            "Hello World - via HTTP/2 (Prior Knowledge)"
        );
        assert_eq!(
            hello_body(Version::HTTP_11, Alpn),
            "Hello World - via HTTP/1.1 (ALPN Negotiation)"
        );
        assert_eq!(
            hello_body(Version::HTTP_11, Direct),
            "Hello World - via HTTP/1.1 (Direct. No Upgrade Attempted.)"
        );
    }

    #[monoio::test]
    async fn responds_with_fixed_greeting() {
        let request = Request::builder()
            .uri("/")
            .body(HttpBody::fixed_body(Some(Bytes::from_static(b"ignored"))))
            .unwrap();
        let (response, cont) = HelloWorldHandler
            .call((request, Route(NegotiationRoute::Direct)))
            .await
            .unwrap();
        assert!(cont);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=UTF-8");

        let expected = "Hello World - via HTTP/1.1 (Direct. No Upgrade Attempted.)";
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            expected.len().to_string().as_str()
        );
        let mut body = response.into_body();
        let data = body.next_data().await.unwrap().unwrap();
        assert_eq!(&data[..], expected.as_bytes());
    }
}
