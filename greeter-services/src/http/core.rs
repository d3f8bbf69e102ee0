//! Per-connection HTTP codec loop.
//!
//! [`HttpCoreService`] receives a stream whose protocol has already been decided and drives
//! it until the peer leaves:
//!
//! - HTTP/1.1: requests are decoded one at a time in arrival order. Each request body is
//!   collected in memory before the handler chain runs, and the response is written before
//!   the next request is decoded. Idle connections are closed after the [`Keepalive`]
//!   timeout. A body that declares or reaches more than [`HttpLimits::max_content_length`]
//!   bytes, chunked or not, is refused with `413` and the connection is closed.
//! - HTTP/2: the connection preface, SETTINGS, HPACK, stream multiplexing and flow control
//!   are handled by `monoio_http::h2`. Every accepted stream is answered independently once
//!   its DATA has been read to the end; the bytes are released back to the window and
//!   dropped.
//!
//! A handler error turns into an empty `500` response. Transport errors end the connection.
use std::{convert::Infallible, fmt::Debug, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{
    channel::mpsc,
    future::{select, Either},
    stream::FuturesUnordered,
    StreamExt,
};
use greeter_core::{
    context::PeerAddr,
    http::{HttpAccept, HttpHandler, HttpVersion},
    AnyError,
};
use http::{header, HeaderMap, Request, StatusCode};
use monoio::io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable};
use monoio_http::{
    common::body::{Body, FixedBody, HttpBody, StreamHint},
    h1::codec::{
        decoder::{FillPayload, RequestDecoder},
        encoder::GenericEncoder,
    },
    h2::{server::SendResponse, RecvStream},
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, ParamRef, Service,
};
use tracing::{debug, error, info, warn};

use super::{generate_response, HttpLimits};

#[derive(Clone)]
pub struct HttpCoreService<H> {
    handler_chain: H,
    keepalive_timeout: Duration,
    limits: HttpLimits,
}

impl<H> HttpCoreService<H> {
    pub fn new(handler_chain: H, keepalive_config: Keepalive, limits: HttpLimits) -> Self {
        HttpCoreService {
            handler_chain,
            keepalive_timeout: keepalive_config.0,
            limits,
        }
    }

    async fn h1_svc<S, CX>(&self, stream: S, ctx: CX)
    where
        S: Split + AsyncReadRent + AsyncWriteRent,
        H: HttpHandler<CX, HttpBody, Body = HttpBody>,
        H::Error: Into<AnyError> + Debug,
        CX: ParamRef<PeerAddr> + Clone,
    {
        let (reader, writer) = stream.into_split();
        let mut decoder = RequestDecoder::new(reader);
        let mut encoder = GenericEncoder::new(writer);

        loop {
            // decode request with keepalive timeout
            let req = match monoio::time::timeout(self.keepalive_timeout, decoder.next()).await {
                Ok(Some(Ok(req))) => HttpBody::request(req),
                Ok(Some(Err(err))) => {
                    warn!("decode request header failed: {err}");
                    break;
                }
                Ok(None) => {
                    info!(
                        "Connection {:?} closed",
                        ParamRef::<PeerAddr>::param_ref(&ctx),
                    );
                    break;
                }
                Err(_) => {
                    info!(
                        "Connection {:?} keepalive timed out",
                        ParamRef::<PeerAddr>::param_ref(&ctx),
                    );
                    break;
                }
            };

            let limit = self.limits.max_content_length;
            let (parts, body) = req.into_parts();
            let aggregated = match declared_length(&parts.headers) {
                Some(len) if len > limit => Aggregated::TooLarge(len),
                _ => {
                    let fill = decoder.fill_payload();
                    let collect = aggregate(body, limit);
                    futures::pin_mut!(fill, collect);
                    match select(fill, collect).await {
                        Either::Left((Ok(_), collect)) => collect.await,
                        Either::Left((Err(e), _)) => {
                            warn!("error when decode request body: {e}");
                            break;
                        }
                        Either::Right((Aggregated::Complete(data), fill)) => {
                            if let Err(e) = fill.await {
                                warn!("error when decode request body: {e}");
                                break;
                            }
                            Aggregated::Complete(data)
                        }
                        Either::Right((aggregated, _)) => aggregated,
                    }
                }
            };
            let body = match aggregated {
                Aggregated::Complete(data) => HttpBody::fixed_body(data),
                Aggregated::TooLarge(len) => {
                    warn!("request body of {len} bytes exceeds limit of {limit}");
                    let resp = generate_response::<HttpBody>(StatusCode::PAYLOAD_TOO_LARGE, true);
                    if let Err(e) = encoder.send_and_flush(resp).await {
                        warn!("error when reply client: {e}");
                    }
                    break;
                }
                Aggregated::Failed(e) => {
                    warn!("error when read request body: {e:?}");
                    break;
                }
            };

            match self
                .handler_chain
                .handle(Request::from_parts(parts, body), ctx.clone())
                .await
            {
                Ok((resp, should_cont)) => {
                    if let Err(e) = encoder.send_and_flush(resp).await {
                        warn!("error when encode and write response: {e}");
                        break;
                    }
                    if !should_cont {
                        break;
                    }
                }
                Err(e) => {
                    error!("error when processing request: {e:?}");
                    if let Err(e) = encoder
                        .send_and_flush(generate_response::<HttpBody>(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            true,
                        ))
                        .await
                    {
                        warn!("error when reply client: {e}");
                    }
                    break;
                }
            }
        }
    }

    async fn h2_process_response(
        response: http::Response<HttpBody>,
        mut response_handle: SendResponse<Bytes>,
    ) {
        let (mut parts, mut body) = response.into_parts();
        // connection-specific headers are forbidden in HTTP/2
        parts.headers.remove(header::CONNECTION);
        let response = http::Response::from_parts(parts, ());

        match body.stream_hint() {
            StreamHint::None => {
                if let Err(e) = response_handle.send_response(response, true) {
                    error!("H2 frontend response send fail {:?}", e);
                }
            }
            StreamHint::Fixed => {
                let mut send_stream = match response_handle.send_response(response, false) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("H2 frontend response send fail {:?}", e);
                        return;
                    }
                };
                let data = match body.next_data().await {
                    Some(Ok(data)) => data,
                    _ => Bytes::new(),
                };
                if let Err(e) = send_stream.send_data(data, true) {
                    error!("H2 frontend data send fail {:?}", e);
                }
            }
            StreamHint::Stream => {
                let mut send_stream = match response_handle.send_response(response, false) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("H2 frontend response send fail {:?}", e);
                        return;
                    }
                };
                while let Some(Ok(data)) = body.next_data().await {
                    if let Err(e) = send_stream.send_data(data, false) {
                        error!("H2 frontend data send fail {:?}", e);
                        return;
                    }
                }
                let _ = send_stream.send_data(Bytes::new(), true);
            }
        }
    }

    async fn h2_stream<CX>(
        &self,
        request: Request<RecvStream>,
        mut response_handle: SendResponse<Bytes>,
        ctx: CX,
    ) where
        H: HttpHandler<CX, HttpBody, Body = HttpBody>,
        H::Error: Into<AnyError> + Debug,
    {
        let (parts, mut body) = request.into_parts();
        let mut received = 0;
        while let Some(chunk) = body.data().await {
            match chunk {
                Ok(data) => {
                    received += data.len();
                    let _ = body.flow_control().release_capacity(data.len());
                }
                Err(e) => {
                    warn!("h2 request body failed: {e:?}");
                    return;
                }
            }
        }
        debug!(
            "h2 request {} {}: discarded {received} body bytes",
            parts.method, parts.uri
        );

        let request = Request::from_parts(parts, HttpBody::fixed_body(None));
        match self.handler_chain.handle(request, ctx).await {
            Ok((response, _)) => Self::h2_process_response(response, response_handle).await,
            Err(e) => {
                error!("Handler chain returned error : {e:?}");
                let (parts, _) =
                    generate_response::<HttpBody>(StatusCode::INTERNAL_SERVER_ERROR, false)
                        .into_parts();
                let response = http::Response::from_parts(parts, ());
                if let Err(e) = response_handle.send_response(response, true) {
                    error!("H2 frontend response send fail {:?}", e);
                }
            }
        }
    }

    async fn h2_svc<S, CX>(&self, stream: S, ctx: CX)
    where
        S: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
        H: HttpHandler<CX, HttpBody, Body = HttpBody>,
        H::Error: Into<AnyError> + Debug,
        CX: ParamRef<PeerAddr> + Clone,
    {
        let mut connection = match monoio_http::h2::server::Builder::new()
            .handshake::<S, Bytes>(stream)
            .await
        {
            Ok(c) => {
                info!(
                    "H2 handshake complete for {:?}",
                    ParamRef::<PeerAddr>::param_ref(&ctx),
                );
                c
            }
            Err(e) => {
                error!("h2 server build failed: {e:?}");
                return;
            }
        };

        // The connection is polled by its own task so that responses keep flowing while
        // handlers run.
        let (tx, mut rx) = mpsc::unbounded();
        monoio::spawn(async move {
            while let Some(result) = connection.accept().await {
                if tx.unbounded_send(result).is_err() {
                    break;
                }
            }
        });

        let mut streams = FuturesUnordered::new();
        loop {
            futures::select! {
                accepted = rx.next() => match accepted {
                    Some(Ok((request, response_handle))) => {
                        streams.push(self.h2_stream(request, response_handle, ctx.clone()));
                    }
                    Some(Err(e)) => {
                        warn!("H2 connection error {e:?}");
                        break;
                    }
                    None => break,
                },
                _ = streams.select_next_some() => {},
            }
        }
        while streams.next().await.is_some() {}
        info!(
            "Connection {:?} closed",
            ParamRef::<PeerAddr>::param_ref(&ctx),
        );
    }
}

/// An HTTP/1.1 request body read into memory.
enum Aggregated {
    Complete(Option<Bytes>),
    /// Bytes seen, or declared, when the limit was passed.
    TooLarge(usize),
    Failed(<HttpBody as Body>::Error),
}

async fn aggregate(mut body: HttpBody, limit: usize) -> Aggregated {
    let mut collected = BytesMut::new();
    while let Some(chunk) = body.next_data().await {
        match chunk {
            Ok(data) if collected.len() + data.len() > limit => {
                return Aggregated::TooLarge(collected.len() + data.len());
            }
            Ok(data) => collected.extend_from_slice(&data),
            Err(e) => return Aggregated::Failed(e),
        }
    }
    Aggregated::Complete((!collected.is_empty()).then(|| collected.freeze()))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl<H, Stream, CX> Service<HttpAccept<Stream, CX>> for HttpCoreService<H>
where
    Stream: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
    H: HttpHandler<CX, HttpBody, Body = HttpBody>,
    H::Error: Into<AnyError> + Debug,
    CX: ParamRef<PeerAddr> + Clone,
{
    type Response = ();
    type Error = Infallible;

    async fn call(
        &self,
        incoming_stream: HttpAccept<Stream, CX>,
    ) -> Result<Self::Response, Self::Error> {
        let (version, stream, ctx) = incoming_stream;
        match version {
            HttpVersion::Http2 => self.h2_svc(stream, ctx).await,
            HttpVersion::Http11 => self.h1_svc(stream, ctx).await,
        }
        Ok(())
    }
}

// HttpCoreService is a Service and a MakeService.
impl<F> MakeService for HttpCoreService<F>
where
    F: MakeService,
{
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))?,
            keepalive_timeout: self.keepalive_timeout,
            limits: self.limits,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for HttpCoreService<F> {
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))
                .await?,
            keepalive_timeout: self.keepalive_timeout,
            limits: self.limits,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Keepalive(pub Duration);

impl Default for Keepalive {
    fn default() -> Self {
        const DEFAULT_KEEPALIVE_SEC: u64 = 75;
        Self(Duration::from_secs(DEFAULT_KEEPALIVE_SEC))
    }
}

impl<F> HttpCoreService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<Keepalive> + Param<HttpLimits>,
    {
        layer_fn(|c: &C, inner| {
            Self::new(
                inner,
                Param::<Keepalive>::param(c),
                Param::<HttpLimits>::param(c),
            )
        })
    }
}
