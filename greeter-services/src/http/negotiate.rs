use std::{io::Cursor, time::Duration};

use greeter_core::{
    context::NegotiationRoute,
    http::{HttpAccept, HttpVersion, UnknownProtocol},
};
use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, PrefixedReadIo},
    net::TcpStream,
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, ParamSet, Service,
};
use tracing::{info, warn};

use super::{
    upgrade::{self, UpgradeError, UpgradedIo},
    HttpLimits, Keepalive,
};
use crate::common::Accept;

/// What carries the bytes of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Cleartext,
    /// `alpn` is the protocol selected during the handshake, if any.
    Tls { alpn: Option<Vec<u8>> },
}

pub trait TransportInfo {
    fn transport(&self) -> Transport;
}

impl TransportInfo for TcpStream {
    fn transport(&self) -> Transport {
        Transport::Cleartext
    }
}

/// Picks the application protocol of an accepted connection.
///
/// TLS connections are dispatched on their ALPN result. Cleartext connections go through
/// [`upgrade::negotiate`], which recognizes the HTTP/2 preface and `Upgrade: h2c` offers and
/// otherwise stays on HTTP/1.1. The chosen [`HttpVersion`] never changes for the rest of the
/// connection, and the [`NegotiationRoute`] that led to it is recorded in the context.
/// A cleartext peer that stays silent for the keepalive timeout is dropped.
#[derive(Clone)]
pub struct HttpNegotiator<T> {
    inner: T,
    max_head_size: usize,
    idle_timeout: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum NegotiateError<E> {
    #[error("alpn: {0}")]
    UnknownProtocol(#[from] UnknownProtocol),
    #[error("h2c upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),
    #[error("inner error: {0:?}")]
    Inner(E),
}

impl<T, S, CX> Service<Accept<S, CX>> for HttpNegotiator<T>
where
    S: TransportInfo + AsyncReadRent + AsyncWriteRent,
    CX: ParamSet<NegotiationRoute>,
    T: Service<HttpAccept<UpgradedIo<S>, CX::Transformed>>,
{
    type Response = T::Response;
    type Error = NegotiateError<T::Error>;

    async fn call(&self, (stream, cx): Accept<S, CX>) -> Result<Self::Response, Self::Error> {
        let (version, route, stream) = match stream.transport() {
            Transport::Tls { alpn } => {
                let version = HttpVersion::from_alpn(alpn.as_deref()).map_err(|e| {
                    warn!("closing connection: {e}");
                    e
                })?;
                info!("ALPN selected {:?}", version);
                (
                    version,
                    NegotiationRoute::Alpn,
                    PrefixedReadIo::new(stream, Cursor::new(Vec::new())),
                )
            }
            Transport::Cleartext => {
                upgrade::negotiate(stream, self.max_head_size, self.idle_timeout).await?
            }
        };

        self.inner
            .call((version, stream, cx.param_set(route)))
            .await
            .map_err(NegotiateError::Inner)
    }
}

impl<F> HttpNegotiator<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<HttpLimits> + Param<Keepalive>,
    {
        layer_fn(|c: &C, inner| Self {
            inner,
            max_head_size: Param::<HttpLimits>::param(c).max_head_size,
            idle_timeout: Param::<Keepalive>::param(c).0,
        })
    }
}

impl<F: MakeService> MakeService for HttpNegotiator<F> {
    type Service = HttpNegotiator<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(HttpNegotiator {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
            max_head_size: self.max_head_size,
            idle_timeout: self.idle_timeout,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for HttpNegotiator<F> {
    type Service = HttpNegotiator<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(HttpNegotiator {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
            max_head_size: self.max_head_size,
            idle_timeout: self.idle_timeout,
        })
    }
}
