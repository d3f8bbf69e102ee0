use std::sync::Arc;

use greeter_core::AnyError;
use monoio::io::{AsyncReadRent, AsyncWriteRent};
use monoio_rustls::{ServerTlsStream, TlsAcceptor};
use rustls::ServerConfig;
use service_async::{AsyncMakeService, MakeService, Service};
use tracing::debug;

use crate::{
    common::Accept,
    http::{Transport, TransportInfo},
};

type RustlsAccept<Stream, CX> = (ServerTlsStream<Stream>, CX);

/// Runs the server side of the TLS handshake and passes the encrypted stream on.
pub struct RustlsService<T> {
    acceptor: TlsAcceptor,
    inner: T,
}

impl<T, S, CX> Service<Accept<S, CX>> for RustlsService<T>
where
    T: Service<RustlsAccept<S, CX>>,
    T::Error: Into<AnyError>,
    S: AsyncReadRent + AsyncWriteRent,
{
    type Response = T::Response;
    type Error = AnyError;

    async fn call(&self, (stream, cx): Accept<S, CX>) -> Result<Self::Response, Self::Error> {
        let stream = self.acceptor.accept(stream).await?;
        debug!("tls handshake complete: {:?}", stream.transport());
        self.inner.call((stream, cx)).await.map_err(Into::into)
    }
}

impl<IO> TransportInfo for ServerTlsStream<IO> {
    fn transport(&self) -> Transport {
        Transport::Tls {
            alpn: self.alpn_protocol().map(|p| p.to_vec()),
        }
    }
}

#[derive(Clone)]
pub struct RustlsServiceFactory<F> {
    config: Arc<ServerConfig>,
    inner: F,
}

impl<F> RustlsServiceFactory<F> {
    pub fn new(config: ServerConfig, inner: F) -> Self {
        Self {
            config: Arc::new(config),
            inner,
        }
    }
}

impl<F> MakeService for RustlsServiceFactory<F>
where
    F: MakeService,
{
    type Service = RustlsService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let acceptor = TlsAcceptor::from(self.config.clone());
        Ok(RustlsService {
            acceptor,
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F> AsyncMakeService for RustlsServiceFactory<F>
where
    F: AsyncMakeService,
{
    type Service = RustlsService<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        let acceptor = TlsAcceptor::from(self.config.clone());
        Ok(RustlsService {
            acceptor,
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}
