//! Preconstructed factories.

use std::{fmt::Debug, net::SocketAddr};

use greeter_services::{
    common::{CatchPanicService, ContextService},
    http::{
        handlers::{ConnectionReuseHandler, HelloWorldHandler},
        HttpCoreService, HttpNegotiator,
    },
    tls::UnifiedTlsFactory,
};
use monoio::net::TcpStream;
use service_async::{stack::FactoryStack, AsyncMakeService, Service};

use crate::{config::ServerConfig, context::EmptyContext};

/// Create a new factory for the greeting server.
// Here we use a fixed generic type `(TcpStream, SocketAddr)`
// for simplification and make return impl work.
pub fn l7_factory(
    config: ServerConfig,
) -> impl AsyncMakeService<
    Service = impl Service<(TcpStream, SocketAddr), Error = impl Debug>,
    Error = impl Debug + Send + Sync + 'static,
> + Clone
+ Send
+ 'static {
    FactoryStack::new(config)
        .replace(HelloWorldHandler)
        .push(ConnectionReuseHandler::layer())
        .push(HttpCoreService::layer())
        .push(HttpNegotiator::layer())
        .push(UnifiedTlsFactory::layer())
        .push(CatchPanicService::layer())
        .push(ContextService::<EmptyContext, _>::layer())
        .into_inner()
}
