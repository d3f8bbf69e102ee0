use greeter_core::context::PeerAddr;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, ParamSet, Service,
};

/// Forks a fresh context for every accepted connection and records the peer address in it.
#[derive(Debug, Clone, Copy)]
pub struct ContextService<CX, T> {
    inner: T,
    ctx: CX,
}

impl<R, A, T, CX> Service<(R, A)> for ContextService<CX, T>
where
    T: Service<(R, CX::Transformed)>,
    CX: ParamSet<PeerAddr> + Clone,
    A: Into<PeerAddr>,
{
    type Response = T::Response;
    type Error = T::Error;

    async fn call(&self, (req, addr): (R, A)) -> Result<Self::Response, Self::Error> {
        let ctx = self.ctx.clone().param_set(addr.into());
        self.inner.call((req, ctx)).await
    }
}

impl<CX, F> ContextService<CX, F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        CX: Default,
    {
        layer_fn(|_: &C, inner| ContextService {
            inner,
            ctx: Default::default(),
        })
    }
}

impl<CX: Clone, F: MakeService> MakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            ctx: self.ctx.clone(),
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<CX: Clone, F: AsyncMakeService> AsyncMakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            ctx: self.ctx.clone(),
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, net::SocketAddr};

    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    struct Blank;

    impl ParamSet<PeerAddr> for Blank {
        type Transformed = PeerAddr;

        fn param_set(self, data: PeerAddr) -> Self::Transformed {
            data
        }
    }

    struct Peer;

    impl Service<((), PeerAddr)> for Peer {
        type Response = SocketAddr;
        type Error = Infallible;

        async fn call(&self, (_, peer): ((), PeerAddr)) -> Result<Self::Response, Self::Error> {
            Ok(peer.0)
        }
    }

    #[monoio::test]
    async fn peer_address_lands_in_context() {
        let svc = ContextService {
            inner: Peer,
            ctx: Blank,
        };
        let addr: SocketAddr = "10.0.0.7:5123".parse().unwrap();
        assert_eq!(svc.call(((), addr)).await.unwrap(), addr);
    }
}
