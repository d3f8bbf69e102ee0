use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Service,
};

/// Turns a panic raised while serving a connection into an error, so only that connection
/// is lost and the worker keeps accepting.
///
/// The inner service must tolerate being observed after an unwind; connection services
/// own all their state, which is dropped together with the failed task.
#[derive(Clone)]
pub struct CatchPanicService<S> {
    inner: S,
}

#[derive(thiserror::Error, Debug)]
pub enum CatchPanicError<E> {
    #[error("inner error: {0:?}")]
    Inner(E),
    // String keeps the error Sync.
    #[error("inner panic: {0}")]
    Panic(String),
}

impl<R, S> Service<R> for CatchPanicService<S>
where
    S: Service<R>,
{
    type Response = S::Response;
    type Error = CatchPanicError<S::Error>;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match AssertUnwindSafe(self.inner.call(req)).catch_unwind().await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(CatchPanicError::Inner(e)),
            Err(payload) => Err(CatchPanicError::Panic(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{payload:?}")
    }
}

impl<F> CatchPanicService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_c: &C, inner| CatchPanicService { inner })
    }
}

impl<F: MakeService> MakeService for CatchPanicService<F> {
    type Service = CatchPanicService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(CatchPanicService {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for CatchPanicService<F> {
    type Service = CatchPanicService<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(CatchPanicService {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    struct Boom;

    impl Service<u8> for Boom {
        type Response = u8;
        type Error = Infallible;

        async fn call(&self, req: u8) -> Result<u8, Infallible> {
            if req == 0 {
                panic!("zero is not served");
            }
            Ok(req)
        }
    }

    #[monoio::test]
    async fn panic_becomes_error() {
        let svc = CatchPanicService { inner: Boom };
        assert_eq!(svc.call(7).await.unwrap(), 7);
        match svc.call(0).await {
            Err(CatchPanicError::Panic(msg)) => assert_eq!(msg, "zero is not served"),
            other => panic!("unexpected result: {:?}", other.map_err(|e| e.to_string())),
        }
    }
}
