//! Per-worker service deployment.
//!
//! Each worker thread owns a [`ServiceExecutor`]. It receives [`ServiceCommand`]s from the
//! [`WorkerManager`](super::WorkerManager), builds services with their
//! [`AsyncMakeService`] factories, binds listeners and spawns the accept loop.
use std::{cell::RefCell, collections::HashMap, fmt::Debug, rc::Rc, sync::Arc};

use futures_channel::{
    mpsc::Receiver,
    oneshot::{channel as ochannel, Receiver as OReceiver, Sender as OSender},
};
use futures_util::stream::StreamExt;
use monoio::io::stream::Stream;
use service_async::{AsyncMakeService, Service};
use tracing::{error, info};

use super::serve;
use crate::AnyError;

/// Deployed services of one worker, keyed by site name.
pub struct ServiceExecutor<S> {
    sites: RefCell<HashMap<Arc<String>, ServiceSlotContainer<S>>>,
}

impl<S> Default for ServiceExecutor<S> {
    fn default() -> Self {
        Self {
            sites: RefCell::new(HashMap::new()),
        }
    }
}

struct ServiceSlotContainer<S> {
    slot: ServiceSlot<S>,
    // Dropping the receiver stops the accept loop of the site.
    _stop: OReceiver<()>,
}

impl<S> ServiceSlotContainer<S> {
    fn create(handler: S) -> (Self, OSender<()>) {
        let (tx, rx) = ochannel();
        (
            Self {
                slot: ServiceSlot::from(Rc::new(handler)),
                _stop: rx,
            },
            tx,
        )
    }
}

impl<S> ServiceExecutor<S> {
    fn deploy(&self, name: Arc<String>, svc: S) -> (ServiceSlot<S>, OSender<()>) {
        let (site, stop) = ServiceSlotContainer::create(svc);
        let slot = site.slot.clone();
        self.sites.borrow_mut().insert(name, site);
        (slot, stop)
    }
}

/// Holds the deployed [`Service`], shared by every connection task of a site.
pub struct ServiceSlot<S>(Rc<S>);

impl<S> Clone for ServiceSlot<S> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<S> From<Rc<S>> for ServiceSlot<S> {
    fn from(value: Rc<S>) -> Self {
        Self(value)
    }
}

impl<S> ServiceSlot<S> {
    pub fn get_svc(&self) -> Rc<S> {
        self.0.clone()
    }
}

/// Commands a [`ServiceExecutor`] applies to its sites.
#[derive(Clone)]
pub enum ServiceCommand<F, LF> {
    /// Builds the service and its listener, then starts accepting connections.
    PrepareAndCommit(Arc<String>, F, LF),
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError<SE, LE> {
    #[error("build service error: {0:?}")]
    BuildService(SE),
    #[error("build listener error: {0:?}")]
    BuildListener(LE),
}

/// A [`ServiceCommand`] with a channel for its execution result.
pub struct ServiceCommandTask<F, LF> {
    cmd: ServiceCommand<F, LF>,
    result: OSender<Result<(), AnyError>>,
}

impl<F, LF> ServiceCommandTask<F, LF> {
    pub fn new(cmd: ServiceCommand<F, LF>) -> (Self, OReceiver<Result<(), AnyError>>) {
        let (tx, rx) = ochannel();
        (Self { cmd, result: tx }, rx)
    }
}

pub trait Execute<A, S> {
    type Error: Into<AnyError>;
    fn execute(
        self,
        controller: &ServiceExecutor<S>,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>>;
}

impl<F, LF, A, E, S> Execute<A, S> for ServiceCommand<F, LF>
where
    F: AsyncMakeService<Service = S>,
    F::Error: Debug + Send + Sync + 'static,
    LF: AsyncMakeService,
    LF::Service: Stream<Item = Result<A, E>> + 'static,
    E: Debug + Send + Sync + 'static,
    LF::Error: Debug + Send + Sync + 'static,
    S: Service<A> + 'static,
    S::Error: Debug,
    A: 'static,
{
    type Error = CommandError<F::Error, LF::Error>;

    async fn execute(self, controller: &ServiceExecutor<S>) -> Result<(), Self::Error> {
        match self {
            ServiceCommand::PrepareAndCommit(name, factory, listener_factory) => {
                let svc = factory.make().await.map_err(CommandError::BuildService)?;
                let listener = listener_factory
                    .make()
                    .await
                    .map_err(CommandError::BuildListener)?;
                let (slot, stop) = controller.deploy(name.clone(), svc);
                info!("site {name} deployed");
                monoio::spawn(serve(listener, slot, stop));
                Ok(())
            }
        }
    }
}

impl<S> ServiceExecutor<S> {
    /// Processes commands until the channel closes.
    pub async fn run<F, LF, A>(&self, mut rx: Receiver<ServiceCommandTask<F, LF>>)
    where
        ServiceCommand<F, LF>: Execute<A, S>,
    {
        while let Some(upd) = rx.next().await {
            if let Err(e) = upd
                .result
                .send(upd.cmd.execute(self).await.map_err(Into::into))
            {
                error!("unable to send back result: {e:?}");
            }
        }
    }
}
