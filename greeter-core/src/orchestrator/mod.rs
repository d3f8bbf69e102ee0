//! Worker and service lifecycle management for thread-per-core network services.
//!
//! - [`WorkerManager`] spawns the worker threads and broadcasts [`ServiceCommand`]s to them.
//! - [`ServiceExecutor`] runs inside each worker and owns the deployed services.
//! - [`serve`] is the accept loop: one spawned task per connection, pinned to the worker
//!   that accepted it.
use std::{cell::Cell, fmt::Debug, rc::Rc};

use futures_channel::oneshot::Sender as OSender;
use monoio::io::stream::Stream;
use service_async::Service;
use tracing::{debug, error, info, warn};

pub use self::runtime::RuntimeWrapper;

mod runtime;
mod service_executor;
mod worker_manager;

pub use service_executor::{
    CommandError, Execute, ServiceCommand, ServiceCommandTask, ServiceExecutor, ServiceSlot,
};
pub use worker_manager::WorkerManager;

/// A collection of results from multiple worker operations.
pub struct ResultGroup<T, E>(Vec<Result<T, E>>);

impl<T, E> From<Vec<Result<T, E>>> for ResultGroup<T, E> {
    fn from(value: Vec<Result<T, E>>) -> Self {
        Self(value)
    }
}

impl<T, E> From<ResultGroup<T, E>> for Vec<Result<T, E>> {
    fn from(value: ResultGroup<T, E>) -> Self {
        value.0
    }
}

impl<E> ResultGroup<(), E> {
    pub fn err(self) -> Result<(), E> {
        for r in self.0.into_iter() {
            r?;
        }
        Ok(())
    }
}

/// Accepts connections from `listener` and runs each on its own task with the service in
/// `handler`.
///
/// Runs until the receiving side of `stop` is dropped or the listener closes. A failing
/// connection is logged and dropped; it never ends the loop. Connections still in flight
/// when the loop ends run to completion.
pub async fn serve<S, Svc, A, E>(mut listener: S, handler: ServiceSlot<Svc>, mut stop: OSender<()>)
where
    S: Stream<Item = Result<A, E>> + 'static,
    E: Debug,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    let in_flight = Rc::new(Cell::new(0usize));
    let mut cancellation = stop.cancellation();
    loop {
        let accepted = monoio::select! {
            _ = &mut cancellation => {
                info!("stop requested, {} connections still in flight", in_flight.get());
                return;
            }
            accepted = listener.next() => accepted,
        };
        let conn = match accepted {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => {
                warn!("Accept connection failed: {e:?}");
                continue;
            }
            None => {
                info!("listener is closed, serve stopped");
                return;
            }
        };

        let svc = handler.get_svc();
        let in_flight = in_flight.clone();
        in_flight.set(in_flight.get() + 1);
        monoio::spawn(async move {
            match svc.call(conn).await {
                Ok(_) => debug!("Connection complete"),
                Err(e) => error!("Connection error: {e:?}"),
            }
            in_flight.set(in_flight.get() - 1);
        });
    }
}
