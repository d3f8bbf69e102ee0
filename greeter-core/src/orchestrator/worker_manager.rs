use std::{sync::Arc, thread::JoinHandle};

use futures_channel::{
    mpsc::{channel, Sender},
    oneshot::Sender as OSender,
};
use futures_util::SinkExt;
use monoio::utils::bind_to_cpu_set;
use service_async::AsyncMakeService;
use tracing::{error, warn};

use super::{
    Execute, ResultGroup, RuntimeWrapper, ServiceCommand, ServiceCommandTask, ServiceExecutor,
};
use crate::{config::RuntimeConfig, AnyError, AnyResult};

/// Owns the worker threads and the command channel of each.
///
/// Every worker runs its own runtime and [`ServiceExecutor`]; commands are broadcast with
/// [`dispatch_service_command`](Self::dispatch_service_command) and the per-worker results
/// come back as a [`ResultGroup`].
pub struct WorkerManager<F, LF> {
    runtime_config: RuntimeConfig,
    workers: Vec<Sender<ServiceCommandTask<F, LF>>>,
}

impl<F, LF> WorkerManager<F, LF>
where
    F: Send + 'static,
    LF: Send + 'static,
{
    /// Starts `worker_threads` threads, each blocking on a [`ServiceExecutor`] loop.
    ///
    /// The returned sender of each pair is closed by the worker once its loop ends.
    pub fn spawn_workers_async<A>(&mut self) -> AnyResult<Vec<(JoinHandle<()>, OSender<()>)>>
    where
        F: AsyncMakeService,
        ServiceCommand<F, LF>: Execute<A, F::Service>,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        let runtime_config = Arc::new(self.runtime_config.clone());
        let mut handles = Vec::with_capacity(self.runtime_config.worker_threads);
        for worker_id in 0..self.runtime_config.worker_threads {
            let (tx, rx) = channel(128);
            let runtime_config = runtime_config.clone();
            let (finish_tx, mut finish_rx) = futures_channel::oneshot::channel::<()>();
            let handle = std::thread::Builder::new()
                .name(format!("greeter-worker-{worker_id}"))
                .spawn(move || {
                    // bind thread to cpu core
                    if let Some(cores) = cores {
                        let core = worker_id % cores;
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind thread {worker_id} to core {core} failed: {e}");
                        }
                    }
                    let mut runtime = match RuntimeWrapper::new(runtime_config.as_ref()) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!("worker {worker_id} failed to build runtime: {e}");
                            return;
                        }
                    };
                    let worker_controller = ServiceExecutor::<F::Service>::default();
                    runtime.block_on(async move {
                        worker_controller.run(rx).await;
                        finish_rx.close();
                    });
                })?;
            self.workers.push(tx);
            handles.push((handle, finish_tx));
        }
        Ok(handles)
    }

    /// Sends `cmd` to every worker and waits for each of them to apply it.
    pub async fn dispatch_service_command(
        &mut self,
        cmd: ServiceCommand<F, LF>,
    ) -> ResultGroup<(), AnyError>
    where
        ServiceCommand<F, LF>: Clone,
    {
        let mut results = Vec::with_capacity(self.workers.len());
        for sender in self.workers.iter_mut() {
            let (upd, rx) = ServiceCommandTask::new(cmd.clone());
            match sender.send(upd).await {
                Ok(_) => match rx.await {
                    Ok(r) => results.push(r),
                    Err(e) => results.push(Err(e.into())),
                },
                Err(e) => results.push(Err(e.into())),
            }
        }
        results.into()
    }
}

impl<F, LF> WorkerManager<F, LF> {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_config,
            workers: Vec::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }
}
