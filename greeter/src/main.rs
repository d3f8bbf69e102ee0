use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use greeter_core::{
    listener::ListenerBuilder,
    orchestrator::{ServiceCommand, WorkerManager},
};
use greeter_services::tls::TlsConfig;
use monoio::net::TcpStream;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::{config::Config, factory::l7_factory};

mod config;
mod context;
mod factory;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Port of the single server used when no config file is given
    #[clap(short, long, default_value_t = 8443, conflicts_with = "config")]
    port: u16,
    /// Serve plain TCP (h2c upgrade or prior knowledge) instead of TLS
    #[clap(long, conflicts_with = "config")]
    cleartext: bool,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = match args.config {
        Some(path) => Config::load(path)?,
        None => Config::demo(args.port, args.cleartext)?,
    };

    // Start workers
    let mut manager = WorkerManager::new(config.runtime);
    let join_handlers = manager.spawn_workers_async::<(TcpStream, std::net::SocketAddr)>()?;
    info!(
        "Start monoio runtime {:?} with {} workers",
        manager.config().runtime_type,
        join_handlers.len()
    );

    // Deploy every server on every worker
    for (key, service_config) in config.servers {
        let listener = ListenerBuilder::from(service_config.listener);
        let addr = listener.addr();
        let scheme = match service_config.server.tls {
            TlsConfig::Rustls(_) => "https",
            TlsConfig::None => "http",
        };
        let name = service_config.server.name.clone();
        manager
            .dispatch_service_command(ServiceCommand::PrepareAndCommit(
                Arc::new(key),
                l7_factory(service_config.server),
                listener,
            ))
            .await
            .err()?;
        info!("server {name} listening on {addr}");
        info!(
            "Open your HTTP/2-enabled web browser and navigate to {scheme}://127.0.0.1:{}/",
            addr.port()
        );
    }
    info!("servers deployed to all workers");

    // Wait for workers
    for (handle, _finish) in join_handlers.into_iter() {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
    Ok(())
}
