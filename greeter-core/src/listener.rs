use std::{io, net::SocketAddr};

use monoio::net::{ListenerOpts, TcpListener};
use service_async::{AsyncMakeService, MakeService};

/// Pending connections the kernel may queue per listener.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Binds one TCP listener per worker.
///
/// Every worker builds its own socket with `SO_REUSEPORT`, so the kernel spreads accepted
/// connections across the worker threads.
#[derive(Debug, Clone)]
pub struct ListenerBuilder {
    addr: SocketAddr,
    opts: ListenerOpts,
}

impl ListenerBuilder {
    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> io::Result<ListenerBuilder> {
        Ok(Self { addr, opts })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn build(&self) -> io::Result<TcpListener> {
        TcpListener::bind_with_config(self.addr, &self.opts)
    }
}

impl From<SocketAddr> for ListenerBuilder {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr,
            opts: ListenerOpts::new().backlog(DEFAULT_BACKLOG),
        }
    }
}

impl MakeService for ListenerBuilder {
    type Service = TcpListener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}

impl AsyncMakeService for ListenerBuilder {
    type Service = TcpListener;
    type Error = io::Error;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}
