use greeter_services::{
    http::{HttpLimits, Keepalive},
    tls::TlsConfig,
};
use service_async::Param;

use super::ServerConfig;

impl Param<Keepalive> for ServerConfig {
    fn param(&self) -> Keepalive {
        self.keepalive
    }
}

impl Param<HttpLimits> for ServerConfig {
    fn param(&self) -> HttpLimits {
        self.limits
    }
}

impl Param<TlsConfig> for ServerConfig {
    fn param(&self) -> TlsConfig {
        self.tls.clone()
    }
}
