//! Optional TLS termination in front of the HTTP stack.
//!
//! [`UnifiedTlsFactory`] reads a [`TlsConfig`] parameter. With [`TlsConfig::Rustls`] every
//! connection goes through a rustls handshake whose ALPN offer is `h2, http/1.1`; with
//! [`TlsConfig::None`] the raw stream is handed to the inner service unchanged.
use std::net::IpAddr;

use ::rustls::ServerConfig;
use greeter_core::{http::ALPN_PROTOCOLS, AnyError};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, Service,
};
use tracing::info;

use crate::common::Accept;

mod rustls;
pub use self::rustls::{RustlsService, RustlsServiceFactory};

#[derive(Clone)]
pub enum TlsConfig {
    Rustls(ServerConfig),
    None,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsConfig::Rustls(c) => f
                .debug_struct("Rustls")
                .field("alpn_protocols", &c.alpn_protocols)
                .finish(),
            TlsConfig::None => f.write_str("None"),
        }
    }
}

/// A self-signed certificate generated at startup.
pub struct SelfSignedCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl SelfSignedCert {
    /// Generates a certificate valid for `subject_alt_names`; IP literals become IP SANs.
    pub fn generate(subject_alt_names: Vec<String>) -> anyhow::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(subject_alt_names.clone())?;
        info!(
            "generated self-signed certificate for {}",
            subject_alt_names.join(", ")
        );
        Ok(Self {
            cert_der: cert.serialize_der()?,
            key_der: cert.serialize_private_key_der(),
        })
    }

    /// Server config presenting this certificate and advertising `h2` before `http/1.1`.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![::rustls::Certificate(self.cert_der.clone())],
                ::rustls::PrivateKey(self.key_der.clone()),
            )?;
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }
}

/// Names the generated certificate is valid for when none are configured.
pub fn default_subject_alt_names() -> Vec<String> {
    vec![
        "localhost".to_string(),
        IpAddr::from([127, 0, 0, 1]).to_string(),
    ]
}

pub enum UnifiedTlsService<T> {
    Rustls(RustlsService<T>),
    None(T),
}

impl<T> UnifiedTlsService<T> {
    fn as_rustls(this: Option<&Self>) -> Option<&RustlsService<T>> {
        this.and_then(|s| match s {
            UnifiedTlsService::Rustls(inner) => Some(inner),
            _ => None,
        })
    }

    fn as_none(this: Option<&Self>) -> Option<&T> {
        this.and_then(|s| match s {
            UnifiedTlsService::None(inner) => Some(inner),
            _ => None,
        })
    }
}

pub enum UnifiedResponse<A, B> {
    Rustls(A),
    None(B),
}

impl<T, S, CX> Service<Accept<S, CX>> for UnifiedTlsService<T>
where
    RustlsService<T>: Service<Accept<S, CX>>,
    <RustlsService<T> as Service<Accept<S, CX>>>::Error: Into<AnyError>,
    T: Service<Accept<S, CX>>,
    T::Error: Into<AnyError>,
{
    type Response =
        UnifiedResponse<<RustlsService<T> as Service<Accept<S, CX>>>::Response, T::Response>;
    type Error = AnyError;

    async fn call(&self, req: Accept<S, CX>) -> Result<Self::Response, Self::Error> {
        match self {
            UnifiedTlsService::Rustls(inner) => inner
                .call(req)
                .await
                .map(UnifiedResponse::Rustls)
                .map_err(Into::into),
            UnifiedTlsService::None(inner) => inner
                .call(req)
                .await
                .map(UnifiedResponse::None)
                .map_err(Into::into),
        }
    }
}

#[derive(Clone)]
pub enum UnifiedTlsFactory<F> {
    Rustls(RustlsServiceFactory<F>),
    None(F),
}

impl<F> MakeService for UnifiedTlsFactory<F>
where
    F: MakeService,
    F::Error: Into<AnyError>,
{
    type Service = UnifiedTlsService<F::Service>;
    type Error = AnyError;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        match self {
            UnifiedTlsFactory::Rustls(inner) => inner
                .make_via_ref(UnifiedTlsService::as_rustls(old))
                .map(UnifiedTlsService::Rustls)
                .map_err(Into::into),
            UnifiedTlsFactory::None(inner) => inner
                .make_via_ref(UnifiedTlsService::as_none(old))
                .map(UnifiedTlsService::None)
                .map_err(Into::into),
        }
    }
}

impl<F> AsyncMakeService for UnifiedTlsFactory<F>
where
    F: AsyncMakeService,
    F::Error: Into<AnyError>,
{
    type Service = UnifiedTlsService<F::Service>;
    type Error = AnyError;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        match self {
            UnifiedTlsFactory::Rustls(inner) => inner
                .make_via_ref(UnifiedTlsService::as_rustls(old))
                .await
                .map(UnifiedTlsService::Rustls)
                .map_err(Into::into),
            UnifiedTlsFactory::None(inner) => inner
                .make_via_ref(UnifiedTlsService::as_none(old))
                .await
                .map(UnifiedTlsService::None)
                .map_err(Into::into),
        }
    }
}

impl<F> UnifiedTlsFactory<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<TlsConfig>,
    {
        layer_fn(|c: &C, inner| match c.param() {
            TlsConfig::Rustls(config) => Self::Rustls(RustlsServiceFactory::new(config, inner)),
            TlsConfig::None => Self::None(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_config_advertises_h2_first() {
        let cert = SelfSignedCert::generate(default_subject_alt_names()).unwrap();
        assert!(!cert.cert_der.is_empty());
        let config = cert.server_config().unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn default_names_cover_loopback() {
        assert_eq!(default_subject_alt_names(), vec!["localhost", "127.0.0.1"]);
    }
}
