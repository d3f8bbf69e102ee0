use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use greeter_core::{
    config::{RuntimeConfig, ServiceConfig},
    listener::ListenerBuilder,
};
use greeter_services::{
    http::{HttpLimits, Keepalive},
    tls::{default_subject_alt_names, SelfSignedCert, TlsConfig},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

mod extractor;

#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub servers: HashMap<String, ServiceConfig<ListenerConfig, ServerConfig>>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub tls: TlsConfig,
    pub keepalive: Keepalive,
    pub limits: HttpLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerUserConfig {
    pub name: String,
    pub tls: Option<TlsUserConfig>,
    #[serde(default)]
    pub http: HttpUserConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsUserConfig {
    // Names the generated certificate is valid for; defaults to localhost and 127.0.0.1.
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpUserConfig {
    // Close an HTTP/1.1 connection if no request starts within this time.
    // Like Nginx `keepalive_timeout`
    pub keepalive_timeout_sec: Option<u64>,
    // Like Nginx `client_max_body_size`
    pub max_content_length: Option<usize>,
    // Largest request head inspected for an h2c upgrade offer.
    pub max_head_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ListenerConfig {
    Socket(SocketAddr),
}

impl From<ListenerConfig> for ListenerBuilder {
    fn from(value: ListenerConfig) -> Self {
        match value {
            ListenerConfig::Socket(addr) => ListenerBuilder::from(addr),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct UserConfig {
            #[serde(default)]
            runtime: RuntimeConfig,
            servers: HashMap<String, ServiceConfig<ListenerConfig, ServerUserConfig>>,
        }
        // 1. load from file -> UserConfig
        let file_content = std::fs::read(path)?;
        let user_config = parse_from_slice::<UserConfig>(&file_content)?;

        // 2. UserConfig -> Config
        let UserConfig { runtime, servers } = user_config;
        Ok(Config {
            runtime,
            servers: build_server_config(servers)?,
        })
    }

    /// A single server on `0.0.0.0:port`, with a self-signed certificate unless `cleartext`.
    pub fn demo(port: u16, cleartext: bool) -> anyhow::Result<Self> {
        let user = ServerUserConfig {
            name: "greeter".to_string(),
            tls: (!cleartext).then(TlsUserConfig::default),
            http: HttpUserConfig::default(),
        };
        let listener = ListenerConfig::Socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
        let servers = HashMap::from([(
            "demo".to_string(),
            ServiceConfig {
                listener,
                server: user,
            },
        )]);
        Ok(Config {
            runtime: RuntimeConfig::default(),
            servers: build_server_config(servers)?,
        })
    }
}

pub fn build_server_config(
    servers: HashMap<String, ServiceConfig<ListenerConfig, ServerUserConfig>>,
) -> anyhow::Result<HashMap<String, ServiceConfig<ListenerConfig, ServerConfig>>> {
    let mut servers_new = HashMap::with_capacity(servers.len());
    for (key, server) in servers.into_iter() {
        let ServiceConfig { listener, server } = server;
        let svc_cfg = ServiceConfig {
            listener,
            server: server.try_into()?,
        };
        servers_new.insert(key, svc_cfg);
    }
    Ok(servers_new)
}

impl TryFrom<ServerUserConfig> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(user: ServerUserConfig) -> Result<Self, Self::Error> {
        let tls = match user.tls {
            Some(tls) => {
                let names = match tls.subject_alt_names.is_empty() {
                    true => default_subject_alt_names(),
                    false => tls.subject_alt_names,
                };
                TlsConfig::Rustls(SelfSignedCert::generate(names)?.server_config()?)
            }
            None => TlsConfig::None,
        };

        let defaults = HttpLimits::default();
        let limits = HttpLimits {
            max_content_length: user
                .http
                .max_content_length
                .unwrap_or(defaults.max_content_length),
            max_head_size: user.http.max_head_size.unwrap_or(defaults.max_head_size),
        };
        let keepalive = user
            .http
            .keepalive_timeout_sec
            .map(|sec| Keepalive(Duration::from_secs(sec)))
            .unwrap_or_default();

        Ok(ServerConfig {
            name: user.name,
            tls,
            keepalive,
            limits,
        })
    }
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Servers {
        servers: HashMap<String, ServiceConfig<ListenerConfig, ServerUserConfig>>,
    }

    #[test]
    fn parse_toml() {
        const TEST_CONFIG: &str = r#"
            [servers.tls_server]
            name = "greeter tls"
            listener = { type = "socket", value = "0.0.0.0:8443" }
            tls = { subject_alt_names = ["example.test"] }
            http = { keepalive_timeout_sec = 10, max_content_length = 4096 }

            [servers.plain_server]
            name = "greeter h2c"
            listener = { type = "socket", value = "127.0.0.1:8080" }
        "#;

        let parsed = parse_from_slice::<Servers>(TEST_CONFIG.as_bytes()).unwrap();
        let tls_server = &parsed.servers["tls_server"];
        assert_eq!(
            tls_server.listener,
            ListenerConfig::Socket("0.0.0.0:8443".parse().unwrap())
        );
        assert_eq!(
            tls_server.server.tls,
            Some(TlsUserConfig {
                subject_alt_names: vec!["example.test".to_string()]
            })
        );
        assert_eq!(tls_server.server.http.keepalive_timeout_sec, Some(10));
        assert_eq!(tls_server.server.http.max_head_size, None);

        let plain = &parsed.servers["plain_server"];
        assert!(plain.server.tls.is_none());
        assert_eq!(plain.server.http, HttpUserConfig::default());
    }

    #[test]
    fn parse_json() {
        const TEST_CONFIG: &str = r#"
            {
                "servers": {
                    "demo": {
                        "name": "greeter",
                        "listener": {"type": "socket", "value": "127.0.0.1:8443"},
                        "tls": {}
                    }
                }
            }
        "#;

        let parsed = parse_from_slice::<Servers>(TEST_CONFIG.as_bytes()).unwrap();
        let demo = &parsed.servers["demo"];
        assert_eq!(demo.server.name, "greeter");
        assert_eq!(demo.server.tls, Some(TlsUserConfig::default()));
    }

    #[test]
    fn user_config_defaults() {
        let server = ServerConfig::try_from(ServerUserConfig {
            name: "plain".to_string(),
            tls: None,
            http: HttpUserConfig {
                keepalive_timeout_sec: Some(5),
                ..Default::default()
            },
        })
        .unwrap();
        assert!(matches!(server.tls, TlsConfig::None));
        assert_eq!(server.keepalive, Keepalive(Duration::from_secs(5)));
        assert_eq!(server.limits, HttpLimits::default());
    }

    #[test]
    fn tls_config_generates_certificate() {
        let server = ServerConfig::try_from(ServerUserConfig {
            name: "tls".to_string(),
            tls: Some(TlsUserConfig::default()),
            http: HttpUserConfig::default(),
        })
        .unwrap();
        match server.tls {
            TlsConfig::Rustls(config) => {
                assert_eq!(
                    config.alpn_protocols,
                    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
                )
            }
            TlsConfig::None => panic!("tls should be enabled"),
        }
    }

    #[test]
    fn demo_config() {
        let config = Config::demo(8080, true).unwrap();
        let demo = &config.servers["demo"];
        assert_eq!(
            demo.listener,
            ListenerConfig::Socket("0.0.0.0:8080".parse().unwrap())
        );
        assert!(matches!(demo.server.tls, TlsConfig::None));
    }
}
