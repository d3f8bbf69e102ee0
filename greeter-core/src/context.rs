use std::net::SocketAddr;

use derive_more::{From, Into};

#[derive(From, Into, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// How the application protocol of a connection was agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRoute {
    /// TLS handshake with ALPN, or the HTTP/1.1 fallback when ALPN selected nothing.
    Alpn,
    /// Cleartext HTTP/1.1 request carrying `Upgrade: h2c`.
    CleartextUpgrade,
    /// Cleartext connection opening with the HTTP/2 connection preface.
    PriorKnowledge,
    /// Cleartext HTTP/1.1 without any upgrade offer.
    Direct,
}

impl NegotiationRoute {
    pub const fn describe(&self) -> &'static str {
        match self {
            NegotiationRoute::Alpn => "ALPN Negotiation",
            NegotiationRoute::CleartextUpgrade => "Cleartext Upgrade",
            NegotiationRoute::PriorKnowledge => "Prior Knowledge",
            NegotiationRoute::Direct => "Direct. No Upgrade Attempted.",
        }
    }
}
