use greeter_core::context::{NegotiationRoute, PeerAddr};

// Connection context, filled stage by stage as the connection moves down the stack.
certain_map::certain_map! {
    #[style = "unfilled"]
    #[derive(Debug, Clone)]
    #[empty(EmptyContext)]
    #[full(FullContext)]
    pub struct Context {
        // Set by ContextService
        peer_addr: PeerAddr,
        // Set by HttpNegotiator
        negotiation_route: NegotiationRoute,
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use certain_map::ParamSet;
    use service_async::ParamRef;

    use super::*;

    #[test]
    pub fn test_add_entries_to_context() {
        let ctx = Context::new();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let ctx = ctx.param_set(PeerAddr::from(addr));
        let ctx = ctx.param_set(NegotiationRoute::CleartextUpgrade);
        assert_eq!(ParamRef::<PeerAddr>::param_ref(&ctx).0, addr);
        assert_eq!(
            *ParamRef::<NegotiationRoute>::param_ref(&ctx),
            NegotiationRoute::CleartextUpgrade
        );
    }
}
