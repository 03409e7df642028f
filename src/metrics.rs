use crate::error::ProxyError;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Process-wide metrics registry shared by both ends of the tunnel.
pub struct Metrics {
    registry: Registry,
    pub requests: IntCounterVec,
    pub tunnels_opened: IntCounter,
    pub tunnel_sessions: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn handle() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("burrow_requests_total", "Proxy requests by backend"),
            &["backend"],
        )
        .expect("metric definition");
        let tunnels_opened = IntCounter::with_opts(Opts::new(
            "burrow_tunnels_opened_total",
            "Remote tunnel connections dialed",
        ))
        .expect("metric definition");
        let tunnel_sessions = IntCounter::with_opts(Opts::new(
            "burrow_tunnel_sessions_total",
            "Tunnel sessions accepted by the server",
        ))
        .expect("metric definition");

        registry
            .register(Box::new(requests.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(tunnels_opened.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(tunnel_sessions.clone()))
            .expect("metric registration");

        Metrics {
            registry,
            requests,
            tunnels_opened,
            tunnel_sessions,
        }
    })
}

impl Metrics {
    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, ProxyError> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| ProxyError::Persistence(format!("metrics encode: {}", e)))?;
        String::from_utf8(buf).map_err(|e| ProxyError::Decode(format!("metrics encode: {}", e)))
    }
}
