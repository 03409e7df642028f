//! The far end of the tunnel: accepts WebSocket connections at `/p`, peels
//! the codec off the raw stream, and serves the single embedded HTTP
//! request — an egress fetch for ordinary methods, an opaque TCP tunnel for
//! CONNECT.

use crate::codec::{self, TUNNEL_MASK};
use crate::common::{
    empty_body, full_body, is_websocket_upgrade, ProxyBody, ResponseBuilder,
};
use crate::config::ServerConfig;
use crate::error::ProxyError;
use crate::metrics;
use crate::tunnel::splice;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

type EgressClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Headers that belong to the proxy hop, not to the origin server.
const HOP_HEADERS: [&str; 4] = [
    "proxy-authorization",
    "proxy-authenticate",
    "proxy-connection",
    "connection",
];

pub struct RemoteProxy {
    egress: EgressClient,
    text_frames: bool,
}

/// Bind and serve until the process is stopped.
pub async fn serve(cfg: ServerConfig) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .map_err(|e| ProxyError::Config(format!("cannot listen on {}: {}", cfg.listen, e)))?;
    log::info!("server listening on {}", cfg.listen);
    serve_on(listener, cfg.text_frames).await
}

/// Serve tunnel sessions on an already-bound listener.
pub async fn serve_on(listener: TcpListener, text_frames: bool) -> Result<(), ProxyError> {
    let proxy = Arc::new(RemoteProxy::new(text_frames));
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let proxy = proxy.clone();
                async move { Ok::<_, Infallible>(proxy.route(req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                log::debug!("connection from {} ended: {}", remote_addr, e);
            }
        });
    }
}

impl RemoteProxy {
    pub fn new(text_frames: bool) -> Self {
        Self {
            egress: Client::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            text_frames,
        }
    }

    async fn route(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        match req.uri().path() {
            "/p" if is_websocket_upgrade(req.headers()) => self.accept_tunnel(req),
            "/metrics" => match metrics::handle().encode() {
                Ok(text) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(full_body(text))
                    .unwrap(),
                Err(e) => {
                    log::error!("failed to encode metrics: {}", e);
                    ResponseBuilder::internal_server_error("metrics unavailable")
                }
            },
            "/" => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(full_body("burrow server\n"))
                .unwrap(),
            path => ResponseBuilder::not_found(path),
        }
    }

    /// Complete the WebSocket handshake and hand the raw stream to a tunnel
    /// session task.
    fn accept_tunnel(self: Arc<Self>, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(key) = req
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .map(|v| derive_accept_key(v.as_bytes()))
        else {
            return ResponseBuilder::error(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let proxy = self.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    metrics::handle().tunnel_sessions.inc();
                    proxy.tunnel_session(TokioIo::new(upgraded)).await;
                }
                Err(e) => log::warn!("tunnel upgrade failed: {}", e),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, key)
            .body(empty_body())
            .unwrap()
    }

    /// Serve the HTTP request embedded in a freshly unwrapped tunnel stream.
    async fn tunnel_session(self: Arc<Self>, io: TokioIo<hyper::upgrade::Upgraded>) {
        let stream = codec::server_stream(codec::boxed(io), TUNNEL_MASK, self.text_frames);
        let proxy = self.clone();
        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            async move { Ok::<_, Infallible>(proxy.serve_embedded(req).await) }
        });
        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            log::debug!("tunnel session ended: {}", e);
        }
    }

    async fn serve_embedded(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        match *req.method() {
            Method::CONNECT => self.serve_connect(req).await,
            _ => self.serve_egress(req).await,
        }
    }

    /// Open a raw TCP tunnel to the CONNECT target.
    async fn serve_connect(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(addr) = req.uri().authority().map(|a| a.to_string()) else {
            return ResponseBuilder::error(StatusCode::BAD_REQUEST, "CONNECT without authority");
        };
        log::info!("CONNECT {}", addr);

        let target = match TcpStream::connect(&addr).await {
            Ok(target) => target,
            Err(e) => {
                log::warn!("cannot reach {}: {}", addr, e);
                return ResponseBuilder::proxy_error(&format!("cannot reach {}: {}", addr, e));
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(tunnel) => splice(TokioIo::new(tunnel), target).await,
                Err(e) => log::warn!("tunnel half upgrade failed: {}", e),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap()
    }

    /// Fetch an ordinary request from the open internet and relay the
    /// response back down the tunnel.
    async fn serve_egress(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        if parts.uri.authority().is_none() {
            let Some(host) = parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
            else {
                return ResponseBuilder::error(StatusCode::BAD_REQUEST, "request has no host");
            };
            let mut uri_parts = parts.uri.into_parts();
            uri_parts.scheme = Some("http".try_into().expect("static scheme"));
            uri_parts.authority = match host.parse() {
                Ok(authority) => Some(authority),
                Err(_) => {
                    return ResponseBuilder::error(StatusCode::BAD_REQUEST, "bad Host header")
                }
            };
            if uri_parts.path_and_query.is_none() {
                uri_parts.path_and_query = Some("/".try_into().expect("static path"));
            }
            parts.uri = match Uri::from_parts(uri_parts) {
                Ok(uri) => uri,
                Err(e) => {
                    return ResponseBuilder::error(
                        StatusCode::BAD_REQUEST,
                        &format!("bad request target: {}", e),
                    )
                }
            };
        }

        for name in HOP_HEADERS {
            let name: HeaderName = name.parse().expect("static header name");
            parts.headers.remove(name);
        }

        log::info!("{} {}", parts.method, parts.uri);
        let outbound = Request::from_parts(parts, body.boxed());
        match self.egress.request(outbound).await {
            Ok(resp) => resp.map(|b| b.boxed()),
            Err(e) => {
                log::warn!("egress fetch failed: {}", e);
                ResponseBuilder::error(
                    StatusCode::BAD_REQUEST,
                    &format!("400 Bad Request: {}", e),
                )
            }
        }
    }
}
