//! The remote path: dial a WebSocket to the far server through the NTLM
//! adapter, wrap it in the tunnel codec, and marry it to the hijacked
//! client connection.

use crate::codec::{self, TunnelStream, TUNNEL_MASK};
use crate::common::{empty_body, Backend, ProxyBody, ProxyRequest};
use crate::error::ProxyError;
use crate::metrics;
use crate::proxy::NtlmProxy;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use url::Url;

/// Copy both directions between two streams. The reverse direction runs as
/// its own task; each copy shuts down its destination at EOF so the peer
/// half terminates. Errors end the tunnel and are logged, nothing more.
pub async fn splice<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut client_rd, &mut upstream_wr).await {
            log::debug!("tunnel copy to upstream ended: {}", e);
        }
        let _ = upstream_wr.shutdown().await;
    });

    if let Err(e) = tokio::io::copy(&mut upstream_rd, &mut client_wr).await {
        log::debug!("tunnel copy to client ended: {}", e);
    }
    let _ = client_wr.shutdown().await;
}

/// Produces one fresh tunnel connection to the remote server per call.
pub struct RemoteDialer {
    proxy: Arc<NtlmProxy>,
    url: Url,
    origin: String,
    text_frames: bool,
}

impl RemoteDialer {
    pub fn new(proxy: Arc<NtlmProxy>, url: Url, origin: String, text_frames: bool) -> Self {
        Self {
            proxy,
            url,
            origin,
            text_frames,
        }
    }

    /// Dial the WebSocket (through the corporate proxy, so NTLM is
    /// satisfied) and wrap the raw stream in the client-side codec.
    pub async fn connect(&self) -> Result<TunnelStream, ProxyError> {
        let raw = match self.proxy.websocket(&self.url, None, &self.origin).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("connect err: {}", e);
                return Err(e);
            }
        };
        metrics::handle().tunnels_opened.inc();
        Ok(codec::client_stream(raw, TUNNEL_MASK, self.text_frames))
    }
}

/// Backend that serves a request by relaying it through the remote tunnel.
pub struct TunnelBackend {
    dialer: RemoteDialer,
}

impl TunnelBackend {
    pub fn new(dialer: RemoteDialer) -> Self {
        Self { dialer }
    }

    async fn relay_connect(
        &self,
        mut req: ProxyRequest,
        conn: TunnelStream,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (mut sender, task) = http1::handshake(TokioIo::new(conn)).await?;
        tokio::spawn(async move {
            if let Err(e) = task.with_upgrades().await {
                log::debug!("tunnel connection task ended: {}", e);
            }
        });

        let outbound = Request::builder()
            .method(Method::CONNECT)
            .uri(req.uri.clone())
            .header(HOST, req.host())
            .body(http_body_util::Full::new(bytes::Bytes::new()))?;
        let resp = sender.send_request(outbound).await?;
        if !resp.status().is_success() {
            return Err(ProxyError::Connection(format!(
                "remote refused tunnel: {}",
                resp.status()
            )));
        }

        let on_upgrade = req
            .take_upgrade()
            .ok_or_else(|| ProxyError::Connection("connection cannot be hijacked".into()))?;
        tokio::spawn(async move {
            let remote = match hyper::upgrade::on(resp).await {
                Ok(remote) => remote,
                Err(e) => {
                    log::warn!("remote tunnel upgrade failed: {}", e);
                    return;
                }
            };
            match on_upgrade.await {
                Ok(client) => splice(TokioIo::new(client), TokioIo::new(remote)).await,
                Err(e) => log::warn!("client upgrade failed: {}", e),
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())?)
    }

    async fn relay_http(
        &self,
        req: ProxyRequest,
        conn: TunnelStream,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (mut sender, task) = http1::handshake(TokioIo::new(conn)).await?;
        tokio::spawn(async move {
            if let Err(e) = task.await {
                log::debug!("tunnel connection task ended: {}", e);
            }
        });

        // The remote answers with a response followed by EOF.
        let resp = sender.send_request(req.to_request()?).await?;
        Ok(resp.map(|b| b.boxed()))
    }
}

#[async_trait]
impl Backend for TunnelBackend {
    async fn handle(&self, req: ProxyRequest) -> Result<Response<ProxyBody>, ProxyError> {
        let conn = self.dialer.connect().await?;
        if req.method == Method::CONNECT {
            self.relay_connect(req, conn).await
        } else {
            self.relay_http(req, conn).await
        }
    }
}
