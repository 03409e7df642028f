//! Adapter that fronts an NTLM-authenticating upstream proxy.
//!
//! Every exchange follows the three-message flow: send with a Negotiate
//! token, answer the 407 challenge with an Authenticate token, proceed on
//! 200. A proxy that never asks (200 on the first leg) short-circuits the
//! machine. NTLM authenticates the *connection*, so each exchange runs on a
//! dedicated keep-alive connection to the proxy.

use crate::codec;
use crate::common::{empty_body, Backend, BoxedIo, ProxyBody, ProxyRequest};
use crate::error::ProxyError;
use crate::ntlm::{self, NtlmSession};
use crate::tunnel::splice;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, LOCATION, ORIGIN,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use hyper::{Method, Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use sspi::AuthIdentity;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use url::Url;

pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

type EgressClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Validates the final HTTP response of an exchange; an error escalates to
/// the fallback handler.
pub type HttpValidator =
    dyn Fn(&str, StatusCode, &HeaderMap) -> Result<(), ProxyError> + Send + Sync;

/// Validates an established CONNECT tunnel. The probe consumes the
/// connection it is given.
pub type ConnectValidator =
    dyn Fn(String, BoxedIo) -> BoxFuture<'static, Result<(), ProxyError>> + Send + Sync;

pub struct NtlmProxy {
    proxy: Option<Url>,
    identity: Option<AuthIdentity>,
    agent: Option<String>,
    egress: EgressClient,
    valid_http: Option<Box<HttpValidator>>,
    valid_connect: Option<Box<ConnectValidator>>,
    fallback: Option<std::sync::Arc<dyn Backend>>,
}

impl NtlmProxy {
    /// Build an adapter for the proxy at `proxy`. `None` means requests are
    /// dialed directly, which turns this into a plain forward proxy.
    pub fn new(
        proxy: Option<Url>,
        identity: Option<AuthIdentity>,
        agent: Option<String>,
    ) -> Result<Self, ProxyError> {
        if proxy.is_some() && identity.is_none() {
            return Err(ProxyError::Config(
                "an upstream proxy requires NTLM credentials ($PROXY_USER / $PROXY_PASS)".into(),
            ));
        }
        Ok(Self {
            proxy,
            identity,
            agent,
            egress: Client::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            valid_http: None,
            valid_connect: None,
            fallback: None,
        })
    }

    pub fn with_valid_http(mut self, v: Box<HttpValidator>) -> Self {
        self.valid_http = Some(v);
        self
    }

    pub fn with_valid_connect(mut self, v: Box<ConnectValidator>) -> Self {
        self.valid_connect = Some(v);
        self
    }

    pub fn with_fallback(mut self, fallback: std::sync::Arc<dyn Backend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn proxy_addr(&self) -> Result<String, ProxyError> {
        let url = self
            .proxy
            .as_ref()
            .ok_or_else(|| ProxyError::Config("no upstream proxy configured".into()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("proxy URL has no host: {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(format!("{}:{}", host, port))
    }

    fn session(&self, target: &str) -> Result<NtlmSession, ProxyError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| ProxyError::Config("NTLM credentials not configured".into()))?;
        NtlmSession::new(identity, target)
    }

    /// Establish an authenticated CONNECT tunnel to `addr` through the
    /// upstream proxy. Without a proxy this is a plain TCP dial. The
    /// returned stream is ready for a TLS handshake.
    pub async fn dial(&self, addr: &str) -> Result<BoxedIo, ProxyError> {
        if self.proxy.is_none() {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| ProxyError::Connection(format!("dial {}: {}", addr, e)))?;
            return Ok(codec::boxed(stream));
        }

        let proxy_addr = self.proxy_addr()?;
        let stream = TcpStream::connect(&proxy_addr)
            .await
            .map_err(|e| ProxyError::Connection(format!("dial proxy {}: {}", proxy_addr, e)))?;
        let (mut sender, conn) = http1::Builder::new()
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                log::debug!("proxy connection task ended: {}", e);
            }
        });

        let mut session = self.session(&proxy_addr)?;
        let negotiate = session.negotiate()?;
        let first = self.connect_request(addr, ntlm::encode_auth_header(&negotiate)?, false)?;
        let resp = sender.send_request(first).await?;

        let authenticated = match resp.status() {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let challenge = challenge_from(resp.headers())?;
                drain(resp).await?;
                let token = session.authenticate(&challenge)?;
                sender
                    .ready()
                    .await
                    .map_err(|e| ProxyError::ProxyAuth(format!("proxy dropped connection: {}", e)))?;
                let second =
                    self.connect_request(addr, ntlm::encode_auth_header(&token)?, true)?;
                let resp = sender.send_request(second).await?;
                if !resp.status().is_success() {
                    return Err(ProxyError::ProxyAuth(format!(
                        "authenticate rejected: {}",
                        resp.status()
                    )));
                }
                resp
            }
            status if status.is_success() => resp,
            status => {
                return Err(ProxyError::ProxyAuth(format!(
                    "unknown challenge: {}",
                    status
                )))
            }
        };

        let upgraded = hyper::upgrade::on(authenticated).await?;
        Ok(codec::boxed(TokioIo::new(upgraded)))
    }

    fn connect_request(
        &self,
        addr: &str,
        auth: HeaderValue,
        keep_alive: bool,
    ) -> Result<Request<Full<Bytes>>, ProxyError> {
        let mut builder = Request::connect(addr)
            .header(HOST, addr)
            .header(PROXY_AUTHORIZATION, auth);
        if let Some(agent) = &self.agent {
            builder = builder.header(USER_AGENT, agent);
        }
        if keep_alive {
            builder = builder.header(PROXY_CONNECTION, HeaderValue::from_static("Keep-Alive"));
        }
        Ok(builder.body(Full::new(Bytes::new()))?)
    }

    /// Open a WebSocket through the proxy and surrender the raw upgraded
    /// byte stream; the framing layer is only a doorway here.
    pub async fn websocket(
        &self,
        url: &Url,
        subprotocol: Option<&str>,
        origin: &str,
    ) -> Result<BoxedIo, ProxyError> {
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("websocket URL has no host: {}", url)))?
            .to_string();
        let secure = matches!(url.scheme(), "wss" | "https");
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });
        let addr = format!("{}:{}", host, port);

        let stream = self.dial(&addr).await?;
        let stream: BoxedIo = if secure {
            let connector =
                tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
            codec::boxed(
                connector
                    .connect(&host, stream)
                    .await
                    .map_err(|e| ProxyError::Connection(format!("TLS to {}: {}", addr, e)))?,
            )
        } else {
            stream
        };

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                log::debug!("websocket connection task ended: {}", e);
            }
        });

        let host_header = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.clone(),
        };
        let key = generate_key();
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(url.path())
            .header(HOST, host_header)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, &key)
            .header(ORIGIN, origin.to_lowercase());
        if let Some(protocol) = subprotocol {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        if let Some(agent) = &self.agent {
            builder = builder.header(USER_AGENT, agent);
        }
        let req = builder.body(Full::new(Bytes::new()))?;

        let resp = sender.send_request(req).await?;
        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(ProxyError::Connection(format!(
                "websocket upgrade refused: {}",
                resp.status()
            )));
        }
        let accept = resp
            .headers()
            .get(SEC_WEBSOCKET_ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if accept != derive_accept_key(key.as_bytes()) {
            return Err(ProxyError::Decode(
                "websocket accept key mismatch".to_string(),
            ));
        }

        let upgraded = hyper::upgrade::on(resp).await?;
        Ok(codec::boxed(TokioIo::new(upgraded)))
    }

    /// CONNECT from the client: tunnel through the proxy, optionally probing
    /// the result before handing it over.
    async fn handle_connect(
        &self,
        mut req: ProxyRequest,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let addr = req.host();
        let mut upstream = self.dial(&addr).await?;

        if let Some(probe) = &self.valid_connect {
            // The probe consumes the tunnel, so success costs a second dial.
            match probe(addr.clone(), upstream).await {
                Ok(()) => {
                    upstream = self.dial(&addr).await?;
                }
                Err(e) => {
                    log::info!("failed to establish connection to {}: {}", addr, e);
                    return match &self.fallback {
                        Some(fallback) => fallback.handle(req).await,
                        None => Err(e),
                    };
                }
            }
        }

        let on_upgrade = req
            .take_upgrade()
            .ok_or_else(|| ProxyError::Connection("connection cannot be hijacked".into()))?;
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(client) => splice(TokioIo::new(client), upstream).await,
                Err(e) => log::warn!("client upgrade failed: {}", e),
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())?)
    }

    /// Forwarded HTTP from the client. The Type-1/Type-2 legs run as a
    /// body-less GET so the handshake cannot eat the request body; the real
    /// method and body ride on the Type-3 leg.
    async fn handle_http(&self, req: ProxyRequest) -> Result<Response<ProxyBody>, ProxyError> {
        if self.proxy.is_none() {
            let resp = self
                .egress
                .request(req.to_request()?)
                .await
                .map_err(|e| ProxyError::Connection(e.to_string()))?;
            return self.finish_http(req, resp).await;
        }

        let proxy_addr = self.proxy_addr()?;
        let stream = TcpStream::connect(&proxy_addr)
            .await
            .map_err(|e| ProxyError::Connection(format!("dial proxy {}: {}", proxy_addr, e)))?;
        let (mut sender, conn) = http1::Builder::new()
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log::debug!("proxy connection task ended: {}", e);
            }
        });

        let mut session = self.session(&proxy_addr)?;
        let negotiate = session.negotiate()?;

        let mut first = Request::builder()
            .method(Method::GET)
            .uri(req.uri.clone())
            .body(Full::new(Bytes::new()))?;
        *first.headers_mut() = req.headers.clone();
        first.headers_mut().remove(CONTENT_LENGTH);
        first.headers_mut().remove(TRANSFER_ENCODING);
        first
            .headers_mut()
            .insert(PROXY_AUTHORIZATION, ntlm::encode_auth_header(&negotiate)?);

        let resp = sender.send_request(first).await?;

        let was_plain_get = req.method == Method::GET && req.body.is_empty();
        let last = if resp.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            let challenge = challenge_from(resp.headers())?;
            drain(resp).await?;
            let token = session.authenticate(&challenge)?;
            sender
                .ready()
                .await
                .map_err(|e| ProxyError::ProxyAuth(format!("proxy dropped connection: {}", e)))?;

            let mut authenticated = req.to_request()?;
            authenticated
                .headers_mut()
                .insert(PROXY_AUTHORIZATION, ntlm::encode_auth_header(&token)?);
            authenticated
                .headers_mut()
                .insert(PROXY_CONNECTION, HeaderValue::from_static("Keep-Alive"));
            sender.send_request(authenticated).await?
        } else if !was_plain_get {
            // The proxy accepted without a challenge, but what it answered
            // was the stripped handshake GET. Replay the real request on the
            // same keep-alive connection.
            drain(resp).await?;
            sender
                .ready()
                .await
                .map_err(|e| ProxyError::ProxyAuth(format!("proxy dropped connection: {}", e)))?;
            sender.send_request(req.to_request()?).await?
        } else {
            resp
        };

        self.finish_http(req, last).await
    }

    async fn finish_http(
        &self,
        req: ProxyRequest,
        resp: Response<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if let Some(validate) = &self.valid_http {
            let host = req.host();
            if let Err(e) = validate(&host, resp.status(), resp.headers()) {
                match &self.fallback {
                    Some(fallback) => {
                        log::info!("invalid response from {} ({}), using fallback", host, e);
                        return fallback.handle(req).await;
                    }
                    None => log::warn!("invalid response from {}: {}", host, e),
                }
            }
        }
        Ok(resp.map(|b| b.boxed()))
    }
}

#[async_trait]
impl Backend for NtlmProxy {
    async fn handle(&self, req: ProxyRequest) -> Result<Response<ProxyBody>, ProxyError> {
        match req.method {
            Method::CONNECT => self.handle_connect(req).await,
            _ => self.handle_http(req).await,
        }
    }
}

/// Pull the NTLM challenge out of the 407's `Proxy-Authenticate` headers.
fn challenge_from(headers: &HeaderMap) -> Result<Vec<u8>, ProxyError> {
    let value = headers
        .get_all(PROXY_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("NTLM"))
        .ok_or_else(|| ProxyError::ProxyAuth("no NTLM challenge in 407 response".into()))?;
    ntlm::decode_challenge(value)
}

/// Consume and discard a response body so the connection can be reused.
async fn drain(resp: Response<Incoming>) -> Result<(), ProxyError> {
    let mut body = resp.into_body();
    while let Some(frame) = body.frame().await {
        frame?;
    }
    Ok(())
}

/// Default policy deciding whether the local proxy actually answered or the
/// content filter got in the way: hard errors are `NotFound`, and redirects
/// (other than 304) pointing at the filter host are `Filtered`.
pub fn default_valid_http(
    filter_host: &str,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<(), ProxyError> {
    if status.as_u16() >= 400 {
        return Err(ProxyError::NotFound(status.to_string()));
    }
    if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
        if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
            let url = Url::parse(location)?;
            if url.host_str() == Some(filter_host) {
                return Err(ProxyError::Filtered(location.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_location(location: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, location.parse().unwrap());
        headers
    }

    #[test]
    fn valid_http_flags_filter_redirects() {
        let err = default_valid_http(
            "alert.scansafe.net",
            StatusCode::FOUND,
            &headers_with_location("http://alert.scansafe.net/blocked?u=x"),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Filtered(_)));
    }

    #[test]
    fn valid_http_allows_ordinary_redirects() {
        default_valid_http(
            "alert.scansafe.net",
            StatusCode::FOUND,
            &headers_with_location("https://example.com/elsewhere"),
        )
        .unwrap();
    }

    #[test]
    fn valid_http_ignores_not_modified() {
        default_valid_http("alert.scansafe.net", StatusCode::NOT_MODIFIED, &HeaderMap::new())
            .unwrap();
    }

    #[test]
    fn valid_http_rejects_client_errors() {
        let err = default_valid_http("alert.scansafe.net", StatusCode::FORBIDDEN, &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[test]
    fn challenge_needs_ntlm_header() {
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHENTICATE, "Basic realm=\"corp\"".parse().unwrap());
        assert!(challenge_from(&headers).is_err());
    }
}
