use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HOST, CONNECTION, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite};

/// Body type flowing back to proxy clients.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A bidirectional byte stream whose concrete type has been erased.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type BoxedIo = Box<dyn TunnelIo>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Common response builder utilities to eliminate code duplication
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn internal_server_error(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn proxy_error(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, &format!("Proxy Error: {}", message))
    }

    pub fn bad_gateway() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }

    pub fn forbidden() -> Response<ProxyBody> {
        Self::error(StatusCode::FORBIDDEN, "Forbidden")
    }

    pub fn not_found(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::NOT_FOUND, &format!("Not Found: {}", message))
    }

    /// Creates a generic error response with custom status and message
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(full_body(message.to_string()))
            .unwrap()
    }
}

/// An in-flight proxy request with its body buffered and its upgrade handle
/// detached from the hyper machinery, so it can travel through fallback
/// chains without being consumed along the way.
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    upgrade: Option<OnUpgrade>,
}

impl ProxyRequest {
    pub async fn from_incoming(req: Request<Incoming>) -> Result<Self, ProxyError> {
        let (mut parts, body) = req.into_parts();
        let upgrade = parts.extensions.remove::<OnUpgrade>();
        let body = body.collect().await?.to_bytes();
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            upgrade,
        })
    }

    /// The request target host, as the browser spelled it. CONNECT targets
    /// keep their port.
    pub fn host(&self) -> String {
        if let Some(authority) = self.uri.authority() {
            return authority.as_str().to_string();
        }
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// Rebuild an owned hyper request carrying the buffered body. The result
    /// can be produced repeatedly, which is what lets the fallback handler
    /// replay the request intact.
    pub fn to_request(&self) -> Result<Request<Full<Bytes>>, ProxyError> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(Full::new(self.body.clone()))?;
        *req.headers_mut() = self.headers.clone();
        Ok(req)
    }

    /// Commandeer the raw client connection. Yields `None` the second time.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }

    /// Build a request that did not come through a hyper server, e.g. one
    /// originated by the proxy itself. It cannot be hijacked.
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            upgrade: None,
        }
    }
}

/// A request handler behind a route table entry.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn handle(&self, req: ProxyRequest) -> Result<Response<ProxyBody>, ProxyError>;
}

/// Determines if an HTTP request is attempting to upgrade to a WebSocket connection
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_value = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let upgrade_value = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    connection_value
        .split(',')
        .any(|token| token.trim() == "upgrade")
        && upgrade_value == "websocket"
}

/// Strip a trailing `:port` from a host, leaving IPv6 brackets alone.
pub fn host_without_port(host: &str) -> &str {
    let colon = host.rfind(':');
    let bracket = host.rfind(']');
    match (colon, bracket) {
        (Some(c), Some(b)) if c > b => &host[..c],
        (Some(c), None) => &host[..c],
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_stripping() {
        assert_eq!(host_without_port("example.com:443"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:8080"), "[::1]");
        assert_eq!(host_without_port("[::1]"), "[::1]");
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        headers.insert(UPGRADE, "websocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));

        headers.remove(UPGRADE);
        assert!(!is_websocket_upgrade(&headers));
    }
}
