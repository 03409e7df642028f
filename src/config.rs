use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use url::Url;

fn default_port() -> u16 {
    8282
}

fn default_remote() -> String {
    env_or("REMOTE_PROXY", "http://localhost:8000")
}

fn default_route_file() -> String {
    "data.txt".to_string()
}

fn default_filter_host() -> String {
    "alert.scansafe.net".to_string()
}

fn default_listen() -> String {
    let port = env_or("PORT", "8080");
    format!("0.0.0.0:{}", port)
}

/// Read an environment variable with a fallback default.
pub fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

/// Read an environment variable, treating empty as unset.
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Configuration of the client end: the local listener, the upstream NTLM
/// proxy, and the remote tunnel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local listen port for browser proxy requests.
    pub port: u16,
    /// Remote tunnel endpoint; `http`/`https` schemes map to `ws`/`wss`.
    pub remote: String,
    /// Upstream NTLM proxy URL. Empty means destinations are dialed directly.
    pub proxy: Option<String>,
    /// User-Agent sent on upstream handshakes.
    pub agent: Option<String>,
    /// NTLM credentials for the upstream proxy.
    pub user: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    /// Path of the persisted route decision file.
    pub route_file: String,
    /// Host of the content filter's redirect page.
    pub filter_host: String,
    /// Pack the tunnel payload into UTF-8 so text-only transports accept it.
    pub text_frames: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            remote: default_remote(),
            proxy: env_opt("HTTP_PROXY"),
            agent: env_opt("AGENT"),
            user: env_opt("PROXY_USER"),
            password: env_opt("PROXY_PASS"),
            domain: env_opt("PROXY_DOMAIN"),
            route_file: default_route_file(),
            filter_host: default_filter_host(),
            text_frames: false,
        }
    }
}

/// The resolved WebSocket address of the remote server.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub ws_url: Url,
    pub origin: String,
}

impl ClientConfig {
    /// Map the configured remote address onto its WebSocket URL and the
    /// Origin header value the handshake sends.
    pub fn remote_endpoint(&self) -> Result<RemoteEndpoint, ProxyError> {
        let url = Url::parse(&self.remote)?;
        let (ws_scheme, origin_scheme) = match url.scheme() {
            "http" | "ws" => ("ws", "http"),
            "https" | "wss" => ("wss", "https"),
            other => {
                return Err(ProxyError::Config(format!(
                    "unknown remote scheme: {}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("remote URL has no host: {}", self.remote)))?;

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let ws_url = Url::parse(&format!("{}://{}/p", ws_scheme, authority))?;
        let origin = format!("{}://{}/", origin_scheme, host);
        Ok(RemoteEndpoint { ws_url, origin })
    }

    pub fn proxy_url(&self) -> Result<Option<Url>, ProxyError> {
        match &self.proxy {
            None => Ok(None),
            Some(raw) => {
                // Accept bare host:port as well as full URLs.
                let parsed = if raw.contains("://") {
                    Url::parse(raw)?
                } else {
                    Url::parse(&format!("http://{}", raw))?
                };
                if parsed.host_str().is_none() {
                    return Err(ProxyError::Config(format!("proxy URL has no host: {}", raw)));
                }
                Ok(Some(parsed))
            }
        }
    }

    /// NTLM identity for the upstream proxy, if credentials were supplied.
    pub fn identity(&self) -> Option<sspi::AuthIdentity> {
        let username = self.user.clone()?;
        Some(sspi::AuthIdentity {
            username,
            password: self.password.clone().unwrap_or_default().into(),
            domain: self.domain.clone(),
        })
    }
}

/// Configuration of the server end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, `$PORT` selects the port when set.
    pub listen: String,
    /// Expect UTF-8 packed tunnel payload.
    pub text_frames: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            text_frames: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_remote(remote: &str) -> ClientConfig {
        ClientConfig {
            remote: remote.to_string(),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn remote_endpoint_http() {
        let endpoint = config_with_remote("http://example.net:8000")
            .remote_endpoint()
            .unwrap();
        assert_eq!(endpoint.ws_url.as_str(), "ws://example.net:8000/p");
        assert_eq!(endpoint.origin, "http://example.net/");
    }

    #[test]
    fn remote_endpoint_https() {
        let endpoint = config_with_remote("https://tunnel.example.com")
            .remote_endpoint()
            .unwrap();
        assert_eq!(endpoint.ws_url.as_str(), "wss://tunnel.example.com/p");
        assert_eq!(endpoint.origin, "https://tunnel.example.com/");
    }

    #[test]
    fn remote_endpoint_rejects_unknown_scheme() {
        assert!(config_with_remote("ftp://example.com").remote_endpoint().is_err());
    }

    #[test]
    fn proxy_url_accepts_bare_host_port() {
        let cfg = ClientConfig {
            proxy: Some("proxy.corp:3128".to_string()),
            ..ClientConfig::default()
        };
        let url = cfg.proxy_url().unwrap().unwrap();
        assert_eq!(url.host_str(), Some("proxy.corp"));
        assert_eq!(url.port(), Some(3128));
    }
}
