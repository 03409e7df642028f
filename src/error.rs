use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request build error: {0}")]
    Request(#[from] http::Error),

    #[error("proxy authentication error: {0}")]
    ProxyAuth(String),

    #[error("response filtered: {0}")]
    Filtered(String),

    #[error("upstream not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("NTLM error: {0}")]
    Ntlm(#[from] sspi::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
}

impl ProxyError {
    /// Whether this failure is the probe's signal to learn a route override.
    pub fn is_route_signal(&self) -> bool {
        matches!(self, ProxyError::Filtered(_) | ProxyError::NotFound(_))
    }

    /// Status code reported to the client when the error escapes a handler.
    pub fn client_status(&self) -> hyper::StatusCode {
        match self {
            ProxyError::ProxyAuth(_)
            | ProxyError::Decode(_)
            | ProxyError::Ntlm(_)
            | ProxyError::Config(_) => hyper::StatusCode::INTERNAL_SERVER_ERROR,
            _ => hyper::StatusCode::BAD_GATEWAY,
        }
    }
}
