pub mod client;
pub mod codec;
pub mod common;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ntlm;
pub mod proxy;
pub mod remote;
pub mod router;
pub mod routes;
pub mod tunnel;

pub use config::{ClientConfig, ServerConfig};
pub use error::ProxyError;
pub use proxy::NtlmProxy;
pub use routes::RouteTable;
