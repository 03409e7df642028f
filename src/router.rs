//! Request dispatch: consult the route table, or probe the local proxy and
//! learn from the outcome.

use crate::common::{
    full_body, Backend, ProxyBody, ProxyRequest, ResponseBuilder,
};
use crate::error::ProxyError;
use crate::metrics;
use crate::routes::RouteTable;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;

/// Backend that refuses outright; the persisted name is `block`.
pub struct BlockBackend;

#[async_trait]
impl Backend for BlockBackend {
    async fn handle(&self, _req: ProxyRequest) -> Result<Response<ProxyBody>, ProxyError> {
        Ok(ResponseBuilder::forbidden())
    }
}

/// Top-level dispatcher for the client end.
pub struct Router {
    table: RouteTable,
    probe: Arc<dyn Backend>,
}

impl Router {
    /// `probe` handles hosts the table does not know yet; its validation
    /// callbacks are what feed the table.
    pub fn new(table: RouteTable, probe: Arc<dyn Backend>) -> Self {
        Self { table, probe }
    }

    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        // Origin-form requests target the proxy's own admin surface.
        if req.uri().authority().is_none() && req.method() != Method::CONNECT {
            return self.admin(req);
        }

        let req = match ProxyRequest::from_incoming(req).await {
            Ok(req) => req,
            Err(e) => {
                log::warn!("failed to read request: {}", e);
                return ResponseBuilder::internal_server_error("failed to read request");
            }
        };
        let host = req.host();
        if host.is_empty() {
            return ResponseBuilder::error(StatusCode::BAD_REQUEST, "request has no host");
        }

        let (label, backend) = match self.table.lookup(&host) {
            Some(entry) => {
                let label = if entry.name.is_empty() {
                    "proxy".to_string()
                } else {
                    entry.name
                };
                (label, entry.backend)
            }
            None => ("probe".to_string(), self.probe.clone()),
        };

        log::info!("{:<10} <- {} {}", label, req.method, host);
        metrics::handle()
            .requests
            .with_label_values(&[label.as_str()])
            .inc();

        match backend.handle(req).await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("{} {} failed: {}", label, host, e);
                ResponseBuilder::error(e.client_status(), &e.to_string())
            }
        }
    }

    fn admin(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match req.uri().path() {
            "/" => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(full_body(format!(
                    "burrow client\nroutes cached: {}\n",
                    self.table.len()
                )))
                .unwrap(),
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
            path => ResponseBuilder::not_found(path),
        }
    }
}
