//! Wires the client end together: the handler name table, the probing
//! adapter with its learning callbacks, route persistence, and the listen
//! loop.

use crate::common::{host_without_port, Backend, BoxedIo};
use crate::config::ClientConfig;
use crate::error::ProxyError;
use crate::proxy::{self, ConnectValidator, HttpValidator, NtlmProxy};
use crate::router::{BlockBackend, Router};
use crate::routes::{BackendMap, RouteTable};
use crate::tunnel::{RemoteDialer, TunnelBackend};
use futures::future::{BoxFuture, FutureExt};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Probe applied to a freshly established CONNECT tunnel. The default sends
/// a TLS handshake; a filtered proxy answers that with garbage or a close.
pub type ConnectProbe =
    Arc<dyn Fn(String, BoxedIo) -> BoxFuture<'static, Result<(), ProxyError>> + Send + Sync>;

pub fn tls_connect_probe() -> ConnectProbe {
    Arc::new(|host, conn| {
        async move {
            let server_name = host_without_port(&host).to_string();
            let connector =
                tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
            connector
                .connect(&server_name, conn)
                .await
                .map_err(|e| ProxyError::Connection(format!("TLS probe to {}: {}", host, e)))?;
            Ok(())
        }
        .boxed()
    })
}

/// Assemble the router: named backends, plus the probe adapter whose
/// validation callbacks learn routes. Learning happens on spawned tasks so
/// the client's response is not held up by the table lock.
pub fn compose(
    cfg: &ClientConfig,
    table: RouteTable,
    proxy_handler: Arc<NtlmProxy>,
    remote: Arc<dyn Backend>,
    connect_probe: ConnectProbe,
) -> Result<(Arc<Router>, BackendMap), ProxyError> {
    let block: Arc<dyn Backend> = Arc::new(BlockBackend);
    let proxy_backend: Arc<dyn Backend> = proxy_handler.clone();

    let mut backends: BackendMap = HashMap::new();
    backends.insert("proxy".to_string(), proxy_backend.clone());
    backends.insert("remote".to_string(), remote.clone());
    backends.insert("block".to_string(), block);

    let filter_host = cfg.filter_host.clone();
    let learn_table = table.clone();
    let learn_remote = remote.clone();
    let valid_http: Box<HttpValidator> = Box::new(move |host, status, headers| {
        let result = proxy::default_valid_http(&filter_host, status, headers);
        if result.is_err() {
            let table = learn_table.clone();
            let remote = learn_remote.clone();
            let host = host.to_string();
            tokio::spawn(async move {
                table.set(&host, "remote", remote);
            });
        }
        result
    });

    let learn_table = table.clone();
    let learn_remote = remote.clone();
    let learn_proxy = proxy_backend.clone();
    let valid_connect: Box<ConnectValidator> = Box::new(move |host, conn| {
        let table = learn_table.clone();
        let remote = learn_remote.clone();
        let proxy = learn_proxy.clone();
        let probe = connect_probe(host.clone(), conn);
        async move {
            match probe.await {
                Ok(()) => {
                    // The tunnel will be re-established after the probe;
                    // remember the decision for this session only.
                    tokio::spawn(async move {
                        table.set(&host, "", proxy);
                    });
                    Ok(())
                }
                Err(e) => {
                    tokio::spawn(async move {
                        table.set(&host, "remote", remote);
                    });
                    Err(e)
                }
            }
        }
        .boxed()
    });

    let probe = Arc::new(
        NtlmProxy::new(cfg.proxy_url()?, cfg.identity(), cfg.agent.clone())?
            .with_valid_http(valid_http)
            .with_valid_connect(valid_connect)
            .with_fallback(remote),
    );

    let router = Arc::new(Router::new(table, probe));
    Ok((router, backends))
}

/// Run the client end to completion.
pub async fn run(cfg: ClientConfig) -> Result<(), ProxyError> {
    let endpoint = cfg.remote_endpoint()?;
    log::info!("address of the websocket to connect to: {}", endpoint.ws_url);
    match &cfg.proxy {
        Some(proxy) => log::info!("with http proxy {}", proxy),
        None => log::info!("without http proxy"),
    }

    let table = RouteTable::new();
    let adapter = Arc::new(NtlmProxy::new(
        cfg.proxy_url()?,
        cfg.identity(),
        cfg.agent.clone(),
    )?);
    let dialer = RemoteDialer::new(
        adapter.clone(),
        endpoint.ws_url,
        endpoint.origin,
        cfg.text_frames,
    );
    let remote: Arc<dyn Backend> = Arc::new(TunnelBackend::new(dialer));

    let (router, backends) = compose(&cfg, table.clone(), adapter, remote, tls_connect_probe())?;

    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&cfg.route_file)
        .await
        .map_err(|e| ProxyError::Persistence(format!("cannot open {}: {}", cfg.route_file, e)))?;
    let reader = file
        .try_clone()
        .await
        .map_err(|e| ProxyError::Persistence(format!("cannot reopen {}: {}", cfg.route_file, e)))?;
    table
        .load(tokio::io::BufReader::new(reader), &backends)
        .await
        .map_err(|e| ProxyError::Persistence(format!("cannot load {}: {}", cfg.route_file, e)))?;
    table.auto_save_to(Some(file)).await;
    log::info!("loaded {} routes from {}", table.len(), cfg.route_file);

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .map_err(|e| ProxyError::Config(format!("cannot listen on port {}: {}", cfg.port, e)))?;
    log::info!("start listening :{}", cfg.port);
    serve_on(listener, router).await
}

/// Accept proxy connections on an already-bound listener.
pub async fn serve_on(listener: TcpListener, router: Arc<Router>) -> Result<(), ProxyError> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let router = router.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { Ok::<_, Infallible>(router.dispatch(req).await) }
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
