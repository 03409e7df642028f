//! Whole-tunnel integration: WebSocket handshake, codec wrapping, and the
//! remote end's egress proxying, with no corporate proxy in the middle.

use burrow::client;
use burrow::common::{Backend, ProxyRequest};
use burrow::config::ClientConfig;
use burrow::error::ProxyError;
use burrow::proxy::NtlmProxy;
use burrow::remote;
use burrow::routes::RouteTable;
use burrow::tunnel::{RemoteDialer, TunnelBackend};
use bytes::Bytes;
use futures::FutureExt;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

/// Scripted origin server: answers one request per connection.
async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut byte = [0u8; 1];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => buf.extend_from_slice(&byte),
                    }
                }
                stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\n\
                          Content-Length: 5\r\n\
                          Connection: close\r\n\r\nhello",
                    )
                    .await
                    .ok();
            });
        }
    });
    addr
}

/// Echoes every byte back, for exercising CONNECT tunnels.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn spawn_remote(text_frames: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = remote::serve_on(listener, text_frames).await;
    });
    addr
}

fn tunnel_backend(remote_addr: SocketAddr, text_frames: bool) -> TunnelBackend {
    let adapter = Arc::new(NtlmProxy::new(None, None, None).unwrap());
    let url = Url::parse(&format!("ws://{}/p", remote_addr)).unwrap();
    let origin = format!("http://{}/", remote_addr.ip());
    TunnelBackend::new(RemoteDialer::new(adapter, url, origin, text_frames))
}

async fn fetch_through_tunnel(text_frames: bool) {
    let origin = spawn_origin().await;
    let remote_addr = spawn_remote(text_frames).await;
    let backend = tunnel_backend(remote_addr, text_frames);

    let uri: Uri = format!("http://{}/", origin).parse().unwrap();
    let req = ProxyRequest::new(Method::GET, uri, HeaderMap::new(), Bytes::new());

    let resp = backend.handle(req).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello", "text_frames={}", text_frames);
}

#[tokio::test]
async fn http_request_round_trips_through_the_tunnel() {
    fetch_through_tunnel(false).await;
}

#[tokio::test]
async fn http_request_round_trips_through_the_text_tunnel() {
    fetch_through_tunnel(true).await;
}

async fn connect_through_tunnel(text_frames: bool) {
    let echo = spawn_echo().await;
    let remote_addr = spawn_remote(text_frames).await;

    // Full client end, with the echo host routed straight to the tunnel.
    let cfg = ClientConfig {
        proxy: None,
        ..ClientConfig::default()
    };
    let table = RouteTable::new();
    let adapter = Arc::new(NtlmProxy::new(None, None, None).unwrap());
    let backend: Arc<dyn Backend> = Arc::new(tunnel_backend(remote_addr, text_frames));
    table.set(&echo.to_string(), "remote", backend.clone());

    let (router, _backends) = client::compose(
        &cfg,
        table.clone(),
        adapter,
        backend,
        Arc::new(|_h, _c| async { Ok::<(), ProxyError>(()) }.boxed()),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = client::serve_on(listener, router).await;
    });

    let mut stream = TcpStream::connect(client_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", echo, echo).as_bytes())
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.extend_from_slice(&byte);
    }
    let head = String::from_utf8_lossy(&head).to_string();
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    stream.write_all(b"ping through the burrow").await.unwrap();
    let mut reply = [0u8; 23];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping through the burrow", "text_frames={}", text_frames);
}

#[tokio::test]
async fn connect_tunnels_raw_bytes_end_to_end() {
    connect_through_tunnel(false).await;
}

#[tokio::test]
async fn connect_tunnels_raw_bytes_through_the_text_tunnel() {
    connect_through_tunnel(true).await;
}
