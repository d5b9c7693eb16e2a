//! Edge forwarding against live relay instances
//!
//! This test verifies:
//! 1. Requests reach the instance that answers the ownership probe
//! 2. X-Forwarded-Host and X-Forwarded-Proto carry the original request
//! 3. An unreachable instance yields 502 and no instances yields 503
//! 4. Plain HTTP redirects to HTTPS except for ACME challenges
//! 5. TLS is terminated with the fallback certificate end to end, and the
//!    accept loop keeps serving after a broken handshake
//! 6. WebSocket upgrades pass through to the selected instance

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Path, Request};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use portgate_cert::{CertificateResolver, HttpCertificateLookup, ResolverConfig, SniAcceptor};
use portgate_edge::{
    build_http_router, build_https_router, serve_https, EdgeState, RedirectState,
};
use portgate_router::{HttpOwnershipProbe, Instance, OwnershipRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const BASE_DOMAIN: &str = "portgate.test";

/// Fake relay owning `owned`. `/ws` echoes text frames prefixed with
/// `name:`; every other request is echoed as
/// `name|path?query|x-forwarded-host|x-forwarded-proto`
async fn start_instance(name: &'static str, owned: &'static str) -> String {
    let app = Router::new()
        .route(
            "/ws",
            get(move |ws: WebSocketUpgrade| async move {
                ws.on_upgrade(move |mut socket| async move {
                    while let Some(Ok(message)) = socket.recv().await {
                        if let WsMessage::Text(text) = message {
                            let reply = format!("{}:{}", name, text.as_str());
                            if socket.send(WsMessage::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                })
            }),
        )
        .route(
            "/resolve/{subdomain}",
            get(move |Path(requested): Path<String>| async move {
                if requested == owned {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FOUND
                }
            }),
        )
        .fallback(move |request: Request| async move {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string()
            };
            let path = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            format!(
                "{}|{}|{}|{}",
                name,
                path,
                header("x-forwarded-host"),
                header("x-forwarded-proto")
            )
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn edge_state(instances: Vec<Instance>) -> EdgeState {
    let probe = Arc::new(HttpOwnershipProbe::new(Duration::from_secs(2)));
    let router = Arc::new(
        OwnershipRouter::new(probe, BASE_DOMAIN).with_probe_timeout(Duration::from_secs(2)),
    );
    EdgeState::new(router, instances)
}

async fn serve_plain(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Client that sends `host` to `addr`
fn client_for(host: &str, addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve(host, addr)
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_forwards_to_owner() {
    let alpha = start_instance("alpha", "alpha").await;
    let beta = start_instance("beta", "beta").await;
    let state = edge_state(vec![
        Instance::new("alpha", alpha),
        Instance::new("beta", beta),
    ]);
    let addr = serve_plain(build_https_router(state)).await;

    let host = "beta.portgate.test";
    let response = client_for(host, addr)
        .get(format!("http://{}:{}/items?page=2", host, addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.text().await.unwrap();
    let fields: Vec<&str> = body.split('|').collect();
    assert_eq!(fields[0], "beta");
    assert_eq!(fields[1], "/items?page=2");
    assert!(fields[2].starts_with("beta.portgate.test"));
    assert_eq!(fields[3], "https");
}

#[tokio::test]
async fn test_public_host_selects_instance() {
    let alpha = start_instance("alpha", "none").await;
    let beta = start_instance("beta", "none").await;
    let state = edge_state(vec![
        Instance::new("alpha", alpha).with_public_host("net-a.portgate.test"),
        Instance::new("beta", beta).with_public_host("net-b.portgate.test"),
    ]);
    let addr = serve_plain(build_https_router(state)).await;

    let host = "net.portgate.test";
    let body = client_for(host, addr)
        .get(format!(
            "http://{}:{}/api/net-proxy/expose?public-host=NET-B.portgate.test",
            host,
            addr.port()
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("beta|"));
}

#[tokio::test]
async fn test_upstream_failures() {
    let state = edge_state(vec![Instance::new("dead", dead_address().await)]);
    let addr = serve_plain(build_https_router(state)).await;
    let host = "shop.portgate.test";
    let response = client_for(host, addr)
        .get(format!("http://{}:{}/", host, addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let addr = serve_plain(build_https_router(edge_state(Vec::new()))).await;
    let response = client_for(host, addr)
        .get(format!("http://{}:{}/", host, addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_http_redirect_and_acme_passthrough() {
    let alpha = start_instance("alpha", "shop").await;
    let state = edge_state(vec![Instance::new("alpha", alpha)]);
    let redirect = RedirectState {
        forward: state.with_scheme("http"),
        https_port: 8443,
    };
    let addr = serve_plain(build_http_router(redirect)).await;

    let host = "shop.portgate.test";
    let client = client_for(host, addr);

    let response = client
        .get(format!("http://{}:{}/a?b=1", host, addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        "https://shop.portgate.test:8443/a?b=1"
    );

    let response = client
        .get(format!(
            "http://{}:{}/.well-known/acme-challenge/token-1",
            host,
            addr.port()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert_eq!(
        body.split('|').take(2).collect::<Vec<_>>(),
        ["alpha", "/.well-known/acme-challenge/token-1"]
    );
    assert!(body.ends_with("|http"));
}

#[tokio::test]
async fn test_https_end_to_end() {
    let alpha = start_instance("alpha", "alpha").await;
    let state = edge_state(vec![Instance::new("alpha", alpha)]);

    // The certificate service is down, so the self-signed fallback is served
    let lookup = Arc::new(HttpCertificateLookup::with_timeout(
        dead_address().await,
        Duration::from_secs(1),
    ));
    let resolver = CertificateResolver::new(lookup, ResolverConfig::new(BASE_DOMAIN)).unwrap();
    let acceptor = SniAcceptor::new(Arc::new(resolver));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_https_router(state);
    tokio::spawn(async move {
        let _ = serve_https(listener, acceptor, app).await;
    });

    let host = "alpha.portgate.test";
    let response = client_for(host, addr)
        .get(format!("https://{}:{}/hello", host, addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("alpha|/hello|alpha.portgate.test"));
    assert!(body.ends_with("|https"));
}

#[tokio::test]
async fn test_https_keeps_accepting_after_bad_handshake() {
    use tokio::io::AsyncWriteExt;

    let alpha = start_instance("alpha", "alpha").await;
    let state = edge_state(vec![Instance::new("alpha", alpha)]);
    let lookup = Arc::new(HttpCertificateLookup::with_timeout(
        dead_address().await,
        Duration::from_secs(1),
    ));
    let resolver = CertificateResolver::new(lookup, ResolverConfig::new(BASE_DOMAIN)).unwrap();
    let acceptor = SniAcceptor::new(Arc::new(resolver));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_https_router(state);
    tokio::spawn(async move {
        let _ = serve_https(listener, acceptor, app).await;
    });

    for _ in 0..3 {
        let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(raw);
    }

    let host = "alpha.portgate.test";
    let response = client_for(host, addr)
        .get(format!("https://{}:{}/after", host, addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().starts_with("alpha|/after|"));
}

#[tokio::test]
async fn test_websocket_upgrade_passes_through() {
    let alpha = start_instance("alpha", "none").await;
    let beta = start_instance("beta", "none").await;
    let state = edge_state(vec![
        Instance::new("alpha", alpha).with_public_host("net-a.portgate.test"),
        Instance::new("beta", beta).with_public_host("net-b.portgate.test"),
    ]);
    let addr = serve_plain(build_https_router(state)).await;

    let (mut ws, response) = connect_async(format!(
        "ws://{}/ws?public-host=net-b.portgate.test",
        addr
    ))
    .await
    .unwrap();
    assert_eq!(response.status().as_u16(), 101);

    ws.send(Message::Text("hello".into())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text("beta:hello".into()));

    ws.send(Message::Text("again".into())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text("beta:again".into()));
}

#[tokio::test]
async fn test_websocket_upgrade_to_dead_instance() {
    let state = edge_state(vec![Instance::new("dead", dead_address().await)]);
    let addr = serve_plain(build_https_router(state)).await;

    let result = connect_async(format!("ws://{}/ws", addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 502);
        }
        other => panic!("expected HTTP 502, got {:?}", other.map(|(_, r)| r.status())),
    }
}
