//! End-to-end relay tests over real sockets
//!
//! This test verifies:
//! 1. A stream tunnel client receives EXPOSED, then OPEN and frames for public TCP traffic
//! 2. CTRL PING is answered with a PONG echoing its timestamp
//! 3. HTTP ingress is forwarded over the tunnel and answered from the client's RESPONSE
//! 4. Ownership probe endpoints follow attachment state
//! 5. The exposure API reuses ports, rejects type changes and keeps the
//!    advertised HTTP subdomain once the client attaches
//! 6. Browser WebSockets are relayed as WS messages over the tunnel
//! 7. A second control channel for a tunnel replaces the first

use futures::{SinkExt, StreamExt};
use portgate_control::{RegistryConfig, TunnelRegistry};
use portgate_proto::frame;
use portgate_proto::{
    ControlMessage, ControlType, HttpMessageType, HttpTunnelMessage, TunnelMessage, WsTunnelMessage,
    WsType,
};
use portgate_relay::{build_router, AppState, CustomDomain};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);
const BASE_DOMAIN: &str = "portgate.test";

async fn start_relay(forward_timeout: Duration) -> (SocketAddr, Arc<TunnelRegistry>) {
    let registry = Arc::new(TunnelRegistry::new(
        RegistryConfig::new()
            .with_listen_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_public_host("net.portgate.test")
            .with_base_domain(BASE_DOMAIN)
            .with_forward_timeout(forward_timeout),
    ));
    let state = AppState::new(registry.clone()).with_custom_domains(&[CustomDomain {
        domain: "www.customer.io".into(),
        subdomain: "shop".into(),
    }]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    ws
}

/// Next text or binary message, skipping transport pings
async fn next_message(ws: &mut Ws) -> Message {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("websocket ended")
            .unwrap();
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

async fn next_tunnel_message(ws: &mut Ws) -> TunnelMessage {
    match next_message(ws).await {
        Message::Text(text) => TunnelMessage::parse(&text).unwrap(),
        other => panic!("expected text message, got {:?}", other),
    }
}

async fn next_ws_message(ws: &mut Ws) -> WsTunnelMessage {
    match next_tunnel_message(ws).await {
        TunnelMessage::Ws(message) => message,
        other => panic!("expected WS message, got {:?}", other),
    }
}

async fn send_tunnel_message(ws: &mut Ws, message: impl Into<TunnelMessage>) {
    let text = message.into().to_json().unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn wait_for_status(client: &reqwest::Client, url: &str, expected: u16) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = client.get(url).send().await.unwrap().status().as_u16();
        if status == expected {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "{} stayed {}", url, status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_stream_tunnel_tcp_relay() {
    let (addr, _registry) = start_relay(Duration::from_secs(5)).await;
    let mut client = connect(addr, "/api/net-proxy/tunnel/tcp-1?type=tcp").await;

    let exposed = next_ws_message(&mut client).await;
    assert_eq!(exposed.ws_type, WsType::Exposed);
    assert_eq!(exposed.public_host.as_deref(), Some("net.portgate.test"));
    let port = exposed.public_port.unwrap();

    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let open = next_ws_message(&mut client).await;
    assert_eq!(open.ws_type, WsType::Open);
    let connection_id = open.connection_id.unwrap();

    public.write_all(b"hello").await.unwrap();
    let Message::Binary(data) = next_message(&mut client).await else {
        panic!("expected binary frame");
    };
    let inbound = frame::decode(data.into()).unwrap();
    assert_eq!(inbound.connection_id, connection_id);
    assert_eq!(&inbound.payload[..], b"hello");

    let reply = frame::encode(&connection_id, b"world").unwrap();
    client.send(Message::Binary(reply.to_vec())).await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, public.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"world");

    send_tunnel_message(&mut client, WsTunnelMessage::close(&connection_id, None, None)).await;
    let mut rest = Vec::new();
    let n = timeout(WAIT, public.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let (addr, _registry) = start_relay(Duration::from_secs(5)).await;
    let mut client = connect(addr, "/api/tunnel/http-ping?subdomain=ping").await;

    send_tunnel_message(&mut client, ControlMessage::ping(42)).await;
    match next_tunnel_message(&mut client).await {
        TunnelMessage::Control(pong) => {
            assert_eq!(pong.control_type, ControlType::Pong);
            assert_eq!(pong.ts, Some(42));
        }
        other => panic!("expected PONG, got {:?}", other),
    }
}

/// Answer every HTTP REQUEST with 201 and the path and body echoed back
fn spawn_http_client(mut client: Ws) {
    tokio::spawn(async move {
        while let Some(Ok(message)) = client.next().await {
            let Message::Text(text) = message else { continue };
            let Ok(TunnelMessage::Http(request)) = TunnelMessage::parse(&text) else {
                continue;
            };
            assert_eq!(request.message_type, HttpMessageType::Request);

            let mut headers = HashMap::new();
            headers.insert("x-tunnel-path".to_string(), request.path.clone().unwrap_or_default());
            headers.insert("connection".to_string(), "close".to_string());
            let body = format!(
                "{} {}?{} {}",
                request.method.as_deref().unwrap_or_default(),
                request.path.as_deref().unwrap_or_default(),
                request.query.as_deref().unwrap_or_default(),
                String::from_utf8(request.body().unwrap()).unwrap()
            );
            let response = HttpTunnelMessage::response(&request.id, 201, headers, body.as_bytes());
            let text = TunnelMessage::from(response).to_json().unwrap();
            if client.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });
}

#[tokio::test]
async fn test_http_ingress_over_tunnel() {
    let (addr, _registry) = start_relay(Duration::from_secs(5)).await;
    let client = connect(addr, "/api/tunnel/http-1?subdomain=shop").await;
    spawn_http_client(client);

    let http = reqwest::Client::new();
    wait_for_status(&http, &format!("http://{}/resolve/shop", addr), 200).await;

    let response = http
        .post(format!("http://{}/orders?id=7", addr))
        .header("x-forwarded-host", "shop.portgate.test")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(response.headers()["x-tunnel-path"], "/orders");
    assert_eq!(response.text().await.unwrap(), "POST /orders?id=7 payload");

    let response = http
        .get(format!("http://{}/_/shop/api/items", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(response.text().await.unwrap(), "GET /api/items? ");

    let response = http
        .get(format!("http://{}/", addr))
        .header("x-forwarded-host", "www.customer.io")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(
        http.get(format!("http://{}/resolve-custom/www.customer.io", addr))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16(),
        200
    );
}

#[tokio::test]
async fn test_ingress_errors() {
    let (addr, registry) = start_relay(Duration::from_millis(300)).await;
    let http = reqwest::Client::new();

    let response = http
        .get(format!("http://{}/", addr))
        .header("x-forwarded-host", "ghost.portgate.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    // registered but no control channel
    registry.register_http("idle-tunnel", "idle");
    let response = http
        .get(format!("http://{}/_/idle/", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);

    // attached client that never answers
    let _silent = connect(addr, "/api/tunnel/silent-tunnel?subdomain=silent").await;
    wait_for_status(&http, &format!("http://{}/resolve/silent", addr), 200).await;
    let response = http
        .get(format!("http://{}/_/silent/", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 504);
    assert_eq!(registry.pending_request_count(), 0);
}

#[tokio::test]
async fn test_probe_follows_attachment() {
    let (addr, _registry) = start_relay(Duration::from_secs(5)).await;
    let http = reqwest::Client::new();
    let probe = format!("http://{}/resolve/blog", addr);

    assert_eq!(http.get(&probe).send().await.unwrap().status().as_u16(), 404);

    let mut client = connect(addr, "/api/tunnel/blog-tunnel?subdomain=blog").await;
    wait_for_status(&http, &probe, 200).await;
    assert_eq!(
        http.get(format!("http://{}/resolve/other", addr))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16(),
        404
    );

    client.close(None).await.unwrap();
    wait_for_status(&http, &probe, 404).await;
}

#[tokio::test]
async fn test_expose_api() {
    let (addr, _registry) = start_relay(Duration::from_secs(5)).await;
    let http = reqwest::Client::new();
    let url = format!("http://{}/api/net-proxy/expose", addr);

    let first: serde_json::Value = http
        .post(&url)
        .json(&serde_json::json!({"tunnelId": "api-tcp", "tunnelType": "TCP"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["publicHost"], "net.portgate.test");
    assert_eq!(first["tunnelId"], "api-tcp");
    let port = first["publicPort"].as_u64().unwrap();
    assert!(port > 0);

    let again: serde_json::Value = http
        .post(&url)
        .json(&serde_json::json!({"tunnelId": "api-tcp", "tunnelType": "TCP"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["publicPort"].as_u64(), Some(port));

    let conflict = http
        .post(&url)
        .json(&serde_json::json!({"tunnelId": "api-tcp", "tunnelType": "UDP"}))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status().as_u16(), 409);
    let body: serde_json::Value = conflict.json().await.unwrap();
    assert!(body["error"].as_str().is_some());

    let http_tunnel: serde_json::Value = http
        .post(&url)
        .json(&serde_json::json!({"tunnelId": "api-http", "tunnelType": "HTTP", "subdomain": "docs"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(http_tunnel["publicHost"], "docs.portgate.test");
    assert!(http_tunnel.get("publicPort").is_none());
}

#[tokio::test]
async fn test_exposed_subdomain_survives_attach() {
    let (addr, _registry) = start_relay(Duration::from_secs(5)).await;
    let http = reqwest::Client::new();

    let exposed: serde_json::Value = http
        .post(format!("http://{}/api/net-proxy/expose", addr))
        .json(&serde_json::json!({"tunnelId": "Web-Tunnel-1", "tunnelType": "HTTP"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let subdomain = exposed["subdomain"].as_str().unwrap().to_string();
    assert_eq!(subdomain, "webtunnel1");
    assert_eq!(exposed["publicUrl"], "https://webtunnel1.portgate.test");

    let _client = connect(addr, "/api/tunnel/Web-Tunnel-1").await;
    wait_for_status(&http, &format!("http://{}/resolve/{}", addr, subdomain), 200).await;
    assert_eq!(
        http.get(format!("http://{}/resolve/web-tunnel-1", addr))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16(),
        404
    );
}

#[tokio::test]
async fn test_browser_websocket_over_tunnel() {
    let (addr, _registry) = start_relay(Duration::from_secs(5)).await;
    let mut client = connect(addr, "/api/tunnel/chat-tunnel?subdomain=chat").await;
    wait_for_status(
        &reqwest::Client::new(),
        &format!("http://{}/resolve/chat", addr),
        200,
    )
    .await;

    let mut browser = connect(addr, "/_ws/chat/socket?room=1").await;

    let open = next_ws_message(&mut client).await;
    assert_eq!(open.ws_type, WsType::Open);
    assert_eq!(open.path.as_deref(), Some("/socket"));
    assert_eq!(open.query.as_deref(), Some("room=1"));
    let headers = open.headers.clone().unwrap_or_default();
    assert!(!headers.contains_key("sec-websocket-key"));
    let connection_id = open.connection_id.unwrap();
    send_tunnel_message(&mut client, WsTunnelMessage::open_ok(&connection_id)).await;

    browser.send(Message::Text("hi".into())).await.unwrap();
    let text = next_ws_message(&mut client).await;
    assert_eq!(text.ws_type, WsType::Text);
    assert_eq!(text.connection_id.as_deref(), Some(connection_id.as_str()));
    assert_eq!(text.text.as_deref(), Some("hi"));

    browser.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let binary = next_ws_message(&mut client).await;
    assert_eq!(binary.ws_type, WsType::Binary);
    assert_eq!(binary.data().unwrap(), vec![1, 2, 3]);

    send_tunnel_message(&mut client, WsTunnelMessage::text(&connection_id, "hello")).await;
    assert_eq!(next_message(&mut browser).await, Message::Text("hello".into()));

    send_tunnel_message(&mut client, WsTunnelMessage::binary(&connection_id, &[9, 8])).await;
    assert_eq!(next_message(&mut browser).await, Message::Binary(vec![9, 8]));

    send_tunnel_message(
        &mut client,
        WsTunnelMessage::close(&connection_id, Some(1000), Some("done".into())),
    )
    .await;
    match next_message(&mut browser).await {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert_eq!(frame.reason, "done");
        }
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_browser_close_notifies_client() {
    let (addr, registry) = start_relay(Duration::from_secs(5)).await;
    let mut client = connect(addr, "/api/tunnel/close-tunnel?subdomain=closer").await;
    wait_for_status(
        &reqwest::Client::new(),
        &format!("http://{}/resolve/closer", addr),
        200,
    )
    .await;

    let mut browser = connect(addr, "/_ws/closer/").await;
    let open = next_ws_message(&mut client).await;
    let connection_id = open.connection_id.unwrap();

    browser.close(None).await.unwrap();
    let close = next_ws_message(&mut client).await;
    assert_eq!(close.ws_type, WsType::Close);
    assert_eq!(close.connection_id.as_deref(), Some(connection_id.as_str()));

    let tunnel = registry.get("close-tunnel").unwrap();
    assert_eq!(tunnel.connection_count(), 0);
}

#[tokio::test]
async fn test_second_channel_replaces_first() {
    let (addr, registry) = start_relay(Duration::from_secs(5)).await;

    let mut first = connect(addr, "/api/net-proxy/tunnel/shared?type=tcp").await;
    let port = next_ws_message(&mut first).await.public_port.unwrap();

    let mut second = connect(addr, "/api/net-proxy/tunnel/shared?type=tcp").await;
    let exposed = next_ws_message(&mut second).await;
    assert_eq!(exposed.public_port, Some(port));

    // the displaced session is closed by the relay
    let ended = timeout(WAIT, async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    // traffic now reaches only the second client
    let _public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let open = next_ws_message(&mut second).await;
    assert_eq!(open.ws_type, WsType::Open);
    assert!(registry.get("shared").unwrap().is_attached());
}
