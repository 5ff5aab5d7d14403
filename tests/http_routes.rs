use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::Duration;
use http_body_util::BodyExt;
use mockito::{Matcher, Server};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use token_gate::comms::local_api::{create_router, AppState};
use token_gate::security::{AuthMode, ManualClock, TokenIssuer};
use token_gate::server::GatewayConfig;
use tower::ServiceExt; // for Router::oneshot

const SECRET: &str = "integration-secret";
const PASSWORD: &str = "default_token_password";

struct Gateway {
    app: Router,
    clock: ManualClock,
}

fn gateway_with(config: GatewayConfig) -> Gateway {
    let clock = ManualClock::at_unix(1_700_000_000);
    let issuer = TokenIssuer::new(SECRET.as_bytes(), PASSWORD, config.token_ttl)
        .with_clock(Arc::new(clock.clone()));
    let state = Arc::new(AppState::with_issuer(&config, issuer).unwrap());
    Gateway {
        app: create_router(state).unwrap(),
        clock,
    }
}

fn gateway(upstream: &str) -> Gateway {
    gateway_with(GatewayConfig::new(SECRET, PASSWORD, upstream))
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(resp: Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

async fn request_token(app: &Router, password: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/generate-token")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "password": password }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn issue(app: &Router) -> String {
    let resp = request_token(app, PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::OK);
    body_json(resp).await["token"].as_str().unwrap().to_string()
}

// Consume one request head from a hand-rolled upstream.
async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
}

// Upstream that answers one request with `response` and then hangs up.
async fn truncating_upstream(response: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await;
        socket.write_all(response).await.unwrap();
    });
    format!("http://{addr}")
}

async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: &str) -> Response {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    app.clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_generate_token_returns_token_and_expiry() {
    let gw = gateway("http://127.0.0.1:9");
    let resp = request_token(&gw.app, PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert!(!body["token"].as_str().unwrap().is_empty());
    // 2023-11-14T22:13:20Z plus four hours.
    assert_eq!(body["expires_at"], "2023-11-15T02:13:20Z");
}

#[tokio::test]
async fn test_generate_token_wrong_password() {
    let gw = gateway("http://127.0.0.1:9");
    let resp = request_token(&gw.app, "nope").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["error"], "Invalid password");
}

#[tokio::test]
async fn test_protected_streams_chunked_upstream_body() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_header("content-type", "application/json")
        .match_header("authorization", Matcher::Missing)
        .match_body(Matcher::Json(json!({"model": "llama3", "stream": true})))
        .with_status(200)
        .with_header("content-type", "application/x-ndjson")
        .with_chunked_body(|w| {
            w.write_all(b"{\"message\":\"Hel\"}\n")?;
            w.write_all(b"{\"message\":\"lo\"}\n")?;
            w.write_all(b"{\"done\":true}\n")
        })
        .create_async()
        .await;

    let gw = gateway(&format!("{}/", server.url()));
    let token = issue(&gw.app).await;
    let resp = call(
        &gw.app,
        "POST",
        "/protected/v1/chat/completions",
        Some(&token),
        r#"{"model":"llama3","stream":true}"#,
    )
    .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/x-ndjson");
    assert_eq!(
        body_bytes(resp).await,
        b"{\"message\":\"Hel\"}\n{\"message\":\"lo\"}\n{\"done\":true}\n"
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_protected_forwards_query_string() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/tags")
        .match_query(Matcher::UrlEncoded("verbose".into(), "1".into()))
        .with_status(200)
        .with_body(r#"{"models":[]}"#)
        .create_async()
        .await;

    let gw = gateway(&server.url());
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "GET", "/protected/api/tags?verbose=1", Some(&token), "").await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({"models": []}));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_missing_header_never_reaches_upstream() {
    let mut server = Server::new_async().await;
    let post = server.mock("POST", Matcher::Any).expect(0).create_async().await;
    let get = server.mock("GET", Matcher::Any).expect(0).create_async().await;

    let gw = gateway(&server.url());
    let resp = call(&gw.app, "POST", "/protected/api/generate", None, "{}").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"], "Missing or invalid token");

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/protected/api/tags")
                .header("authorization", "Token abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    post.assert_async().await;
    get.assert_async().await;
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let mut server = Server::new_async().await;
    let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

    let gw = gateway(&server.url());
    let token = issue(&gw.app).await;
    gw.clock.advance(Duration::hours(4));

    let resp = call(&gw.app, "POST", "/protected/api/generate", Some(&token), "{}").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["error"], "Token expired");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_garbage_token_is_forbidden() {
    let gw = gateway("http://127.0.0.1:9");
    let resp = call(&gw.app, "GET", "/protected/api/tags", Some("not.a.jwt"), "").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(body_json(resp).await["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid token"));
}

#[tokio::test]
async fn test_upstream_error_is_passed_through() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/generate")
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"boom"}"#)
        .create_async()
        .await;

    let gw = gateway(&server.url());
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "POST", "/protected/api/generate", Some(&token), "{}").await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_bytes(resp).await, br#"{"error":"boom"}"#);
}

#[tokio::test]
async fn test_unreachable_upstream_is_500() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let gw = gateway(&format!("http://127.0.0.1:{port}"));
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "POST", "/protected/api/generate", Some(&token), "{}").await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_json(resp).await["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to reach upstream"));
}

#[tokio::test]
async fn test_unsupported_method_is_405() {
    let mut server = Server::new_async().await;
    let mock = server.mock("OPTIONS", Matcher::Any).expect(0).create_async().await;

    let gw = gateway(&server.url());
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "OPTIONS", "/protected/api/tags", Some(&token), "").await;

    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_revoke_token_then_use() {
    let gw = gateway("http://127.0.0.1:9");
    let token = issue(&gw.app).await;

    let resp = call(&gw.app, "POST", "/revoke-token", Some(&token), "").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["message"], "Token revoked successfully");

    // The gate no longer accepts it, so a second revoke never reaches the handler.
    let resp = call(&gw.app, "POST", "/revoke-token", Some(&token), "").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["error"], "Token invalid or not found");

    let resp = call(&gw.app, "GET", "/status", Some(&token), "").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_status_reports_upstream() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/")
        .with_status(200)
        .with_body("Ollama is running")
        .create_async()
        .await;

    let gw = gateway(&server.url());
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "GET", "/status", Some(&token), "").await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await,
        json!({"middleware_status": "running", "upstream_status": "running"})
    );
}

#[tokio::test]
async fn test_status_with_unreachable_upstream() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let gw = gateway(&format!("http://127.0.0.1:{port}"));
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "GET", "/status", Some(&token), "").await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["upstream_status"], "not reachable");
}

#[tokio::test]
async fn test_api_key_mode() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/tags")
        .match_header("x-api-key", Matcher::Missing)
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let config = GatewayConfig::new(SECRET, PASSWORD, server.url())
        .with_auth_mode(AuthMode::ApiKey("ollama".into()));
    let gw = gateway_with(config);

    for key in [None, Some(""), Some("wrong")] {
        let mut builder = Request::builder().uri("/protected/api/tags");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        let resp = gw.app.clone().oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/protected/api/tags")
                .header("x-api-key", "ollama")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_revoke_unknown_token_is_404_when_gate_does_not_check_bearer() {
    let config = GatewayConfig::new(SECRET, PASSWORD, "http://127.0.0.1:9")
        .with_auth_mode(AuthMode::Disabled);
    let gw = gateway_with(config);

    let resp = call(&gw.app, "POST", "/revoke-token", Some("never-issued"), "").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["error"], "Token not found");
}

#[tokio::test]
async fn test_upstream_failing_mid_stream_aborts_caller_body() {
    let upstream = truncating_upstream(
        b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ncontent-length: 100\r\n\r\npartial",
    )
    .await;

    let gw = gateway(&upstream);
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "GET", "/protected/api/generate", Some(&token), "").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let mut body = resp.into_body();
    let mut received = Vec::new();
    let mut failed = false;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Some(data) = frame.data_ref() {
                    received.extend_from_slice(data);
                }
            }
            Err(_) => {
                failed = true;
                break;
            }
        }
    }
    assert!(failed, "body completed cleanly after upstream hung up");
    assert!(b"partial".starts_with(&received));
}

#[tokio::test]
async fn test_cut_off_upstream_error_body_is_not_an_empty_passthrough() {
    let upstream = truncating_upstream(
        b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\n{\"error\":\"bo",
    )
    .await;

    let gw = gateway(&upstream);
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "POST", "/protected/api/generate", Some(&token), "{}").await;

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert!(body_json(resp).await["error"]
        .as_str()
        .unwrap()
        .starts_with("Upstream stream interrupted"));
}

#[tokio::test]
async fn test_caller_disconnect_closes_upstream_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n6\r\nfirst\n\r\n",
            )
            .await
            .unwrap();
        // Never finish the body; wait for the proxy to hang up.
        let mut buf = [0u8; 64];
        let closed = matches!(socket.read(&mut buf).await, Ok(0) | Err(_));
        let _ = closed_tx.send(closed);
    });

    let gw = gateway(&format!("http://{addr}"));
    let token = issue(&gw.app).await;
    let resp = call(&gw.app, "GET", "/protected/api/generate", Some(&token), "").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let mut body = resp.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert_eq!(&first.data_ref().unwrap()[..], b"first\n");
    drop(body);

    let closed = tokio::time::timeout(std::time::Duration::from_secs(5), closed_rx)
        .await
        .expect("upstream connection still open after caller went away")
        .unwrap();
    assert!(closed);
}
