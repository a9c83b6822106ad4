//! End-to-end tests for the admin login flow and request guards.
//!
//! The router runs on in-memory stores with a manual clock; requests go
//! through `tower::ServiceExt::oneshot` without binding a socket. The socket
//! peer is injected as a `ConnectInfo` extension, as the real server does.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::Extension;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use propdesk::clock::{Clock, ManualClock};
use propdesk::config::SecurityConfig;
use propdesk::db::DataConnections;
use propdesk::gateway::{self, AppState, Stores};
use propdesk::otp::OtpSender;
use propdesk::security::{AttemptStage, EnvelopeCipher, TrustedProxies};

const ADMIN_PHONE: &str = "+919876543210";
const COMM_SECRET: &str = "integration-comm-secret";
const CLIENT_IP: &str = "203.0.113.50";

#[derive(Default)]
struct CaptureSender {
    codes: Mutex<HashMap<String, String>>,
}

impl CaptureSender {
    fn code_for(&self, phone: &str) -> String {
        self.codes
            .lock()
            .unwrap()
            .get(phone)
            .cloned()
            .expect("no code sent")
    }
}

#[async_trait]
impl OtpSender for CaptureSender {
    async fn send(&self, phone: &str, code: &str) -> anyhow::Result<()> {
        self.codes
            .lock()
            .unwrap()
            .insert(phone.to_string(), code.to_string());
        Ok(())
    }
}

struct TestApp {
    state: Arc<AppState>,
    router: Router,
    sender: Arc<CaptureSender>,
    clock: Arc<ManualClock>,
}

impl TestApp {
    /// The same service as seen from another socket peer.
    fn router_from(&self, ip: &str) -> Router {
        let ip: IpAddr = ip.parse().unwrap();
        gateway::router(self.state.clone()).layer(Extension(ConnectInfo(SocketAddr::new(ip, 40000))))
    }
}

struct Login {
    token: String,
    session_token: String,
}

fn app() -> TestApp {
    app_behind(TrustedProxies::default())
}

fn app_behind(proxies: TrustedProxies) -> TestApp {
    let config = SecurityConfig {
        jwt_secret: "integration-jwt-secret-0123456789abcdef".to_string(),
        communication_secret: COMM_SECRET.to_string(),
        admin_whitelist: vec![ADMIN_PHONE.to_string()],
        ..SecurityConfig::default()
    };
    let sender = Arc::new(CaptureSender::default());
    let clock = Arc::new(ManualClock::starting_now());
    let state = AppState::new(
        &config,
        Stores::memory(),
        DataConnections::default(),
        sender.clone(),
        clock.clone(),
    )
    .with_trusted_proxies(proxies);
    let mut app = TestApp {
        state: Arc::new(state),
        router: Router::new(),
        sender,
        clock,
    };
    app.router = app.router_from(CLIENT_IP);
    app
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(method: &str, uri: &str, login: &Login) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", login.token))
        .header("x-session-token", &login.session_token)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn login(app: &TestApp) -> Login {
    let (status, _) = send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let code = app.sender.code_for(ADMIN_PHONE);
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/auth/otp/verify",
            json!({ "phone": ADMIN_PHONE, "code": code }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    Login {
        token: body["data"]["token"].as_str().unwrap().to_string(),
        session_token: body["data"]["session_token"].as_str().unwrap().to_string(),
    }
}

#[tokio::test]
async fn test_login_session_logout() {
    let app = app();
    let login = login(&app).await;

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/auth/session", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["phone_number"], ADMIN_PHONE);
    assert_eq!(body["data"]["realm"], "production");

    let (status, body) = send(
        &app.router,
        authed("POST", "/api/auth/logout", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["logged_out"], true);

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/auth/session", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "SESSION_INVALID");
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let app = app();
    let request = Request::builder()
        .method("GET")
        .uri("/api/auth/session")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_REQUIRED");
}

#[tokio::test]
async fn test_new_login_evicts_previous_session() {
    let app = app();
    let first = login(&app).await;
    let second = login(&app).await;

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/auth/session", &first)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "SESSION_INVALID");

    let (status, _) = send(
        &app.router,
        authed("GET", "/api/auth/session", &second)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_idle_session_expires() {
    let app = app();
    let login = login(&app).await;

    app.clock.advance(Duration::minutes(31));
    let (status, body) = send(
        &app.router,
        authed("GET", "/api/auth/session", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "SESSION_INVALID");
}

#[tokio::test]
async fn test_otp_rate_limit_escalates_to_block() {
    let app = app();
    for _ in 0..3 {
        let (status, _) = send(
            &app.router,
            post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");

    // The block outlives the limiter window and hides its cause.
    let (status, body) = send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ACCESS_DENIED");
    assert_eq!(body["error"], "Access denied. Please try again later.");
}

#[tokio::test]
async fn test_repeated_otp_failures_block_ip() {
    let app = app();
    for _ in 0..5 {
        let (status, body) = send(
            &app.router,
            post_json(
                "/api/auth/otp/verify",
                json!({ "phone": ADMIN_PHONE, "code": "000000" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "OTP_INVALID");
    }

    let (status, body) = send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ACCESS_DENIED");
}

#[tokio::test]
async fn test_unlisted_phone_rejected() {
    let app = app();
    let (status, body) = send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "phone": "+911234567890" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "NOT_AUTHORIZED");
}

#[tokio::test]
async fn test_replayed_and_stale_requests_rejected() {
    let app = app();
    let login = login(&app).await;
    let now_ms = app.clock.now().timestamp_millis().to_string();

    let with_nonce = |ts: &str, nonce: &str| {
        authed("GET", "/api/auth/session", &login)
            .header("x-request-timestamp", ts)
            .header("x-request-nonce", nonce)
            .body(Body::empty())
            .unwrap()
    };

    let (status, _) = send(&app.router, with_nonce(&now_ms, "nonce-a")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app.router, with_nonce(&now_ms, "nonce-a")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "DUPLICATE_REQUEST");

    let stale = (app.clock.now() - Duration::minutes(10))
        .timestamp_millis()
        .to_string();
    let (status, body) = send(&app.router, with_nonce(&stale, "nonce-b")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "REQUEST_EXPIRED");
}

#[tokio::test]
async fn test_encrypted_request_gets_encrypted_response() {
    let app = app();
    let cipher = EnvelopeCipher::new(COMM_SECRET);
    let sealed = cipher.seal_json(&json!({ "phone": ADMIN_PHONE })).unwrap();

    let (status, body) = send(&app.router, post_json("/api/auth/otp/request", sealed)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["_encrypted"].is_string());

    let opened = cipher.open_json(&body).unwrap().unwrap();
    assert_eq!(opened["code"], 0);
    assert_eq!(opened["data"]["phone"], ADMIN_PHONE);
}

#[tokio::test]
async fn test_malformed_envelope_rejected() {
    let app = app();
    let (status, body) = send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "_encrypted": "***" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_blocked_ip_can_be_cleared_by_admin() {
    let app = app();
    let login = login(&app).await;

    // A different client trips the OTP limiter.
    let attacker = app.router_from("198.51.100.9");
    for _ in 0..4 {
        send(
            &attacker,
            post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
        )
        .await;
    }

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/security/blocked-ips", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let blocks = body["data"].as_array().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0]["ip_address"], "198.51.100.9");

    let (status, _) = send(
        &app.router,
        authed("DELETE", "/api/security/blocked-ips/198.51.100.9", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app.router,
        authed("DELETE", "/api/security/blocked-ips/198.51.100.9", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_reports_memory_storage() {
    let app = app();
    let request = Request::builder()
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["storage"], "memory");
}

#[tokio::test]
async fn test_spoofed_forwarded_for_ignored() {
    let app = app();
    let mut accepted = 0;
    for i in 0..20 {
        let mut request = post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE }));
        request.headers_mut().insert(
            "x-forwarded-for",
            format!("198.51.100.{}", i + 1).parse().unwrap(),
        );
        let (status, _) = send(&app.router, request).await;
        if status == StatusCode::OK {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 3);

    // The block lands on the real peer, not on the claimed addresses.
    assert!(app.state.ledger.is_blocked(CLIENT_IP).await);
    assert!(!app.state.ledger.is_blocked("198.51.100.4").await);

    let (status, _) = send(
        &app.router_from("198.51.100.4"),
        post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_trusted_proxy_forwards_client_ip() {
    let app = app_behind(TrustedProxies::parse(&["10.0.0.1"]).unwrap());
    let proxy = app.router_from("10.0.0.1");
    for _ in 0..4 {
        let mut request = post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE }));
        request
            .headers_mut()
            .insert("x-forwarded-for", "198.51.100.9, 10.0.0.1".parse().unwrap());
        send(&proxy, request).await;
    }

    assert!(app.state.ledger.is_blocked("198.51.100.9").await);
    assert!(!app.state.ledger.is_blocked("10.0.0.1").await);
}

#[tokio::test]
async fn test_idle_session_does_not_block_ip() {
    let app = app();
    let login = login(&app).await;

    app.clock.advance(Duration::minutes(31));
    for _ in 0..5 {
        let (status, body) = send(
            &app.router,
            authed("GET", "/api/auth/session", &login)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "SESSION_INVALID");
    }

    let (status, _) = send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "phone": ADMIN_PHONE })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!app.state.ledger.is_blocked(CLIENT_IP).await);
}

#[tokio::test]
async fn test_forged_session_tokens_block_ip() {
    let app = app();
    let login = login(&app).await;

    for i in 0..5 {
        let forged = Login {
            token: login.token.clone(),
            session_token: format!("{:064x}", i),
        };
        let (status, _) = send(
            &app.router,
            authed("GET", "/api/auth/session", &forged)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    assert!(app.state.ledger.is_blocked(CLIENT_IP).await);
}

#[tokio::test]
async fn test_protected_route_opens_envelope() {
    let app = app();
    let login = login(&app).await;
    let cipher = EnvelopeCipher::new(COMM_SECRET);
    let sealed = cipher.seal_json(&json!({ "include": "session" })).unwrap();

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/auth/session", &login)
            .header("content-type", "application/json")
            .body(Body::from(sealed.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let opened = cipher.open_json(&body).unwrap().unwrap();
    assert_eq!(opened["data"]["phone_number"], ADMIN_PHONE);
}

#[tokio::test]
async fn test_protected_route_malformed_envelope_logged() {
    let app = app();
    let login = login(&app).await;

    let (status, body) = send(
        &app.router,
        authed("POST", "/api/auth/logout", &login)
            .header("content-type", "application/json")
            .body(Body::from(json!({ "_encrypted": "***" }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let recent = app.state.attempts.recent(10).await.unwrap();
    let entry = recent
        .iter()
        .find(|a| a.stage == AttemptStage::PayloadDecrypt)
        .expect("payload failure recorded");
    assert!(!entry.success);
    assert_eq!(entry.phone_number.as_deref(), Some(ADMIN_PHONE));
    assert_eq!(entry.session_token.as_deref(), Some(login.session_token.as_str()));

    // The handler never ran, so the session survives.
    let (status, _) = send(
        &app.router,
        authed("GET", "/api/auth/session", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_login_route_malformed_envelope_logged() {
    let app = app();
    send(
        &app.router,
        post_json("/api/auth/otp/request", json!({ "_encrypted": "***" })),
    )
    .await;

    let recent = app.state.attempts.recent(10).await.unwrap();
    assert_eq!(recent[0].stage, AttemptStage::PayloadDecrypt);
    assert_eq!(recent[0].ip_address, CLIENT_IP);
}

#[tokio::test]
async fn test_deactivated_admin_rejected_with_live_session() {
    let app = app();
    let login = login(&app).await;

    // Deactivated without revoking sessions, as a racing login would leave it.
    app.state.credentials.deactivate(ADMIN_PHONE).await.unwrap();

    let (status, body) = send(
        &app.router,
        authed("GET", "/api/auth/session", &login)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ACCOUNT_DISABLED");
}
