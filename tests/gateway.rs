//! Gateway behavior against a mock API, using wiremock

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use todo_gateway::models::UserProfile;
use todo_gateway::state::MemoryAuthState;
use todo_gateway::{AuthSnapshot, AuthState, AuthUpdate, Gateway, RequestDescriptor, RequestError};

fn session(access: &str, refresh: Option<&str>) -> Arc<MemoryAuthState> {
    Arc::new(MemoryAuthState::new(AuthSnapshot {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        user: Some(UserProfile {
            id: "u1".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            ..UserProfile::default()
        }),
        initialized: true,
    }))
}

// Records how often the gateway wipes the session
struct CountingAuthState {
    inner: MemoryAuthState,
    clears: AtomicUsize,
}

impl CountingAuthState {
    fn new(snapshot: AuthSnapshot) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryAuthState::new(snapshot),
            clears: AtomicUsize::new(0),
        })
    }

    fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl AuthState for CountingAuthState {
    fn read(&self) -> AuthSnapshot {
        self.inner.read()
    }

    fn write(&self, update: AuthUpdate) {
        self.inner.write(update);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear();
    }
}

fn create_gateway(server: &MockServer, auth: Arc<dyn AuthState>) -> Gateway {
    Gateway::builder(&server.uri()).build(auth).unwrap()
}

async fn mount_refresh(server: &MockServer, response: ResponseTemplate, times: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refreshToken": "R1" })))
        .respond_with(response)
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn valid_token_returns_body_without_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T1"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, ResponseTemplate::new(200), 0).await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let body = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap();

    assert_eq!(body, json!({ "data": [] }));
    assert_eq!(auth.read(), session("T1", Some("R1")).read());
}

#[tokio::test]
async fn anonymous_request_has_no_authorization_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/signup"))
        .and(body_json(json!({ "email": "ada@example.com" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "message": "ok" })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = create_gateway(&server, session("", None));
    gateway
        .send(RequestDescriptor::post("/auth/signup").with_body(json!({ "email": "ada@example.com" })))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("authorization").is_none());
    assert_eq!(
        requests[0].headers.get("content-type").unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn get_sends_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(query_param("status", "open"))
        .and(query_param("search", "buy milk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [1] })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = create_gateway(&server, session("T1", None));
    let body = gateway
        .send(
            RequestDescriptor::get("todos")
                .with_token("T1")
                .with_query("status", "open")
                .with_query("search", "buy milk"),
        )
        .await
        .unwrap();
    assert_eq!(body, json!({ "data": [1] }));
}

#[tokio::test]
async fn expired_token_is_refreshed_and_request_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Token expired" })))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "data": { "accessToken": "T2" } })),
        1,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "id": 1 }] })))
        .expect(1)
        .mount(&server)
        .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let body = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap();

    assert_eq!(body, json!({ "data": [{ "id": 1 }] }));
    let snapshot = auth.read();
    assert_eq!(snapshot.access_token, "T2");
    assert_eq!(snapshot.refresh_token.as_deref(), Some("R1"));
    assert!(snapshot.user.is_some());
}

#[tokio::test]
async fn rotated_refresh_token_is_stored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(json!({ "data": { "accessToken": "T2", "refreshToken": "R2" } })),
        1,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    gateway.send_authenticated(RequestDescriptor::get("/todos")).await.unwrap();

    assert_eq!(auth.read().refresh_token.as_deref(), Some("R2"));
}

#[tokio::test]
async fn failed_retry_is_returned_without_second_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/todos/7"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "data": { "accessToken": "T2" } })),
        1,
    )
    .await;
    Mock::given(method("DELETE"))
        .and(path("/todos/7"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Still no" })))
        .expect(1)
        .mount(&server)
        .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let err = gateway
        .send(RequestDescriptor::delete("/todos/7").with_token("T1"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RequestError::Http {
            status: 401,
            message: "Still no".to_string()
        }
    );
    assert_eq!(auth.read().access_token, "T2");
}

#[tokio::test]
async fn missing_refresh_token_clears_session_and_returns_original_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Unauthorized" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let auth = CountingAuthState::new(session("T1", None).read());
    let gateway = create_gateway(&server, auth.clone());
    let err = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RequestError::Http {
            status: 401,
            message: "Unauthorized".to_string()
        }
    );
    assert_eq!(auth.clears(), 1);
    let snapshot = auth.read();
    assert!(!snapshot.is_authenticated());
    assert!(snapshot.user.is_none());
}

#[tokio::test]
async fn expired_refresh_token_clears_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(401)
            .set_body_json(json!({ "message": "Refresh token has expired" })),
        1,
    )
    .await;

    let auth = CountingAuthState::new(session("T1", Some("R1")).read());
    let gateway = create_gateway(&server, auth.clone());
    let err = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap_err();

    assert!(err.is_refresh_expired());
    assert_eq!(auth.clears(), 1);
    let snapshot = auth.read();
    assert_eq!(snapshot.access_token, "");
    assert_eq!(snapshot.refresh_token, None);
    assert_eq!(snapshot.user, None);
}

#[tokio::test]
async fn transient_refresh_failure_keeps_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(503).set_body_string("upstream unavailable"),
        1,
    )
    .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let err = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RequestError::Http {
            status: 503,
            message: "upstream unavailable".to_string()
        }
    );
    assert_eq!(auth.read(), session("T1", Some("R1")).read());
}

#[tokio::test]
async fn other_refresh_401_keeps_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(401).set_body_json(json!({ "message": "Invalid refresh token" })),
        1,
    )
    .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let err = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap_err();

    assert!(err.is_unauthorized());
    assert!(auth.read().is_authenticated());
}

#[tokio::test]
async fn refresh_response_without_token_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "data": { "user": {} } })),
        1,
    )
    .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let err = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::InvalidRefreshResponse(_)));
    assert_eq!(auth.read().access_token, "T1");
}

#[tokio::test]
async fn server_error_is_returned_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/todos/1"))
        .and(body_json(json!({ "completed": true })))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "boom" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let err = gateway
        .send(
            RequestDescriptor::put("/todos/1")
                .with_token("T1")
                .with_body(json!({ "completed": true })),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert_eq!(err.to_string(), "Request failed (500): boom");
    assert!(auth.read().is_authenticated());
}

#[tokio::test]
async fn malformed_and_empty_success_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not valid json"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/todos/1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let gateway = create_gateway(&server, session("T1", None));
    let err = gateway
        .send(RequestDescriptor::get("/broken").with_token("T1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Parse(_)));

    let body = gateway
        .send(RequestDescriptor::delete("/todos/1").with_token("T1"))
        .await
        .unwrap();
    assert!(body.is_null());
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let gateway = Gateway::builder("http://127.0.0.1:1")
        .timeout(Duration::from_secs(2))
        .build(session("T1", Some("R1")))
        .unwrap();

    let err = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Network(_) | RequestError::Timeout(_)));
}

#[tokio::test]
async fn concurrent_expiries_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(json!({ "data": { "accessToken": "T2" } }))
            .set_delay(Duration::from_millis(200)),
        1,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(2)
        .mount(&server)
        .await;

    let auth = session("T1", Some("R1"));
    let gateway = create_gateway(&server, auth.clone());
    let (first, second) = tokio::join!(
        gateway.send(RequestDescriptor::get("/todos").with_token("T1")),
        gateway.send(RequestDescriptor::get("/todos").with_token("T1")),
    );

    assert_eq!(first.unwrap(), json!({ "data": [] }));
    assert_eq!(second.unwrap(), json!({ "data": [] }));
    assert_eq!(auth.read().access_token, "T2");
}

#[tokio::test]
async fn stale_token_after_refresh_retries_without_refreshing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .and(header("Authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    // Session already holds a newer token than the one this request carried
    let auth = session("T2", Some("R1"));
    let gateway = create_gateway(&server, auth);
    let body = gateway
        .send(RequestDescriptor::get("/todos").with_token("T1"))
        .await
        .unwrap();
    assert_eq!(body, json!({ "data": [] }));
}
