use std::collections::BTreeMap;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use opendata_gateway::gateway::{
    ApiEndpointConfig, ApiVersionConfig, DurationUnit, Gateway, GatewayConfig, GatewayHttpState,
    PermitConfig, PolicyConfig, Protocol, RateLimitConfig, SqliteStore, router,
};
use serde_json::json;
use tower::util::ServiceExt;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_millis() as u64
}

fn http_version(url: &str) -> ApiVersionConfig {
    ApiVersionConfig {
        version: 1,
        enabled: true,
        disabled_message: None,
        protocol: Protocol::Http,
        url: url.to_string(),
        method: "GET".to_string(),
        header_params: Vec::new(),
        query_params: Vec::new(),
        path_params: vec!["id".to_string()],
        static_headers: BTreeMap::new(),
        has_body: false,
        body_schema: None,
        soap_template: None,
    }
}

fn base_config(version: ApiVersionConfig, policy: PolicyConfig) -> GatewayConfig {
    let mut permit = PermitConfig::new("permit-1", "pk-1", "u-1", "items", &policy.name);
    permit.created_at_ms = now_ms();
    GatewayConfig {
        permits: vec![permit],
        policies: vec![policy],
        endpoints: vec![ApiEndpointConfig {
            name: "items".to_string(),
            enabled: true,
            disabled_message: None,
            versions: vec![version],
        }],
        backend_timeout_secs: 10,
    }
}

fn bare_policy() -> PolicyConfig {
    PolicyConfig {
        name: "bare".to_string(),
        rate_limit: None,
        payment: None,
    }
}

async fn app(config: GatewayConfig) -> (tempfile::TempDir, GatewayHttpState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
    store.init().await.expect("init");
    let gateway = Gateway::new(config, store).expect("gateway");
    gateway.ledger().bootstrap().await.expect("bootstrap");
    gateway
        .ledger()
        .ensure_user_account("u-1")
        .await
        .expect("account");
    (dir, GatewayHttpState::new(gateway))
}

fn call_request(payload: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/pk-1/1")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request")
}

#[tokio::test]
async fn forwards_path_params_and_passes_the_backend_response_through() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET).path("/items/7");
        then.status(200)
            .header("content-type", "application/json")
            .body(json!({"ok": true}).to_string());
    });

    let config = base_config(
        http_version(&format!("{}/items/{{id}}", upstream.base_url())),
        bare_policy(),
    );
    let (_dir, state) = app(config).await;
    let app = router(state);

    let response = app
        .oneshot(call_request(json!({"path": {"id": "7"}})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-opendata-latency"));

    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed, json!({"ok": true}));
    mock.assert();
}

#[tokio::test]
async fn backend_error_statuses_pass_through_untouched() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(GET).path("/items/7");
        then.status(418).body("teapot");
    });

    let config = base_config(
        http_version(&format!("{}/items/{{id}}", upstream.base_url())),
        bare_policy(),
    );
    let (_dir, state) = app(config).await;

    let response = router(state)
        .oneshot(call_request(json!({"path": {"id": "7"}})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&body[..], b"teapot");
}

#[tokio::test]
async fn fourth_call_in_the_window_is_rate_limited() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET).path("/items/7");
        then.status(200).body("{}");
    });

    let policy = PolicyConfig {
        name: "limited".to_string(),
        rate_limit: Some(RateLimitConfig {
            unit: DurationUnit::Minute,
            multiplier: 1,
            points: 3,
        }),
        payment: None,
    };
    let config = base_config(
        http_version(&format!("{}/items/{{id}}", upstream.base_url())),
        policy,
    );
    let (_dir, state) = app(config).await;
    let app = router(state);

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(call_request(json!({"path": {"id": "7"}})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let rejected = app
        .oneshot(call_request(json!({"path": {"id": "7"}})))
        .await
        .expect("response");
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers()["X-RateLimit-Remaining"], "0");
    assert_eq!(rejected.headers()["X-RateLimit-Limit"], "3");
    assert!(rejected.headers().contains_key("Retry-After"));
    mock.assert_calls(3);
}

#[tokio::test]
async fn body_schema_mismatch_is_rejected_naming_the_field() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET).path("/items/7");
        then.status(200).body("{}");
    });

    let mut version = http_version(&format!("{}/items/{{id}}", upstream.base_url()));
    version.has_body = true;
    version.body_schema = Some(
        serde_json::from_value(json!({
            "type": "object",
            "children": [{"key": "age", "type": "number"}]
        }))
        .expect("schema"),
    );
    let config = base_config(version, bare_policy());
    let (_dir, state) = app(config).await;
    let app = router(state);

    let rejected = app
        .clone()
        .oneshot(call_request(
            json!({"path": {"id": "7"}, "body": {"age": "12"}}),
        ))
        .await
        .expect("response");
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(rejected.into_body(), usize::MAX).await.expect("body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert!(
        parsed["error"]["message"]
            .as_str()
            .expect("message")
            .contains("age")
    );
    mock.assert_calls(0);

    let accepted = app
        .oneshot(call_request(
            json!({"path": {"id": "7"}, "body": {"age": 12}}),
        ))
        .await
        .expect("response");
    assert_eq!(accepted.status(), StatusCode::OK);
    mock.assert_calls(1);
}

#[tokio::test]
async fn unknown_permit_is_not_found_and_blocked_permit_conflicts() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(GET).path("/items/7");
        then.status(200).body("{}");
    });

    let mut config = base_config(
        http_version(&format!("{}/items/{{id}}", upstream.base_url())),
        bare_policy(),
    );
    config.permits[0].blocked = true;
    config.permits[0].block_reason = Some("fraud review".to_string());
    let (_dir, state) = app(config).await;
    let app = router(state);

    let unknown = Request::builder()
        .method("POST")
        .uri("/no-such-key/1")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .expect("request");
    let response = app.clone().oneshot(unknown).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let blocked = app
        .oneshot(call_request(json!({"path": {"id": "7"}})))
        .await
        .expect("response");
    assert_eq!(blocked.status(), StatusCode::CONFLICT);
    let body = to_bytes(blocked.into_body(), usize::MAX).await.expect("body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert!(
        parsed["error"]["message"]
            .as_str()
            .expect("message")
            .contains("fraud review")
    );
}

#[tokio::test]
async fn disabled_version_surfaces_its_message() {
    let mut version = http_version("http://unused.example/items/{id}");
    version.enabled = false;
    version.disabled_message = Some("v1 is sunset, use v2".to_string());
    let config = base_config(version, bare_policy());
    let (_dir, state) = app(config).await;

    let response = router(state)
        .oneshot(call_request(json!({"path": {"id": "7"}})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["error"]["message"], "v1 is sunset, use v2");
}

#[tokio::test]
async fn static_headers_override_caller_headers() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET)
            .path("/items/7")
            .header("x-api-key", "service-pinned");
        then.status(200).body("{}");
    });

    let mut version = http_version(&format!("{}/items/{{id}}", upstream.base_url()));
    version
        .static_headers
        .insert("x-api-key".to_string(), "service-pinned".to_string());
    let config = base_config(version, bare_policy());
    let (_dir, state) = app(config).await;

    let response = router(state)
        .oneshot(call_request(json!({
            "path": {"id": "7"},
            "headers": {"x-api-key": "caller-attempt"}
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert();
}

#[tokio::test]
async fn soap_version_posts_the_rendered_template_as_xml() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/soap")
            .header("content-type", "text/xml")
            .body_includes("<City>Berlin</City>");
        then.status(200)
            .header("content-type", "text/xml")
            .body("<Forecast>sunny</Forecast>");
    });

    let version = ApiVersionConfig {
        version: 1,
        enabled: true,
        disabled_message: None,
        protocol: Protocol::Soap,
        url: format!("{}/soap", upstream.base_url()),
        method: "POST".to_string(),
        header_params: Vec::new(),
        query_params: Vec::new(),
        path_params: Vec::new(),
        static_headers: BTreeMap::new(),
        has_body: true,
        body_schema: None,
        soap_template: Some(
            "&lt;Envelope&gt;&lt;City&gt;{{city}}&lt;/City&gt;&lt;/Envelope&gt;".to_string(),
        ),
    };
    let config = base_config(version, bare_policy());
    let (_dir, state) = app(config).await;

    let response = router(state)
        .oneshot(call_request(json!({"body": {"city": "Berlin"}})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&body[..], b"<Forecast>sunny</Forecast>");
    mock.assert();
}

#[tokio::test]
async fn admin_routes_are_absent_without_a_token_and_guarded_with_one() {
    let config = base_config(http_version("http://unused.example/items/{id}"), bare_policy());
    let (_dir, state) = app(config.clone()).await;

    let absent = Request::builder()
        .method("GET")
        .uri("/admin/permits")
        .body(Body::empty())
        .expect("request");
    let response = router(state).oneshot(absent).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let (_dir, state) = app(config).await;
    let state = state.with_admin_token("admin-token");
    let app = router(state);

    let unauthorized = Request::builder()
        .method("GET")
        .uri("/admin/permits")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(unauthorized).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let authorized = Request::builder()
        .method("GET")
        .uri("/admin/permits")
        .header("x-admin-token", "admin-token")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(authorized).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let permits: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(permits[0]["api_key"], "redacted");

    let with_keys = Request::builder()
        .method("GET")
        .uri("/admin/permits?include_keys=true")
        .header("x-admin-token", "admin-token")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(with_keys).await.expect("response");
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let permits: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(permits[0]["api_key"], "pk-1");
}

#[tokio::test]
async fn admin_deposit_credits_the_user_account() {
    let config = base_config(http_version("http://unused.example/items/{id}"), bare_policy());
    let (_dir, state) = app(config).await;
    let app = router(state.with_admin_token("admin-token"));

    let deposit = Request::builder()
        .method("POST")
        .uri("/admin/accounts/u-1/deposit")
        .header("x-admin-token", "admin-token")
        .header("content-type", "application/json")
        .body(Body::from(json!({"amount": 250}).to_string()))
        .expect("request");
    let response = app.clone().oneshot(deposit).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let lookup = Request::builder()
        .method("GET")
        .uri("/admin/accounts/u-1")
        .header("x-admin-token", "admin-token")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(lookup).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let account: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(account["balance"], 250);
}

#[tokio::test]
async fn metrics_reports_request_counters() {
    let config = base_config(http_version("http://unused.example/items/{id}"), bare_policy());
    let (_dir, state) = app(config).await;
    let app = router(state);

    let unknown = Request::builder()
        .method("POST")
        .uri("/no-such-key/1")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .expect("request");
    app.clone().oneshot(unknown).await.expect("response");

    let metrics = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(metrics).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let snapshot: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert!(snapshot["requests"].as_u64().expect("requests") >= 1);
}

#[tokio::test]
async fn non_numeric_version_segment_is_a_bad_request() {
    let config = base_config(http_version("http://unused.example/items/{id}"), bare_policy());
    let (_dir, state) = app(config).await;

    let request = Request::builder()
        .method("POST")
        .uri("/pk-1/latest")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .expect("request");
    let response = router(state).oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
