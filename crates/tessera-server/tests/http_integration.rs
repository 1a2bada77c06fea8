use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use serde_json::{Value, json};
use tessera_server::config::AppConfig;
use tessera_server::development::Development;
use tessera_server::metrics::Metrics;
use tessera_server::middleware::auth::AuthState;
use tessera_server::rest::{AppState, create_router};
use tessera_server::service::AuthzService;
use tessera_storage::InMemoryStoreFactory;

fn make_server(config: &AppConfig) -> TestServer {
    let metrics = Arc::new(Metrics::new());
    let service = Arc::new(
        AuthzService::new(
            Arc::new(InMemoryStoreFactory::new()),
            config.to_engine_config(),
            config.to_schema_limits(),
        )
        .with_check_timeout(config.check_timeout())
        .with_metrics(Arc::clone(&metrics)),
    );
    let development = Arc::new(Development::new(
        config.to_engine_config(),
        config.to_schema_limits(),
        config.check_timeout(),
    ));
    let auth = if config.authn.enabled {
        AuthState::with_keys(config.authn.keys.clone(), config.default_tenant())
    } else {
        AuthState::disabled(config.default_tenant())
    };
    let state = AppState {
        service,
        metrics,
        development,
    };
    TestServer::new(create_router(state, auth, config.rest.max_body_bytes)).unwrap()
}

fn default_server() -> TestServer {
    make_server(&AppConfig::default())
}

const DOC_SCHEMA: &str = r#"
entity user {}

entity doc {
    relation owner @user
    permission edit = owner
}
"#;

const DOC_SCHEMA_WITH_VIEW: &str = r#"
entity user {}

entity doc {
    relation owner @user
    permission edit = owner
    permission view = edit or owner
}
"#;

async fn write_schema(server: &TestServer, schema: &str) {
    server
        .post("/v1/schemas/write")
        .json(&json!({"schema": schema, "force": true}))
        .await
        .assert_status_ok();
}

async fn write_owner(server: &TestServer) {
    server
        .post("/v1/relationships/write")
        .json(&json!({"tuples": ["doc:1#owner@user:1"]}))
        .await
        .assert_status_ok();
}

async fn check(server: &TestServer, entity: &str, permission: &str, subject: &str) -> bool {
    let response = server
        .post("/v1/permissions/check")
        .json(&json!({"entity": entity, "permission": permission, "subject": subject}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    body["allowed"].as_bool().unwrap()
}

// --- Scenarios ---

#[tokio::test]
async fn owner_can_edit_and_others_cannot() {
    let server = default_server();
    write_schema(&server, DOC_SCHEMA).await;
    server
        .post("/v1/relationships/write")
        .json(&json!({"tuples": ["doc:1#owner@user:1"]}))
        .await
        .assert_status_ok();

    assert!(check(&server, "doc:1", "edit", "user:1").await);
    assert!(!check(&server, "doc:1", "edit", "user:2").await);
}

#[tokio::test]
async fn removing_and_re_adding_owner_restores_view() {
    let server = default_server();
    write_schema(&server, DOC_SCHEMA_WITH_VIEW).await;
    write_owner(&server).await;
    assert!(check(&server, "doc:1", "view", "user:1").await);

    server
        .post("/v1/relationships/delete")
        .json(&json!({"tuples": ["doc:1#owner@user:1"]}))
        .await
        .assert_status_ok();
    assert!(!check(&server, "doc:1", "view", "user:1").await);

    write_owner(&server).await;
    assert!(check(&server, "doc:1", "view", "user:1").await);
}

#[tokio::test]
async fn undefined_reference_error_names_it_with_position() {
    let server = default_server();

    let response = server
        .post("/v1/schemas/write")
        .json(&json!({"schema": "entity user {}\nentity doc {\n    permission edit = nonexistent\n}"}))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("nonexistent"), "got: {message}");
    assert!(message.starts_with("3:"), "got: {message}");
}

#[tokio::test]
async fn lookup_entity_agrees_with_check() {
    let server = default_server();
    write_schema(&server, DOC_SCHEMA).await;
    server
        .post("/v1/relationships/write")
        .json(&json!({"tuples": [
            "doc:1#owner@user:1",
            "doc:2#owner@user:2",
            "doc:3#owner@user:1",
        ]}))
        .await
        .assert_status_ok();

    let response = server
        .post("/v1/permissions/lookup-entity")
        .json(&json!({"entity_type": "doc", "permission": "edit", "subject": "user:1"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    let ids: Vec<String> = serde_json::from_value(body["entity_ids"].clone()).unwrap();

    assert_eq!(ids, vec!["1".to_string(), "3".to_string()]);
    for id in ["1", "2", "3"] {
        let allowed = check(&server, &format!("doc:{id}"), "edit", "user:1").await;
        assert_eq!(allowed, ids.iter().any(|i| i == id), "doc:{id}");
    }
}

#[tokio::test]
async fn snapshot_from_write_pins_later_reads() {
    let server = default_server();
    write_schema(&server, DOC_SCHEMA).await;

    let response = server
        .post("/v1/relationships/write")
        .json(&json!({"tuples": ["doc:1#owner@user:1"]}))
        .await;
    let snapshot = response.json::<Value>()["snapshot"].clone();
    server
        .post("/v1/relationships/delete")
        .json(&json!({"tuples": ["doc:1#owner@user:1"]}))
        .await
        .assert_status_ok();

    let response = server
        .post("/v1/permissions/check")
        .json(&json!({
            "entity": "doc:1",
            "permission": "edit",
            "subject": "user:1",
            "snapshot": snapshot,
        }))
        .await;
    let body: Value = response.json();
    assert_eq!(body["allowed"], true);
    assert!(!check(&server, "doc:1", "edit", "user:1").await);
}

// --- Batch run ---

#[tokio::test]
async fn run_reports_every_independent_failure() {
    let server = default_server();

    let response = server
        .post("/v1/run")
        .json(&json!({
            "schema": DOC_SCHEMA_WITH_VIEW,
            "relationships": ["doc:1#owner@user:1", "doc:1#reader@user:2"],
            "attributes": ["doc:1$public|boolean:true"],
            "scenarios": [
                {
                    "name": "owner",
                    "checks": [{"entity": "doc:1", "subject": "user:1", "assertions": {"edit": true, "view": true}}],
                    "entity_filters": [{"entity_type": "doc", "subject": "user:1", "assertions": {"edit": ["1"]}}],
                },
                {
                    "name": "stranger",
                    "checks": [{"entity": "doc:1", "subject": "user:2", "assertions": {"view": true}}],
                },
            ],
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    let errors = body["errors"].as_array().unwrap();
    let kinds: Vec<&str> = errors.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["relationships", "attributes", "scenarios"]);
    assert_eq!(errors[0]["key"], "doc:1#reader@user:2");
    assert_eq!(errors[2]["key"], 1);
    assert_eq!(
        errors[2]["message"],
        "Query: user:2 view doc:1, Expected: true, Actual: false"
    );
}

// --- Configuration driven surfaces ---

#[tokio::test]
async fn preshared_keys_from_config_file_guard_the_api() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tessera.toml");
    std::fs::write(
        &path,
        r#"
[authn]
enabled = true
keys = ["integration-key"]
"#,
    )
    .unwrap();
    let config = AppConfig::load(Some(path.as_path())).unwrap();
    let server = make_server(&config);

    server
        .post("/v1/schemas/read")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server.get("/healthz").await.assert_status_ok();

    let response = server
        .post("/v1/schemas/write")
        .add_header(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer integration-key"),
        )
        .json(&json!({"schema": DOC_SCHEMA}))
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn metrics_endpoint_counts_checks() {
    let server = default_server();
    write_schema(&server, DOC_SCHEMA).await;
    check(&server, "doc:1", "edit", "user:1").await;

    let response = server.get("/metrics").await;

    response.assert_status_ok();
    let text = response.text();
    assert!(text.contains("tessera_checks_total 1"), "got: {text}");
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let config = AppConfig {
        rest: tessera_server::config::RestConfig {
            max_body_bytes: 64,
            ..Default::default()
        },
        ..Default::default()
    };
    let server = make_server(&config);

    let response = server
        .post("/v1/schemas/write")
        .json(&json!({"schema": "x".repeat(1024)}))
        .await;

    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
}
