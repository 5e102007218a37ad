//! OAuth2 auth resolution tests against a wiremock token endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loadstorm::auth::{AuthConfig, AuthProvider};
use loadstorm::errors::AuthError;
use loadstorm::executor::TestExecutor;
use loadstorm::run::RunStatus;
use loadstorm::spec::TestSpec;
use loadstorm::templating::TemplateEngine;

fn provider() -> AuthProvider {
    provider_with(HashMap::new())
}

fn provider_with(vars: HashMap<String, String>) -> AuthProvider {
    AuthProvider::new(Arc::new(TemplateEngine::new(vars)), reqwest::Client::new())
}

fn spec(value: serde_json::Value) -> TestSpec {
    serde_json::from_value(value).expect("valid test spec")
}

#[tokio::test]
async fn client_credentials_flow_posts_form_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("Content-Type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=cid"))
        .and(body_string_contains("client_secret=shhh"))
        .and(body_string_contains("scope=read+write"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-abc",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider();
    let config = AuthConfig::Oauth2ClientCredentials {
        token_url: format!("{}/token", server.uri()),
        client_id: "cid".into(),
        client_secret: "shhh".into(),
        scope: Some("read write".into()),
    };

    let headers = provider.headers(&config).await.unwrap();
    assert_eq!(headers["Authorization"], "Bearer tok-abc");
}

#[tokio::test]
async fn token_is_cached_across_resolutions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "cached-tok",
            "expires_in": 3600
        })))
        .expect(1) // second resolution must hit the cache
        .mount(&server)
        .await;

    let provider = provider();
    let config = AuthConfig::Oauth2ClientCredentials {
        token_url: format!("{}/token", server.uri()),
        client_id: "cid".into(),
        client_secret: "shhh".into(),
        scope: None,
    };

    let first = provider.headers(&config).await.unwrap();
    let second = provider.headers(&config).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn password_grant_sends_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("username=alice"))
        .and(body_string_contains("password=pw-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "pw-tok"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_with(HashMap::from([(
        "password".to_string(),
        "pw-123".to_string(),
    )]));
    let config = AuthConfig::Oauth2PasswordGrant {
        token_url: format!("{}/token", server.uri()),
        client_id: "cid".into(),
        username: "alice".into(),
        password: "{{password}}".into(),
        scope: None,
    };

    let headers = provider.headers(&config).await.unwrap();
    assert_eq!(headers["Authorization"], "Bearer pw-tok");
}

#[tokio::test]
async fn missing_expires_in_defaults_and_still_caches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "no-expiry-tok"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider();
    let config = AuthConfig::Oauth2ClientCredentials {
        token_url: format!("{}/token", server.uri()),
        client_id: "cid".into(),
        client_secret: "s".into(),
        scope: None,
    };

    provider.headers(&config).await.unwrap();
    let cached = provider.headers(&config).await.unwrap();
    assert_eq!(cached["Authorization"], "Bearer no-expiry-tok");
}

#[tokio::test]
async fn non_success_token_response_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let provider = provider();
    let config = AuthConfig::Oauth2ClientCredentials {
        token_url: format!("{}/token", server.uri()),
        client_id: "cid".into(),
        client_secret: "bad".into(),
        scope: None,
    };

    let result = provider.headers(&config).await;
    assert!(matches!(
        result,
        Err(AuthError::TokenEndpointStatus { status: 401 })
    ));
}

#[tokio::test]
async fn missing_access_token_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;

    let provider = provider();
    let config = AuthConfig::Oauth2ClientCredentials {
        token_url: format!("{}/token", server.uri()),
        client_id: "cid".into(),
        client_secret: "s".into(),
        scope: None,
    };

    let result = provider.headers(&config).await;
    assert!(matches!(result, Err(AuthError::MissingAccessToken)));
}

#[tokio::test]
async fn engine_attaches_oauth2_bearer_to_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "run-tok",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .and(header("Authorization", "Bearer run-tok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(5)
        .mount(&server)
        .await;

    let executor = TestExecutor::new();
    let result = executor
        .run(spec(serde_json::json!({
            "name": "T",
            "url": format!("{}/api", server.uri()),
            "auth": {
                "type": "oauth2_client_credentials",
                "token_url": format!("{}/token", server.uri()),
                "client_id": "cid",
                "client_secret": "s"
            },
            "total_requests": 5,
            "concurrency": 2,
            "expected_status_codes": [200]
        })))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.passed, Some(true));
}

#[tokio::test]
async fn auth_failure_fails_the_run_before_dispatch() {
    let token_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&token_server)
        .await;

    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0) // no requests may be dispatched
        .mount(&target)
        .await;

    let executor = TestExecutor::new();
    let result = executor
        .run(spec(serde_json::json!({
            "name": "T",
            "url": format!("{}/api", target.uri()),
            "auth": {
                "type": "oauth2_client_credentials",
                "token_url": format!("{}/token", token_server.uri()),
                "client_id": "cid",
                "client_secret": "s"
            },
            "total_requests": 5,
            "concurrency": 2,
            "expected_status_codes": [200]
        })))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.passed, Some(false));
    assert!(result.error_message.as_deref().unwrap().contains("auth"));
    assert_eq!(result.requests_completed, 0);
}
