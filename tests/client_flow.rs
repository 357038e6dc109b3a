//! Integration tests for `FalconClient`: token acquisition, the one-shot
//! 401 retry, envelope decoding and binary downloads.

use falcon_rtr::auth::TokenProvider;
use falcon_rtr::client::{Download, FalconClient};
use falcon_rtr::error::FalconError;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LIST_FILES: &str = "/real-time-response/entities/file/v1";

fn token_body(token: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": 1799
    })
}

#[tokio::test]
async fn first_request_fetches_token_with_client_credentials() {
    let server = MockServer::start().await;
    let base = format!("{}/", server.uri());

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("client_id=my-client"))
        .and(body_string_contains("client_secret=my-secret"))
        .respond_with(ResponseTemplate::new(201).set_body_json(token_body("tok-1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LIST_FILES))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"resources": []})))
        .expect(2)
        .mount(&server)
        .await;

    let client = FalconClient::with_base_url(TokenProvider::new(&base, "my-client", "my-secret"), &base).unwrap();
    for _ in 0..2 {
        let resp = client
            .get::<Vec<serde_json::Value>>("real-time-response/entities/file/v1", &[("session_id", "s-1")])
            .await
            .unwrap();
        assert!(resp.is_success());
    }
}

#[tokio::test]
async fn unauthorized_response_refreshes_token_and_retries_once() {
    let server = MockServer::start().await;
    let base = format!("{}/", server.uri());

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(token_body("tok-1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(token_body("tok-2")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LIST_FILES))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "errors": [{"code": 401, "message": "access denied, invalid bearer token"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LIST_FILES))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resources": [{"cloud_request_id": "c-1", "sha256": "abc"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = FalconClient::with_base_url(TokenProvider::new(&base, "id", "secret"), &base).unwrap();
    let resp = client
        .get::<Vec<serde_json::Value>>("real-time-response/entities/file/v1", &[])
        .await
        .unwrap();
    assert!(resp.is_success());
    assert_eq!(resp.body.resources.len(), 1);
}

#[tokio::test]
async fn rejected_credentials_are_an_auth_error() {
    let server = MockServer::start().await;
    let base = format!("{}/", server.uri());
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(403).set_body_string("access denied, invalid client"))
        .mount(&server)
        .await;

    let client = FalconClient::with_base_url(TokenProvider::new(&base, "id", "wrong"), &base).unwrap();
    let err = client
        .get::<Vec<serde_json::Value>>("real-time-response/entities/file/v1", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, FalconError::Auth { .. }), "got {err:?}");
    assert!(err.to_string().contains("invalid client"));
}

#[tokio::test]
async fn non_success_envelope_is_returned_as_value() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LIST_FILES))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "meta": {"trace_id": "trace-1"},
            "resources": null,
            "errors": [{"code": 404, "message": "session not found"}]
        })))
        .mount(&server)
        .await;

    let client = FalconClient::with_base_url(TokenProvider::with_token("t"), &format!("{}/", server.uri())).unwrap();
    let resp = client
        .get::<Vec<serde_json::Value>>("real-time-response/entities/file/v1", &[])
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 404);
    assert!(resp.body.resources.is_empty());
    assert_eq!(resp.body.meta.trace_id.as_deref(), Some("trace-1"));
    assert_eq!(resp.error_summary(), "HTTP 404 Not Found: [404] session not found");
}

#[tokio::test]
async fn non_envelope_error_body_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LIST_FILES))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let client = FalconClient::with_base_url(TokenProvider::with_token("t"), &format!("{}/", server.uri())).unwrap();
    let err = client
        .get::<Vec<serde_json::Value>>("real-time-response/entities/file/v1", &[])
        .await
        .unwrap_err();
    match err {
        FalconError::Api { status, body } => {
            assert_eq!(status.as_u16(), 503);
            assert_eq!(body, "upstream unavailable");
        }
        other => panic!("expected Api, got {other:?}"),
    }
}

#[tokio::test]
async fn download_distinguishes_bytes_from_error_objects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bytes"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04payload".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/error"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errors": [{"code": 40401, "message": "file not ready"}]
        })))
        .mount(&server)
        .await;

    let client = FalconClient::with_base_url(TokenProvider::with_token("t"), &format!("{}/", server.uri())).unwrap();

    match client.download("bytes", &[]).await.unwrap() {
        Download::Content(bytes) => assert_eq!(bytes.as_ref(), b"PK\x03\x04payload"),
        other => panic!("expected content, got {other:?}"),
    }
    match client.download("error", &[]).await.unwrap() {
        Download::Rejected { status, detail } => {
            assert_eq!(status.as_u16(), 200);
            assert_eq!(detail, "[40401] file not ready");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn close_revokes_token_and_next_request_reauthenticates() {
    let server = MockServer::start().await;
    let base = format!("{}/", server.uri());
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(token_body("tok-1")))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/revoke"))
        .and(body_string_contains("token=tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"resources": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LIST_FILES))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"resources": []})))
        .mount(&server)
        .await;

    let client = FalconClient::with_base_url(TokenProvider::new(&base, "id", "secret"), &base).unwrap();
    client
        .get::<Vec<serde_json::Value>>("real-time-response/entities/file/v1", &[])
        .await
        .unwrap();
    client.close().await;
    client.close().await;
    client
        .get::<Vec<serde_json::Value>>("real-time-response/entities/file/v1", &[])
        .await
        .unwrap();
}
