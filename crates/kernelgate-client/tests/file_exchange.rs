//! File-exchange client against a wiremock file server.

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kernelgate_client::{FileExchange, FileExchangeConfig, FileOp, FileOpOutput, GatewayError};

fn files(server: &MockServer, token: Option<&str>) -> FileExchange {
    let mut config = FileExchangeConfig::new(server.uri());
    if let Some(token) = token {
        config = config.with_token(token);
    }
    FileExchange::new(config).unwrap()
}

#[tokio::test]
async fn test_list_and_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["a.csv", "b.txt"])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/read/a.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x,y\n1,2\n".to_vec()))
        .mount(&server)
        .await;

    let files = files(&server, None);
    assert_eq!(files.list().await.unwrap(), ["a.csv", "b.txt"]);
    assert_eq!(files.read("a.csv").await.unwrap(), b"x,y\n1,2\n");
}

#[tokio::test]
async fn test_missing_file_reports_detail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/read/nope.txt"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "File not found"})))
        .mount(&server)
        .await;

    let err = files(&server, None).read("nope.txt").await.unwrap_err();
    match err {
        GatewayError::FileExchange { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "File not found");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_upload_sends_token_both_ways() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(header("token", "w-123"))
        .and(header("authorization", "Bearer w-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"filename": "out.txt"})))
        .expect(1)
        .mount(&server)
        .await;

    files(&server, Some("w-123"))
        .upload("out.txt", b"hello".to_vec())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rejected_token_is_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/delete/out.txt"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"detail": "Invalid token"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let files = files(&server, Some("wrong"));
    let err = files.delete("out.txt").await.unwrap_err();
    assert!(matches!(err, GatewayError::AuthFailure(ref m) if m == "Invalid token"), "{err}");
    assert!(!files.validate_token().await);
}

#[tokio::test]
async fn test_append_to_missing_file_creates_it() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/read/log.txt"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "File not found"})))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/overwrite/log.txt"))
        .and(header("token", "w"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let output = files(&server, Some("w"))
        .execute_file_op(FileOp::Append, "log.txt", Some(b"line\n"))
        .await
        .unwrap();
    assert_eq!(output, FileOpOutput::Done);
}

#[tokio::test]
async fn test_download_and_upload_local_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/read/report.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"done".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let files = files(&server, Some("w"));

    let dest = dir.path().join("copy.txt");
    let written = files.download_file("report.txt", Some(&dest)).await.unwrap();
    assert_eq!(written, dest);
    assert_eq!(std::fs::read(&dest).unwrap(), b"done");

    let stored = files.upload_file(&dest, None).await.unwrap();
    assert_eq!(stored, "copy.txt");
}

#[tokio::test]
async fn test_path_names_never_reach_the_server() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let files = files(&server, Some("w"));
    for name in ["../etc/passwd", "a/b", "a\\b", ""] {
        assert!(matches!(files.read(name).await, Err(GatewayError::InvalidRequest(_))), "{name}");
    }
}
