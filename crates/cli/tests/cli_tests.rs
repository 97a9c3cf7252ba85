//! Client tests against a mocked agent API

use cricctl::client::ApiClient;
use mockito::Matcher;

#[tokio::test]
async fn test_list_pods_sends_summary_query() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/meta/local/list")
        .match_query(Matcher::UrlEncoded("type".into(), "summary".into()))
        .with_header("content-type", "application/json")
        .with_body(
            r#"[{"namespace":"default","name":"web-1","uid":"U1","ip":"10.0.0.5","phase":"Running","app":"web",
                "containers":[{"id":"abc123","name":"web","role":"biz","running":true,"hacked":false}]}]"#,
        )
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let pods = client.list_pods().await.unwrap();

    mock.assert_async().await;
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].ip, "10.0.0.5");
    assert_eq!(pods[0].containers[0].role, "biz");
}

#[tokio::test]
async fn test_get_pod_keeps_unrendered_fields() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/meta/local/get")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("ns".into(), "default".into()),
            Matcher::UrlEncoded("pod".into(), "web-1".into()),
        ]))
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"uid":"U1","namespace":"default","name":"web-1","pod":{"metadata":{}},
                "all":[{"id":"abc123","shortId":"abc123","name":"web","namespace":"default","podName":"web-1",
                        "state":{"pid":42,"startedAt":"","status":"running"},"role":"biz","hacked":true,"logPath":"/x"}]}"#,
        )
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let pod = client.get_pod("default", "web-1").await.unwrap();

    assert_eq!(pod.all[0].state.pid, 42);
    assert!(pod.all[0].hacked);
    assert!(pod.rest.contains_key("pod"));
    assert_eq!(pod.all[0].rest["logPath"], "/x");
}

#[tokio::test]
async fn test_not_found_surfaces_api_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/meta/local/getByCid")
        .match_query(Matcher::UrlEncoded("cid".into(), "nope".into()))
        .with_status(404)
        .with_body(r#"{"error":"not found: container nope"}"#)
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let err = client.get_container("nope").await.unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains("404"), "{msg}");
    assert!(msg.contains("container nope"), "{msg}");
}

#[tokio::test]
async fn test_portforward_returns_text() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/cri/netproxy/portforward")
        .match_query(Matcher::UrlEncoded("addr".into(), "10.0.0.5:8080".into()))
        .with_body("Listen on 127.0.0.1:40000\nForwarding to 10.0.0.5:8080 for 600s, until 2026-01-01T00:00:00+00:00\n")
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let text = client.portforward("10.0.0.5:8080").await.unwrap();

    assert!(text.starts_with("Listen on 127.0.0.1:40000"));
}

#[tokio::test]
async fn test_health_accepts_unhealthy_status_code() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/healthz")
        .with_status(503)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"status":"unhealthy","components":{"meta_store":{"status":"unhealthy","message":"Reconcile failing","last_check_timestamp":1}}}"#,
        )
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let health = client.health().await.unwrap();

    assert_eq!(health.status, "unhealthy");
    assert_eq!(
        health.components["meta_store"].message.as_deref(),
        Some("Reconcile failing")
    );
}
