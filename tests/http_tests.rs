//! HTTP 接口集成测试

#[cfg(feature = "server")]
mod tests {
    use std::fs;
    use std::time::Duration;

    use agent_workspace_sync::{content_hash, WorkspaceConfig, WorkspaceServer};
    use axum::body::{to_bytes, Body, BodyDataStream};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use futures_util::StreamExt;
    use tempfile::{tempdir, TempDir};
    use tokio::time::timeout;
    use tower::ServiceExt;

    /// 创建测试服务：`<tmp>/demo/NOTES.md = "hello"`
    fn test_server() -> (TempDir, WorkspaceServer) {
        let base = tempdir().unwrap();
        fs::create_dir(base.path().join("demo")).unwrap();
        fs::write(base.path().join("demo/NOTES.md"), "hello").unwrap();

        let config = WorkspaceConfig {
            agents: Vec::new(),
            ..WorkspaceConfig::with_base_dir(base.path())
        };
        (base, WorkspaceServer::new(config).unwrap())
    }

    async fn get(server: &WorkspaceServer, uri: &str) -> Response {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        server.router().oneshot(request).await.unwrap()
    }

    async fn post_json(server: &WorkspaceServer, uri: &str, json: serde_json::Value) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap();
        server.router().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// 从 SSE 响应体中读取直到出现 `needle`
    async fn read_until(body: &mut BodyDataStream, needle: &str) -> String {
        let mut buffer = String::new();
        while !buffer.contains(needle) {
            let chunk = timeout(Duration::from_secs(5), body.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
        buffer
    }

    #[tokio::test]
    async fn test_list_files() {
        let (_base, server) = test_server();

        let response = get(&server, "/api/workspace/demo/files").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["agentId"], "demo");
        assert_eq!(json["files"][0]["path"], "NOTES.md");
        assert_eq!(json["files"][0]["size"], 5);
        assert_eq!(json["files"][0]["content_hash"], content_hash("hello"));
    }

    #[tokio::test]
    async fn test_read_file() {
        let (_base, server) = test_server();

        let response = get(&server, "/api/workspace/demo/files?path=NOTES.md").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["content"], "hello");
        assert_eq!(json["content_hash"], content_hash("hello"));
        assert!(json["last_modified"].is_string());
    }

    #[tokio::test]
    async fn test_read_errors() {
        let (base, server) = test_server();
        fs::write(base.path().join("secret.md"), "secret").unwrap();

        let response = get(&server, "/api/workspace/demo/files?path=missing.md").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = get(&server, "/api/workspace/demo/files?path=..%2Fsecret.md").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert!(!json["error"].as_str().unwrap().contains("secret"));

        let response = get(&server, "/api/workspace/.git/files").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get(&server, "/api/workspace/nobody/files").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_write_accepted_and_conflict() {
        let (base, server) = test_server();
        let h1 = content_hash("hello");

        let response = post_json(
            &server,
            "/api/workspace/demo/files",
            serde_json::json!({"file_path": "NOTES.md", "content": "hello!", "expected_hash": h1}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["content_hash"], content_hash("hello!"));

        // 再用旧指纹提交
        let response = post_json(
            &server,
            "/api/workspace/demo/files",
            serde_json::json!({"file_path": "NOTES.md", "content": "mine", "expected_hash": h1}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let json = json_body(response).await;
        assert_eq!(json["your_content"], "mine");
        assert_eq!(json["current_content"], "hello!");
        assert_eq!(json["current_hash"], content_hash("hello!"));
        assert_eq!(fs::read_to_string(base.path().join("demo/NOTES.md")).unwrap(), "hello!");
    }

    #[tokio::test]
    async fn test_write_rejected_path() {
        let (base, server) = test_server();

        let response = post_json(
            &server,
            "/api/workspace/demo/files",
            serde_json::json!({"file_path": "../escape.md", "content": "x", "expected_hash": ""}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!base.path().join("escape.md").exists());
    }

    #[tokio::test]
    async fn test_event_stream_pushes_changes() {
        let (base, server) = test_server();

        let response = get(&server, "/api/workspace/demo/events").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let connected = read_until(&mut body, "\n\n").await;
        assert!(connected.contains("\"type\":\"connected\""));
        assert!(connected.contains("\"agentId\":\"demo\""));

        assert!(server.watchers().is_watching("demo"));
        assert_eq!(server.bus().subscriber_count("demo"), 1);

        fs::write(base.path().join("demo/NOTES.md"), "hello world").unwrap();
        let frame = read_until(&mut body, &content_hash("hello world")).await;
        assert!(frame.contains("\"file_path\":\"NOTES.md\""));
        assert!(frame.contains("\"event_type\":\"change\""));

        // 服务关闭时会话结束，响应体随之结束
        server.shutdown_token().cancel();
        let rest = timeout(Duration::from_secs(5), async {
            while let Some(chunk) = body.next().await {
                chunk.unwrap();
            }
        })
        .await;
        assert!(rest.is_ok());
        assert_eq!(server.bus().subscriber_count("demo"), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_subscription() {
        let (_base, server) = test_server();

        let response = get(&server, "/api/workspace/demo/events").await;
        let mut body = response.into_body().into_data_stream();
        read_until(&mut body, "\n\n").await;
        assert_eq!(server.bus().subscriber_count("demo"), 1);

        // 客户端断开：响应体被丢弃，没有任何后续写入
        drop(body);
        let released = timeout(Duration::from_secs(2), async {
            while server.bus().subscriber_count("demo") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok());

        let json = json_body(get(&server, "/api/status").await).await;
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn test_event_stream_missing_workspace() {
        let (_base, server) = test_server();

        let response = get(&server, "/api/workspace/nobody/events").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!server.watchers().is_watching("nobody"));
    }

    #[tokio::test]
    async fn test_status() {
        let (_base, server) = test_server();

        let _stream = get(&server, "/api/workspace/demo/events").await;
        let json = json_body(get(&server, "/api/status").await).await;

        assert_eq!(json["watching"], serde_json::json!(["demo"]));
        assert_eq!(json["subscribers"]["demo"], 1);
        assert_eq!(json["connections"], 1);
        assert!(json["version"].is_string());
    }
}
