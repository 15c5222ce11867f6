//! The chat client against a scripted local HTTP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lumen_core::{LlmConfig, LumenError, RetryPolicy};
use lumen_query::llm::{LanguageModel, LlmClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Serves `replies` in order (the last one repeats) and counts requests.
async fn serve(replies: Vec<(u16, &'static str, String)>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (status, content_type, body) = replies[n.min(replies.len() - 1)].clone();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), hits)
}

async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }
}

fn client(base_url: String, max_attempts: u32) -> LlmClient {
    let config = LlmConfig {
        api_key: Some("test-key".into()),
        base_url: Some(base_url),
        ..LlmConfig::default()
    };
    let retry = RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    LlmClient::new(&config, retry).unwrap()
}

const JSON: &str = "application/json";
const SSE: &str = "text/event-stream";

fn sse_body(parts: &[&str]) -> String {
    let mut body = String::new();
    for part in parts {
        let event = serde_json::json!({"choices": [{"index": 0, "delta": {"content": part}}]});
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn completion_returns_message_content() {
    let body = r#"{"choices":[{"message":{"role":"assistant","content":"It hashes the token."}}]}"#;
    let (url, hits) = serve(vec![(200, JSON, body.into())]).await;
    let answer = client(url, 3).complete("what does auth do?").await.unwrap();
    assert_eq!(answer, "It hashes the token.");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_key_fails_on_first_call() {
    let (url, hits) = serve(vec![(401, JSON, r#"{"error":{"message":"bad key"}}"#.into())]).await;
    let err = client(url, 4).complete("q").await.unwrap_err();
    assert!(matches!(err, LumenError::Auth { .. }), "got {err:?}");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn throttled_completion_is_retried() {
    let ok = r#"{"choices":[{"message":{"content":"done"}}]}"#;
    let (url, hits) = serve(vec![(429, JSON, "slow".into()), (200, JSON, ok.into())]).await;
    assert_eq!(client(url, 3).complete("q").await.unwrap(), "done");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_choices_is_invalid_response() {
    let (url, _) = serve(vec![(200, JSON, r#"{"choices":[]}"#.into())]).await;
    let err = client(url, 1).complete("q").await.unwrap_err();
    assert!(matches!(err, LumenError::InvalidResponse(_)));
}

#[tokio::test]
async fn stream_yields_fragments_in_order() {
    let body = sse_body(&["The cache ", "evicts ", "by age."]);
    let (url, hits) = serve(vec![(200, SSE, body)]).await;
    let fragments: Vec<String> = client(url, 1)
        .stream("q")
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(fragments, vec!["The cache ", "evicts ", "by age."]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_open_is_retried_on_unavailable() {
    let (url, hits) = serve(vec![(503, JSON, "busy".into()), (200, SSE, sse_body(&["ok"]))]).await;
    let fragments: Vec<_> = client(url, 2).stream("q").await.unwrap().collect().await;
    assert_eq!(fragments.len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_quota_fails_stream_open() {
    let body = r#"{"error":{"code":"insufficient_quota"}}"#;
    let (url, hits) = serve(vec![(429, JSON, body.into())]).await;
    let err = client(url, 3).stream("q").await.err().unwrap();
    assert!(matches!(err, LumenError::QuotaExceeded { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
