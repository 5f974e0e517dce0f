#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use feedbrief::llm::{LlmError, LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use feedbrief::retry::RetryPolicy;
use feedbrief::scraping::{Article, ArticleExtractor, ImageFetcher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Short policy for tests: `max_retries` retries, 5ms backoff.
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(5),
        backoff_factor: 2.0,
        max_backoff: Duration::from_millis(20),
        max_total_timeout: Duration::from_secs(10),
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay: Duration,
}

impl ScriptedResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Hold the response back for `delay` after the request arrives.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Minimal HTTP/1.1 server answering requests with a fixed sequence of
/// responses (the last one repeats) and recording when each request arrived.
pub struct ScriptedServer {
    addr: SocketAddr,
    arrivals: Arc<Mutex<Vec<Instant>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start(script: Vec<ScriptedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let recorded = arrivals.clone();

        let handle = tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                if read_request_head(&mut socket).await.is_none() {
                    continue;
                }
                recorded.lock().unwrap().push(Instant::now());

                let response = script
                    .get(served)
                    .or_else(|| script.last())
                    .cloned()
                    .unwrap_or_else(|| ScriptedResponse::new(500, "script is empty"));
                served += 1;

                // Stalled responses must not hold up the next connection.
                tokio::spawn(async move {
                    tokio::time::sleep(response.delay).await;
                    let mut head = format!(
                        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                        response.status,
                        reason(response.status),
                        response.body.len()
                    );
                    for (name, value) in &response.headers {
                        head.push_str(&format!("{}: {}\r\n", name, value));
                    }
                    head.push_str("\r\n");
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(response.body.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, arrivals, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn request_count(&self) -> usize {
        self.arrivals.lock().unwrap().len()
    }

    pub fn arrivals(&self) -> Vec<Instant> {
        self.arrivals.lock().unwrap().clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> Option<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

type Responder = dyn Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync;

/// In-process LLM that answers through a closure and keeps every request.
pub struct FakeLlm {
    respond: Box<Responder>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl FakeLlm {
    pub fn new(respond: impl Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose user prompt mentions `needle`
    pub fn calls_mentioning(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_prompts.iter().any(|p| p.contains(needle)))
            .count()
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let result = (self.respond)(&request);
        self.requests.lock().unwrap().push(request);
        result.map(|content| LlmResponse {
            content,
            usage: UsageMetadata::default(),
            model: "fake-model".to_string(),
        })
    }

    fn default_model(&self) -> &str {
        "fake-model"
    }
}

pub fn is_summary_request(request: &LlmRequest) -> bool {
    request.system_prompt.contains("decide whether it is relevant")
}

pub fn is_digest_request(request: &LlmRequest) -> bool {
    request.system_prompt.contains("Write a digest")
}

pub fn summary_json(summary: &str, relevant: bool) -> String {
    serde_json::json!({
        "summary": summary,
        "comment_summary": "",
        "is_relevant": relevant,
        "relevance_reason": "matches focus areas"
    })
    .to_string()
}

pub struct FakeImageFetcher {
    pub fail: bool,
}

#[async_trait]
impl ImageFetcher for FakeImageFetcher {
    async fn fetch_as_base64(&self, _cancel: &CancellationToken, url: &str) -> Result<String> {
        if self.fail {
            anyhow::bail!("image host unreachable: {}", url);
        }
        Ok("data:image/png;base64,iVBORw0KGgo=".to_string())
    }
}

pub struct FakeExtractor;

impl ArticleExtractor for FakeExtractor {
    fn extract(&self, body: &[u8], _source_url: &Url) -> Result<Article> {
        Ok(Article {
            title: "Linked page".to_string(),
            text: String::from_utf8_lossy(body).to_string(),
        })
    }
}
