use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::message::WireMessage;
use crate::stream::data_chunks;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")] pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")] pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")] pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChatResponse {
    /// Server-reported token count, when present.
    pub fn tokens(&self) -> Option<u64> {
        self.metadata.get("tokens").and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatus {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

/// One stored memory as served by `/memory/timeline`, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProvidersEnvelope { providers: BTreeMap<String, ProviderStatus> }

#[derive(Debug, Deserialize)]
struct ModelsEnvelope { models: Vec<ModelInfo> }

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("No response body")]
    MissingBody,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Http(e) => e.status().map(|s| s.as_u16()),
            TransportError::MissingBody => None,
        }
    }
}

/// Everything the conversation store needs from the chat API.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, req: &ChatRequest) -> Result<ChatResponse, TransportError>;

    /// Streams the reply, handing each chunk to `on_chunk` in arrival order.
    /// Returns once the server sends `[DONE]` or closes the body.
    async fn send_message_stream(
        &self,
        req: &ChatRequest,
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), TransportError>;

    async fn get_providers(&self) -> Result<BTreeMap<String, ProviderStatus>, TransportError>;
    async fn get_models(&self) -> Result<Vec<ModelInfo>, TransportError>;
    async fn health_check(&self) -> Result<HealthStatus, TransportError>;
    async fn get_timeline(&self) -> Result<Vec<MemoryEntry>, TransportError>;
}

#[derive(Clone)]
pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: String,
    health_url: String,
}

impl HttpChatClient {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().connect_timeout(config.connect_timeout).build()?;
        Ok(Self { http, base_url: config.chat_base()?, health_url: config.health_base()? })
    }

    fn chat_url(&self) -> String { format!("{}/chat/", self.base_url) }

    async fn post_chat(&self, req: &ChatRequest) -> Result<reqwest::Response, TransportError> {
        let resp = self.http.post(self.chat_url()).json(req).send().await?;
        ensure_success(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, TransportError> {
        tracing::debug!(%url, "GET");
        let resp = self.http.get(url).send().await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.json().await?)
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!(status, "chat api returned an error status");
    Err(TransportError::Status { status, body })
}

#[async_trait]
impl ChatTransport for HttpChatClient {
    async fn send_message(&self, req: &ChatRequest) -> Result<ChatResponse, TransportError> {
        metrics::counter!("mgdi_chat_requests_total", "mode" => "buffered").increment(1);
        let result = async {
            let resp = self.post_chat(req).await?;
            Ok::<_, TransportError>(resp.json::<ChatResponse>().await?)
        }
        .await;
        if result.is_err() {
            metrics::counter!("mgdi_chat_request_failures_total", "mode" => "buffered").increment(1);
        }
        result
    }

    async fn send_message_stream(
        &self,
        req: &ChatRequest,
        on_chunk: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), TransportError> {
        metrics::counter!("mgdi_chat_requests_total", "mode" => "stream").increment(1);
        let body = ChatRequest { stream: Some(true), ..req.clone() };
        let result = async {
            let resp = self.post_chat(&body).await?;
            if resp.status() == StatusCode::NO_CONTENT {
                return Err(TransportError::MissingBody);
            }
            let chunks = data_chunks(resp.bytes_stream());
            futures::pin_mut!(chunks);
            let mut count = 0u64;
            while let Some(chunk) = chunks.next().await {
                on_chunk(chunk?);
                count += 1;
            }
            metrics::counter!("mgdi_chat_stream_chunks_total").increment(count);
            tracing::debug!(chunks = count, "stream finished");
            Ok::<_, TransportError>(())
        }
        .await;
        if result.is_err() {
            metrics::counter!("mgdi_chat_request_failures_total", "mode" => "stream").increment(1);
        }
        result
    }

    async fn get_providers(&self) -> Result<BTreeMap<String, ProviderStatus>, TransportError> {
        let envelope: ProvidersEnvelope = self.get_json(format!("{}/chat/providers", self.base_url)).await?;
        Ok(envelope.providers)
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        let envelope: ModelsEnvelope = self.get_json(format!("{}/chat/models", self.base_url)).await?;
        Ok(envelope.models)
    }

    async fn health_check(&self) -> Result<HealthStatus, TransportError> {
        self.get_json(format!("{}/health", self.health_url)).await
    }

    async fn get_timeline(&self) -> Result<Vec<MemoryEntry>, TransportError> {
        self.get_json(format!("{}/memory/timeline", self.base_url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use axum::{Json, Router, body::Body, http::StatusCode as AxumStatus, routing::{get, post}};
    use std::sync::{Arc, Mutex};

    async fn spawn_server(app: Router) -> HttpChatClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = ClientConfig::default().with_api_base(Some(format!("http://{}/api", addr)));
        HttpChatClient::new(&config).unwrap()
    }

    fn hello_request() -> ChatRequest {
        ChatRequest {
            messages: vec![WireMessage { role: Role::User, content: "hello".into() }],
            model: Some("gpt-3.5-turbo".into()),
            max_tokens: Some(4096),
            temperature: Some(0.7),
            provider: Some("openai".into()),
            stream: Some(false),
        }
    }

    #[tokio::test]
    async fn buffered_chat_parses_response_and_sends_body() {
        let seen = Arc::new(Mutex::new(None::<serde_json::Value>));
        let seen_in_handler = seen.clone();
        let app = Router::new().route(
            "/api/chat/",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = seen_in_handler.clone();
                async move {
                    *seen.lock().unwrap() = Some(body);
                    Json(serde_json::json!({
                        "content": "Hi", "model": "gpt-3.5-turbo", "provider": "openai", "metadata": {"tokens": 1}
                    }))
                }
            }),
        );
        let client = spawn_server(app).await;

        let resp = client.send_message(&hello_request()).await.unwrap();
        assert_eq!(resp.content, "Hi");
        assert_eq!(resp.provider, "openai");
        assert_eq!(resp.tokens(), Some(1));

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], false);
    }

    #[tokio::test]
    async fn error_status_carries_code_and_body() {
        let app = Router::new().route(
            "/api/chat/",
            post(|| async { (AxumStatus::BAD_REQUEST, "Provider 'x' not supported or not configured.") }),
        );
        let client = spawn_server(app).await;

        let err = client.send_message(&hello_request()).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.to_string(), "HTTP 400: Provider 'x' not supported or not configured.");

        let mut chunks = Vec::new();
        let err = client.send_message_stream(&hello_request(), &mut |c| chunks.push(c)).await.unwrap_err();
        assert!(err.to_string().contains("400"));
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn streaming_chat_delivers_chunks_until_done() {
        let stream_flag = Arc::new(Mutex::new(None::<serde_json::Value>));
        let flag_in_handler = stream_flag.clone();
        let app = Router::new().route(
            "/api/chat/",
            post(move |Json(body): Json<serde_json::Value>| {
                let flag = flag_in_handler.clone();
                async move {
                    *flag.lock().unwrap() = Some(body["stream"].clone());
                    let parts = vec!["data: Hel", "\n\ndata: lo\n\ndata:  wo", "rld\n\n", "data: [DONE]\n\n", "data: late\n\n"];
                    Body::from_stream(futures::stream::iter(parts.into_iter().map(Ok::<_, std::convert::Infallible>)))
                }
            }),
        );
        let client = spawn_server(app).await;

        let mut chunks = Vec::new();
        client.send_message_stream(&hello_request(), &mut |c| chunks.push(c)).await.unwrap();
        assert_eq!(chunks, vec!["Hel", "lo", " world"]);
        assert_eq!(stream_flag.lock().unwrap().clone().unwrap(), serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn streaming_without_body_fails() {
        let app = Router::new().route("/api/chat/", post(|| async { AxumStatus::NO_CONTENT }));
        let client = spawn_server(app).await;

        let err = client.send_message_stream(&hello_request(), &mut |_| {}).await.unwrap_err();
        assert!(matches!(err, TransportError::MissingBody));
        assert_eq!(err.to_string(), "No response body");
    }

    #[tokio::test]
    async fn catalog_and_health_endpoints() {
        let app = Router::new()
            .route(
                "/api/chat/providers",
                get(|| async {
                    Json(serde_json::json!({"providers": {
                        "openai": {"available": true, "models": ["gpt-4"]},
                        "anthropic": {"available": false, "error": "missing key"}
                    }}))
                }),
            )
            .route(
                "/api/chat/models",
                get(|| async {
                    Json(serde_json::json!({"models": [{"id": "gpt-4", "provider": "openai", "name": "GPT-4"}]}))
                }),
            )
            .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "version": "0.1.0"})) }));
        let client = spawn_server(app).await;

        let providers = client.get_providers().await.unwrap();
        assert!(providers["openai"].available);
        assert_eq!(providers["anthropic"].error.as_deref(), Some("missing key"));

        let models = client.get_models().await.unwrap();
        assert_eq!(models, vec![ModelInfo { id: "gpt-4".into(), provider: "openai".into(), name: "GPT-4".into() }]);

        let health = client.health_check().await.unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, "0.1.0");
    }

    #[tokio::test]
    async fn timeline_lists_memories() {
        let app = Router::new().route(
            "/api/memory/timeline",
            get(|| async {
                Json(serde_json::json!([
                    {"id": "2", "content": "Discussed React optimization", "metadata": {"topic": "performance"},
                     "created_at": "2024-01-02T00:00:00"},
                    {"id": "1", "content": "User prefers dark theme", "metadata": {},
                     "created_at": "2024-01-01T00:00:00", "similarity": 0.5}
                ]))
            }),
        );
        let client = spawn_server(app).await;

        let entries = client.get_timeline().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "Discussed React optimization");
        assert_eq!(entries[0].metadata["topic"], "performance");
        assert_eq!(entries[0].similarity, None);
        assert!(entries[1].metadata.is_empty());
        assert_eq!(entries[1].similarity, Some(0.5));
    }

    #[tokio::test]
    async fn missing_route_is_a_status_error() {
        let client = spawn_server(Router::new()).await;
        let err = client.get_models().await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }
}
