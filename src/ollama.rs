use crate::embeddings::Embedding;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "gemma3:4b";
pub const DEFAULT_EMBED_MODEL: &str = "all-minilm";

const NO_RESPONSE: &str = "Sorry, I couldn't generate a response.";

/// Failures talking to the Ollama server
///
/// The messages are shown to the user as-is.
#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("Model '{0}' is not available locally. Please run 'ollama pull {0}' to download it.")]
    ModelNotAvailable(String),
    #[error("Ollama call failed with status code {0}")]
    Status(u16),
    #[error("Error calling Ollama API: {0}")]
    Request(#[from] reqwest::Error),
    /// Error reported by the server inside an otherwise valid response
    #[error("{0}")]
    Api(String),
    #[error("No valid response found in the stream")]
    EmptyStream,
    #[error("Failed to parse response: {0}")]
    Parse(String),
}

/// Configuration for the Ollama server
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    /// Model used for generation and chat until the user picks another one
    pub model: String,
    /// Model used to embed document chunks and questions
    pub embed_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        OllamaConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
        }
    }
}

impl OllamaConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = OllamaConfig::default();
        OllamaConfig {
            base_url: env::var("OLLAMA_BASE_URL").unwrap_or(defaults.base_url),
            model: env::var("OLLAMA_MODEL").unwrap_or(defaults.model),
            embed_model: env::var("OLLAMA_EMBED_MODEL").unwrap_or(defaults.embed_model),
        }
    }
}

/// Client for a locally hosted Ollama server
///
/// Also tracks which model is currently selected and which models the server
/// has pulled.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    config: OllamaConfig,
    client: reqwest::Client,
    available_models: Vec<String>,
    current_model: String,
}

impl OllamaClient {
    /// Create a client and fetch the list of local models
    pub async fn connect(config: OllamaConfig) -> Self {
        let mut ollama = OllamaClient {
            current_model: config.model.clone(),
            config,
            client: reqwest::Client::new(),
            available_models: Vec::new(),
        };
        ollama.available_models = ollama.fetch_available_models().await;
        ollama
    }

    /// Get the client configuration
    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Names of the models pulled on the server
    ///
    /// Falls back to the configured default model when the server cannot be
    /// reached or answers with an error.
    pub async fn fetch_available_models(&self) -> Vec<String> {
        let url = format!("{}/api/tags", self.config.base_url);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Could not list Ollama models: {}", e);
                return vec![self.config.model.clone()];
            }
        };

        if !response.status().is_success() {
            warn!("Listing Ollama models failed: {}", response.status());
            return vec![self.config.model.clone()];
        }

        match response.json::<TagsResponse>().await {
            Ok(tags) => tags.models.into_iter().map(|m| m.name).collect(),
            Err(e) => {
                warn!("Unexpected model list from Ollama: {}", e);
                vec![self.config.model.clone()]
            }
        }
    }

    pub async fn refresh_models(&mut self) {
        self.available_models = self.fetch_available_models().await;
        debug!("Available models: {:?}", self.available_models);
    }

    pub fn available_models(&self) -> &[String] {
        &self.available_models
    }

    pub fn is_model_available(&self, model_name: &str) -> bool {
        self.available_models.iter().any(|m| m == model_name)
    }

    pub fn current_model(&self) -> &str {
        &self.current_model
    }

    /// Switch to another local model; unknown models leave the selection unchanged
    pub fn set_model(&mut self, model_name: &str) -> bool {
        if self.is_model_available(model_name) {
            self.current_model = model_name.to_string();
            true
        } else {
            false
        }
    }

    /// Select the first listed model when the current one has not been pulled
    pub fn fallback_to_available_model(&mut self) -> Option<&str> {
        if self.is_model_available(&self.current_model) {
            return None;
        }
        let first = self.available_models.first()?.clone();
        warn!(
            "Model '{}' is not available, using '{}' instead",
            self.current_model, first
        );
        self.current_model = first;
        Some(self.current_model.as_str())
    }

    /// Single-shot completion through `/api/generate`
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<GenerateResponse, OllamaError> {
        let model = self.require_current_model()?;
        let request = GenerateRequest {
            model,
            prompt,
            system,
            stream: false,
        };
        self.post_json("/api/generate", model, &request).await
    }

    /// One-turn conversation through `/api/chat`
    pub async fn chat(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<ChatResponse, OllamaError> {
        let model = self.require_current_model()?;
        // /api/chat only honours a system prompt given as a message
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });
        let request = ChatRequest {
            model,
            messages,
            stream: false,
        };
        self.post_json("/api/chat", model, &request).await
    }

    /// Embed a text with the configured embedding model
    pub async fn embed(&self, text: &str) -> Result<Embedding, OllamaError> {
        let model = self.config.embed_model.as_str();
        let request = EmbeddingRequest {
            model,
            prompt: text,
        };
        let response: EmbeddingResponse = self.post_json("/api/embeddings", model, &request).await?;

        if response.embedding.is_empty() {
            return Err(OllamaError::Api(format!(
                "Model '{}' returned an empty embedding",
                model
            )));
        }

        Ok(Embedding {
            values: response.embedding,
        })
    }

    fn require_current_model(&self) -> Result<&str, OllamaError> {
        if self.is_model_available(&self.current_model) {
            Ok(&self.current_model)
        } else {
            Err(OllamaError::ModelNotAvailable(self.current_model.clone()))
        }
    }

    async fn post_json<B, T>(&self, path: &str, model: &str, body: &B) -> Result<T, OllamaError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.base_url, path);
        debug!("POST {} (model {})", url, model);

        let response = self.client.post(&url).json(body).send().await?;

        match response.status().as_u16() {
            200 => {
                let text = response.text().await?;
                let value = parse_body(&text)?;
                if let Some(message) = value.get("error").and_then(Value::as_str) {
                    return Err(OllamaError::Api(message.to_string()));
                }
                serde_json::from_value(value).map_err(|e| OllamaError::Parse(e.to_string()))
            }
            404 => Err(OllamaError::ModelNotAvailable(model.to_string())),
            status => Err(OllamaError::Status(status)),
        }
    }
}

/// Parse a response body that is either one JSON document or a stream of
/// newline-delimited JSON documents; the last document of a stream wins.
pub fn parse_body(text: &str) -> Result<Value, OllamaError> {
    let whole_err = match serde_json::from_str(text) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let mut last = None;
    for line in text.trim().lines().filter(|l| !l.trim().is_empty()) {
        let value: Value = serde_json::from_str(line)
            .map_err(|_| OllamaError::Parse(whole_err.to_string()))?;
        last = Some(value);
    }

    last.ok_or(OllamaError::EmptyStream)
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct GenerateResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
}

impl GenerateResponse {
    pub fn text(&self) -> &str {
        self.response.as_deref().unwrap_or(NO_RESPONSE)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
}

impl ChatResponse {
    pub fn text(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or(NO_RESPONSE)
    }
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Deserialize, Debug, Default)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize, Debug)]
struct ModelTag {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    const TAGS: &str = r#"{"models":[{"name":"gemma3:4b"},{"name":"mistral"}]}"#;

    /// Serve the canned responses to consecutive connections, returning the raw requests
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut stream).await);
                let reply = format!(
                    "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
            requests
        });

        (base_url, handle)
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&data[..end]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn config(base_url: &str) -> OllamaConfig {
        OllamaConfig {
            base_url: base_url.to_string(),
            ..OllamaConfig::default()
        }
    }

    /// An address nothing listens on
    async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        url
    }

    #[tokio::test]
    async fn test_connect_fetches_available_models() {
        let (url, server) = serve(vec![(200, TAGS)]).await;
        let client = OllamaClient::connect(config(&url)).await;

        assert_eq!(client.available_models(), ["gemma3:4b", "mistral"]);
        assert_eq!(client.current_model(), "gemma3:4b");
        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /api/tags"));
    }

    #[tokio::test]
    async fn test_unreachable_server_falls_back_to_default_model() {
        let client = OllamaClient::connect(config(&closed_port_url().await)).await;
        assert_eq!(client.available_models(), [DEFAULT_MODEL]);
    }

    #[tokio::test]
    async fn test_failed_model_listing_falls_back_to_default_model() {
        let (url, _server) = serve(vec![(500, "{}")]).await;
        let client = OllamaClient::connect(config(&url)).await;
        assert_eq!(client.available_models(), [DEFAULT_MODEL]);
    }

    #[tokio::test]
    async fn test_set_model() {
        let (url, _server) = serve(vec![(200, TAGS)]).await;
        let mut client = OllamaClient::connect(config(&url)).await;

        assert!(client.set_model("mistral"));
        assert_eq!(client.current_model(), "mistral");

        assert!(!client.set_model("invalid_model"));
        assert_eq!(client.current_model(), "mistral");
    }

    #[tokio::test]
    async fn test_fallback_to_available_model() {
        let (url, _server) = serve(vec![(200, r#"{"models":[{"name":"llama2"}]}"#)]).await;
        let mut client = OllamaClient::connect(config(&url)).await;

        assert_eq!(client.fallback_to_available_model(), Some("llama2"));
        assert_eq!(client.current_model(), "llama2");
        assert_eq!(client.fallback_to_available_model(), None);
    }

    #[tokio::test]
    async fn test_generate_response() {
        let (url, server) = serve(vec![(200, TAGS), (200, r#"{"response":"Test response","done":true}"#)]).await;
        let client = OllamaClient::connect(config(&url)).await;

        let response = client.generate("Test prompt", Some("Be brief")).await.unwrap();
        assert_eq!(response.text(), "Test response");

        let requests = server.await.unwrap();
        let request = &requests[1];
        assert!(request.starts_with("POST /api/generate"));
        assert!(request.contains(r#""model":"gemma3:4b""#));
        assert!(request.contains(r#""prompt":"Test prompt""#));
        assert!(request.contains(r#""system":"Be brief""#));
        assert!(request.contains(r#""stream":false"#));
    }

    #[tokio::test]
    async fn test_generate_with_unavailable_model_skips_request() {
        let (url, server) = serve(vec![(200, r#"{"models":[{"name":"mistral"}]}"#)]).await;
        let client = OllamaClient::connect(config(&url)).await;

        let err = client.generate("hi", None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Model 'gemma3:4b' is not available locally. Please run 'ollama pull gemma3:4b' to download it."
        );
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors() {
        let (url, _server) = serve(vec![(200, TAGS), (404, "{}"), (500, "{}")]).await;
        let client = OllamaClient::connect(config(&url)).await;

        let not_found = client.generate("hi", None).await.unwrap_err();
        assert!(matches!(not_found, OllamaError::ModelNotAvailable(ref m) if m == "gemma3:4b"));

        let failed = client.chat("hi", None).await.unwrap_err();
        assert_eq!(failed.to_string(), "Ollama call failed with status code 500");
    }

    #[tokio::test]
    async fn test_chat_reads_message_content() {
        let (url, server) = serve(vec![
            (200, TAGS),
            (200, r#"{"message":{"role":"assistant","content":"Hello there"},"done":true}"#),
            (200, r#"{"done":true}"#),
        ])
        .await;
        let client = OllamaClient::connect(config(&url)).await;

        let reply = client.chat("Hi", None).await.unwrap();
        assert_eq!(reply.text(), "Hello there");

        let empty = client.chat("Hi again", None).await.unwrap();
        assert_eq!(empty.text(), NO_RESPONSE);

        let requests = server.await.unwrap();
        assert!(requests[1].starts_with("POST /api/chat"));
        assert!(requests[1].contains(r#""messages":[{"role":"user","content":"Hi"}]"#));
        assert!(!requests[1].contains(r#""system""#));
    }

    #[tokio::test]
    async fn test_chat_sends_system_prompt_as_first_message() {
        let (url, server) = serve(vec![
            (200, TAGS),
            (200, r#"{"message":{"role":"assistant","content":"Hey!"},"done":true}"#),
        ])
        .await;
        let client = OllamaClient::connect(config(&url)).await;

        let reply = client.chat("Hi", Some("Be friendly")).await.unwrap();
        assert_eq!(reply.text(), "Hey!");

        let requests = server.await.unwrap();
        assert!(requests[1].contains(
            r#""messages":[{"role":"system","content":"Be friendly"},{"role":"user","content":"Hi"}]"#
        ));
        assert!(!requests[1].contains(r#""system":"#));
    }

    #[tokio::test]
    async fn test_lost_connection_is_reported_as_api_error() {
        let (url, _server) = serve(vec![(200, TAGS)]).await;
        let mut client = OllamaClient::connect(config(&url)).await;
        client.config.base_url = closed_port_url().await;

        let err = client.generate("hi", None).await.unwrap_err();
        assert!(matches!(err, OllamaError::Request(_)));
        assert!(err.to_string().starts_with("Error calling Ollama API: "));

        let err = client.chat("hi", None).await.unwrap_err();
        assert!(err.to_string().starts_with("Error calling Ollama API: "));
    }

    #[tokio::test]
    async fn test_streamed_body_uses_last_line() {
        let (url, _server) = serve(vec![
            (200, TAGS),
            (
                200,
                "{\"response\":\"partial\",\"done\":false}\n{\"response\":\"Final answer\",\"done\":true}\n",
            ),
        ])
        .await;
        let client = OllamaClient::connect(config(&url)).await;

        let response = client.generate("hi", None).await.unwrap();
        assert_eq!(response.text(), "Final answer");
        assert!(response.done);
    }

    #[tokio::test]
    async fn test_server_error_field_is_surfaced() {
        let (url, _server) = serve(vec![(200, TAGS), (200, r#"{"error":"model is loading"}"#)]).await;
        let client = OllamaClient::connect(config(&url)).await;

        let err = client.generate("hi", None).await.unwrap_err();
        assert_eq!(err.to_string(), "model is loading");
    }

    #[tokio::test]
    async fn test_embed() {
        let (url, server) = serve(vec![(200, TAGS), (200, r#"{"embedding":[0.5,-1.0,2.0]}"#)]).await;
        let client = OllamaClient::connect(config(&url)).await;

        let embedding = client.embed("some text").await.unwrap();
        assert_eq!(embedding.values, vec![0.5, -1.0, 2.0]);

        let requests = server.await.unwrap();
        assert!(requests[1].starts_with("POST /api/embeddings"));
        assert!(requests[1].contains(r#""model":"all-minilm""#));
    }

    #[test]
    fn test_parse_body_single_document() {
        let value = parse_body(r#"{"response":"ok"}"#).unwrap();
        assert_eq!(value["response"], "ok");
    }

    #[test]
    fn test_parse_body_stream_keeps_last_line() {
        let body = "{\"response\":\"Hel\",\"done\":false}\n\n{\"response\":\"lo\",\"done\":true}\n";
        let value = parse_body(body).unwrap();
        assert_eq!(value["response"], "lo");
        assert_eq!(value["done"], true);
    }

    #[test]
    fn test_parse_body_failures() {
        assert!(matches!(parse_body(""), Err(OllamaError::EmptyStream)));
        let err = parse_body("{\"a\":1}\nnot json").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse response:"));
    }
}
