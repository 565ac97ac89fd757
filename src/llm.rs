use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::conversation::{Conversation, Role};
use crate::ollama;

/// Language model collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Single completion for the whole conversation.
    async fn response(&self, conversation: &Conversation) -> Result<String>;

    /// Completion delivered as a stream of text chunks.
    async fn streaming_response(
        &self,
        conversation: &Conversation,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Chat completion client backed by Ollama's `/api/chat`.
pub struct OllamaLlm {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    options: Option<OllamaOptions>,
}

impl OllamaLlm {
    pub async fn connect(ollama_url: &str, model: &str) -> Result<Self> {
        let llm = Self::new(ollama_url, model)?;
        ollama::verify_model(&llm.client, &llm.ollama_url, &llm.model).await?;
        Ok(llm)
    }

    pub fn new(ollama_url: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(300)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            ollama_url: ollama::normalize_base_url(ollama_url),
            model: model.to_string(),
            options: None,
        })
    }

    pub fn with_options(mut self, options: OllamaOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    fn build_request<'a>(&'a self, conversation: &Conversation, stream: bool) -> OllamaChatRequest<'a> {
        OllamaChatRequest {
            model: &self.model,
            messages: conversation
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect(),
            stream,
            options: self.options.clone(),
        }
    }

    async fn send(&self, request: &OllamaChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.ollama_url))
            .json(request)
            .send()
            .await
            .context("Failed to contact Ollama chat endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM API error: {} - {}", status, body));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OllamaLlm {
    async fn response(&self, conversation: &Conversation) -> Result<String> {
        let start = Instant::now();
        let request = self.build_request(conversation, false);
        tracing::debug!(model = %self.model, messages = request.messages.len(), "LLM response");

        let chunk: OllamaChatChunk = self
            .send(&request)
            .await?
            .json()
            .await
            .context("Failed to parse LLM response")?;
        if let Some(error) = chunk.error {
            return Err(anyhow::anyhow!("LLM returned error: {}", error));
        }

        tracing::info!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "LLM response complete"
        );
        Ok(chunk.message.map(|m| m.content).unwrap_or_default())
    }

    async fn streaming_response(
        &self,
        conversation: &Conversation,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let request = self.build_request(conversation, true);
        tracing::debug!(model = %self.model, messages = request.messages.len(), "LLM streaming response");

        let bytes = Box::pin(self.send(&request).await?.bytes_stream());
        let stream = futures::stream::unfold(
            (bytes, Vec::<u8>::new(), false),
            |(mut bytes, mut buffer, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        match parse_chat_line(&line) {
                            Ok(None) => continue,
                            Ok(Some((content, done))) => {
                                return Some((Ok(content), (bytes, buffer, done)));
                            }
                            Err(err) => return Some((Err(err), (bytes, buffer, true))),
                        }
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(err)) => {
                            return Some((Err(err.into()), (bytes, buffer, true)));
                        }
                        None => {
                            let line = std::mem::take(&mut buffer);
                            return match parse_chat_line(&line) {
                                Ok(Some((content, _))) => Some((Ok(content), (bytes, buffer, true))),
                                Ok(None) => None,
                                Err(err) => Some((Err(err), (bytes, buffer, true))),
                            };
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}

/// Parses one NDJSON line of a streamed chat response into `(content, done)`.
fn parse_chat_line(line: &[u8]) -> Result<Option<(String, bool)>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let chunk: OllamaChatChunk =
        serde_json::from_str(text).context("Invalid streaming chunk from LLM")?;
    if let Some(error) = chunk.error {
        return Err(anyhow::anyhow!("LLM returned error: {}", error));
    }
    Ok(Some((
        chunk.message.map(|m| m.content).unwrap_or_default(),
        chunk.done,
    )))
}
