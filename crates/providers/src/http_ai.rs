//! HTTP AI client.
//!
//! POSTs a caller-supplied JSON body to `{base_url}/{path}` of a configured
//! provider. The body is passed through untouched; only the response text is
//! interpreted.

use crate::extract::{LineBuffer, SseLine, extract_ai_text, parse_sse_line};
use async_trait::async_trait;
use futures::StreamExt;
use inkwell_config::ProviderConfig;
use inkwell_core::ai::{AiClient, AiResponse, AiTarget, ChunkReceiver};
use inkwell_core::error::UpstreamError;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
struct Endpoint {
    base_url: String,
    api_key: Option<String>,
}

/// An [`AiClient`] over plain HTTP.
pub struct HttpAiClient {
    endpoints: HashMap<String, Endpoint>,
    client: reqwest::Client,
}

impl HttpAiClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoints: HashMap::new(),
            client,
        }
    }

    /// Register every provider from configuration.
    pub fn from_config(providers: &HashMap<String, ProviderConfig>) -> Self {
        providers.iter().fold(Self::new(), |client, (name, cfg)| {
            client.with_provider(name.clone(), cfg.base_url.clone(), cfg.api_key.clone())
        })
    }

    pub fn with_provider(
        mut self,
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        self.endpoints.insert(
            name.into(),
            Endpoint {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_key,
            },
        );
        self
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    fn request(&self, target: &AiTarget, body: &str) -> Result<reqwest::RequestBuilder, UpstreamError> {
        target.validate()?;
        let endpoint = self
            .endpoints
            .get(&target.provider)
            .ok_or_else(|| UpstreamError::ProviderNotConfigured(target.provider.clone()))?;

        let url = format!("{}/{}", endpoint.base_url, target.path.trim_start_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body.to_string());

        if let Some(key) = &endpoint.api_key {
            request = if target.provider == "gemini" {
                request.header("x-goog-api-key", key)
            } else {
                request.header("Authorization", format!("Bearer {key}"))
            };
        }
        debug!(provider = %target.provider, url = %url, "Sending AI request");
        Ok(request)
    }
}

impl Default for HttpAiClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %body, "AI provider error");
    Err(UpstreamError::Status {
        status_code: status.as_u16(),
        body,
    })
}

fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(e.to_string())
    } else {
        UpstreamError::Network(e.to_string())
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn call(&self, target: &AiTarget, body: &str) -> Result<AiResponse, UpstreamError> {
        let response = self
            .request(target, body)?
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let text = response.text().await.map_err(transport_error)?;

        let raw = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        let extracted = extract_ai_text(&raw);
        Ok(AiResponse { raw, text: extracted })
    }

    async fn call_stream(&self, target: &AiTarget, body: &str) -> Result<ChunkReceiver, UpstreamError> {
        let response = self
            .request(target, body)?
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider = target.provider.clone();

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = LineBuffer::new();

            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(UpstreamError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };
                for line in buffer.push(&chunk) {
                    match parse_sse_line(&line) {
                        SseLine::Text(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                debug!(provider = %provider, "Stream receiver dropped, stopping");
                                return;
                            }
                        }
                        SseLine::Done => return,
                        SseLine::Ignore => {}
                    }
                }
            }

            if let Some(SseLine::Text(text)) = buffer.finish().map(|line| parse_sse_line(&line)) {
                let _ = tx.send(Ok(text)).await;
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_provider_is_rejected_before_sending() {
        let client = HttpAiClient::new();
        let err = client
            .call(&AiTarget::new("nowhere", "chat/completions"), "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ProviderNotConfigured(_)));
    }

    #[tokio::test]
    async fn traversal_path_is_rejected_before_sending() {
        let client = HttpAiClient::new().with_provider("openai", "http://127.0.0.1:1", None);
        let err = client
            .call_stream(&AiTarget::new("openai", "../admin"), "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn stream_survives_a_character_split_across_reads() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"{}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let event = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\ndata: [DONE]\n\n";
            let split = event.find('你').unwrap() + 1;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            socket.write_all(&event.as_bytes()[..split]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.write_all(&event.as_bytes()[split..]).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let client = HttpAiClient::new().with_provider("openai", format!("http://{addr}"), None);
        let mut rx = client
            .call_stream(&AiTarget::new("openai", "chat/completions"), "{}")
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text.push_str(&chunk.unwrap());
        }
        assert_eq!(text, "你好");
    }

    #[test]
    fn providers_load_from_config() {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                base_url: "https://api.openai.com/v1/".into(),
                api_key: Some("sk-test".into()),
                default_model: None,
            },
        );
        let client = HttpAiClient::from_config(&providers);
        assert!(client.has_provider("openai"));
        assert_eq!(client.endpoints["openai"].base_url, "https://api.openai.com/v1");
    }
}
