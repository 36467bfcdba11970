//! HTTP Backend Implementation
//!
//! Talks to the chat server's REST API. Streaming turns use a chunked
//! `text/event-stream` response; everything else is plain JSON.
//!
//! # Endpoints (relative to the base URL)
//!
//! - `POST /chat/conversations/{id}/messages` - submit a turn (streamed)
//! - `GET|POST /chat/conversations` - list / create
//! - `GET|DELETE /chat/conversations/{id}` - fetch with history / delete
//! - `PUT /chat/conversations/{id}/model` - change the bound model
//! - `POST /chat/conversations/{id}/selection` - persist a parallel selection
//! - `GET /models` - list available models

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::traits::{
    ApiError, ByteStream, ChatTransport, ConversationApi, ConversationDetail,
    ConversationSummary, ModelInfo, SelectionRecord, StreamRequest, TransportError,
};
use crate::config::ServerConfig;
use crate::messages::ConversationId;

/// Time budget for CRUD calls
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the chat server
#[derive(Clone)]
pub struct HttpBackend {
    /// Base URL including the API prefix, without trailing slash
    base_url: String,
    /// Bearer token from the auth collaborator
    token: Option<String>,
    /// Whole-request ceiling for streamed turns
    stream_timeout: Duration,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpBackend {
    /// Create a new HTTP backend
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &ServerConfig) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            stream_timeout: config.request_timeout,
            http_client,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn conversations_url(&self) -> String {
        format!("{}/chat/conversations", self.base_url)
    }

    fn conversation_url(&self, id: &ConversationId) -> String {
        format!("{}/{}", self.conversations_url(), id)
    }

    fn messages_url(&self, id: &ConversationId) -> String {
        format!("{}/messages", self.conversation_url(id))
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a CRUD request and map failures
    async fn call(
        &self,
        builder: RequestBuilder,
        conversation: Option<&ConversationId>,
    ) -> Result<Response, ApiError> {
        let response = self
            .authorize(builder)
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = conversation {
                return Err(ApiError::NotFound(id.clone()));
            }
        }
        Err(ApiError::Rejected {
            status: status.as_u16(),
            message: error_text(response).await,
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Pull the `error` field out of a failed response, falling back to the raw body
async fn error_text(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(body)
}

#[async_trait]
impl ChatTransport for HttpBackend {
    fn name(&self) -> &str {
        "HTTP"
    }

    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let url = self.messages_url(&request.conversation_id);

        let response = self
            .authorize(self.http_client.post(&url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .timeout(self.stream_timeout)
            .json(&request.body())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = error_text(response).await;
            return Err(TransportError::Status { status, body });
        }

        tracing::debug!(
            conversation = %request.conversation_id,
            mode = request.mode.as_wire(),
            "Response stream opened"
        );

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(TransportError::from)),
        ))
    }
}

#[async_trait]
impl ConversationApi for HttpBackend {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let response = self
            .call(self.http_client.get(self.conversations_url()), None)
            .await?;
        Self::json(response).await
    }

    async fn create_conversation(
        &self,
        title: &str,
        model: &str,
    ) -> Result<ConversationSummary, ApiError> {
        let body = serde_json::json!({ "title": title, "model_name": model });
        let response = self
            .call(self.http_client.post(self.conversations_url()).json(&body), None)
            .await?;
        Self::json(response).await
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationDetail, ApiError> {
        let response = self
            .call(self.http_client.get(self.conversation_url(id)), Some(id))
            .await?;
        Self::json(response).await
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError> {
        self.call(self.http_client.delete(self.conversation_url(id)), Some(id))
            .await?;
        Ok(())
    }

    async fn change_model(&self, id: &ConversationId, model: &str) -> Result<(), ApiError> {
        let url = format!("{}/model", self.conversation_url(id));
        let body = serde_json::json!({ "model_name": model });
        self.call(self.http_client.put(url).json(&body), Some(id))
            .await?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        let response = self.call(self.http_client.get(self.models_url()), None).await?;
        let data: serde_json::Value = Self::json(response).await?;
        let models = data
            .get("models")
            .cloned()
            .ok_or_else(|| ApiError::Decode("missing 'models' field".to_string()))?;
        serde_json::from_value(models).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn persist_selection(
        &self,
        id: &ConversationId,
        selection: &SelectionRecord,
    ) -> Result<(), ApiError> {
        let url = format!("{}/selection", self.conversation_url(id));
        self.call(self.http_client.post(url).json(selection), Some(id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base_url: &str) -> HttpBackend {
        let config = ServerConfig {
            base_url: base_url.to_string(),
            ..ServerConfig::default()
        };
        HttpBackend::new(&config).unwrap()
    }

    #[test]
    fn test_urls() {
        let backend = backend("http://localhost:3030/api/");
        assert_eq!(backend.base_url(), "http://localhost:3030/api");

        let id = ConversationId("abc".to_string());
        assert_eq!(
            backend.messages_url(&id),
            "http://localhost:3030/api/chat/conversations/abc/messages"
        );
        assert_eq!(
            backend.conversation_url(&id),
            "http://localhost:3030/api/chat/conversations/abc"
        );
        assert_eq!(backend.models_url(), "http://localhost:3030/api/models");
    }

    #[tokio::test]
    async fn test_open_stream_unreachable_server() {
        // Port 9 (discard) on localhost is not expected to run an HTTP server
        let backend = backend("http://127.0.0.1:9/api");
        let request = StreamRequest::new(
            ConversationId("c1".to_string()),
            "hello",
            crate::conversation::ChatMode::Single,
        );
        let result = backend.open_stream(&request).await;
        assert!(matches!(
            result,
            Err(TransportError::Network(_) | TransportError::Timeout)
        ));
    }
}
