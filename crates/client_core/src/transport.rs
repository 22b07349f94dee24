use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::ConversationId,
    error::ApiError,
    protocol::{
        ChatMessage, ChatRequest, ChatResponse, ChildSummary, ConversationSummary, ListEnvelope,
        UpdateMetadataRequest, UserProfile,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{error::ClientError, session::SessionContext};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ParenZingApi: Send + Sync {
    async fn current_user(&self) -> Result<UserProfile, ClientError>;
    async fn list_children(&self) -> Result<Vec<ChildSummary>, ClientError>;
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError>;
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, ClientError>;
    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError>;
    async fn update_metadata(
        &self,
        conversation_id: &ConversationId,
        update: &UpdateMetadataRequest,
    ) -> Result<(), ClientError>;
}

/// REST transport. Sessions are cookie based; a stored bearer token is sent
/// as well when the session holds one.
pub struct HttpApi {
    http: Client,
    base_url: String,
    session: Arc<SessionContext>,
}

impl HttpApi {
    pub fn new(
        base_url: &str,
        session: Arc<SessionContext>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let parsed = Url::parse(base_url.trim())?;
        let http = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            session,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.base_url));
        match self.session.auth_token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<String, ClientError> {
        let response = builder.send().await?;
        let status = response.status();
        let url = response.url().path().to_string();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            warn!(path = %url, "api: unauthorized");
            return Err(ClientError::Unauthorized);
        }
        if !status.is_success() {
            let message = ApiError::message_from_body(&body);
            warn!(path = %url, status = status.as_u16(), %message, "api: request failed");
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        debug!(path = %url, status = status.as_u16(), "api: ok");
        Ok(body)
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let body = self.execute(builder).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ParenZingApi for HttpApi {
    async fn current_user(&self) -> Result<UserProfile, ClientError> {
        self.fetch(self.request(Method::GET, "/me").await).await
    }

    async fn list_children(&self) -> Result<Vec<ChildSummary>, ClientError> {
        let list: ListEnvelope<ChildSummary> = self
            .fetch(self.request(Method::GET, "/profile/children").await)
            .await?;
        Ok(list.into_items())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let list: ListEnvelope<ConversationSummary> = self
            .fetch(self.request(Method::GET, "/api/conversations").await)
            .await?;
        Ok(list.into_items())
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, ClientError> {
        let path = format!("/api/conversations/{conversation_id}/messages");
        let list: ListEnvelope<ChatMessage> =
            self.fetch(self.request(Method::GET, &path).await).await?;
        Ok(list.into_items())
    }

    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        self.fetch(self.request(Method::POST, "/api/chat").await.json(request))
            .await
    }

    async fn update_metadata(
        &self,
        conversation_id: &ConversationId,
        update: &UpdateMetadataRequest,
    ) -> Result<(), ClientError> {
        let path = format!("/api/conversations/{conversation_id}/update-metadata");
        self.execute(self.request(Method::PUT, &path).await.json(update))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
