//! REST backend seam and its reqwest implementation.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::{debug, warn};
use url::Url;

use crate::chat::api::auth::AuthContext;
use crate::chat::api::dto::{
    ConversationEnvelope, ConversationListEnvelope, CreateConversationRequest, HistoryEnvelope,
    MessageEnvelope, WireMessage,
};
use crate::chat::api::http;
use crate::chat::core::config::ApiConfig;
use crate::chat::core::errors::ApiError;
use crate::chat::core::ids::{ClientMessageId, MessageId, OrderId};
use crate::chat::core::model::{Conversation, ConversationRef, Message, OutgoingFile};

/// Operations the chat client consumes from the backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One page of history; page 1 is the newest.
    async fn fetch_history(
        &self,
        scope: &ConversationRef,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError>;

    /// Conversations visible to the viewer.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    /// Open a freeform conversation with a first message.
    async fn create_conversation(
        &self,
        subject: &str,
        message: &str,
    ) -> Result<Conversation, ApiError>;

    /// Upload files with an optional text body.
    async fn send_with_attachments(
        &self,
        scope: &ConversationRef,
        content: &str,
        files: &[OutgoingFile],
        client_id: ClientMessageId,
    ) -> Result<Message, ApiError>;

    /// Mark every message of an order thread as read.
    async fn mark_all_read(&self, order_id: &OrderId) -> Result<(), ApiError>;

    /// Download one attachment.
    async fn fetch_attachment(
        &self,
        conversation: &str,
        message_id: &MessageId,
        index: usize,
    ) -> Result<Vec<u8>, ApiError>;
}

/// Bearer-authenticated client for `/chats/v1`.
pub struct HttpChatApi {
    client: reqwest::Client,
    base: Url,
    auth: AuthContext,
}

impl HttpChatApi {
    /// Create a new API client for the given viewer.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(config: &ApiConfig, auth: AuthContext) -> Result<Self, ApiError> {
        Ok(Self {
            client: http::build_client(config)?,
            base: Url::parse(&config.base_url)?,
            auth,
        })
    }

    fn chats(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut all = vec!["chats", "v1"];
        all.extend_from_slice(segments);
        http::endpoint(&self.base, &all)
    }
}

#[async_trait]
impl ChatBackend for HttpChatApi {
    async fn fetch_history(
        &self,
        scope: &ConversationRef,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let mut url = match scope {
            ConversationRef::Order(order_id) => self.chats(&["order", order_id.as_str()])?,
            ConversationRef::Chat(chat_id) => self.chats(&[chat_id.as_str()])?,
        };
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());

        debug!(%scope, page, limit, "Fetching history page");
        let response = self
            .client
            .get(url)
            .bearer_auth(self.auth.token())
            .send()
            .await?;
        let envelope: HistoryEnvelope = http::decode(http::ensure_success(response).await?).await?;

        Ok(envelope
            .messages
            .into_iter()
            .map(WireMessage::into_message)
            .collect())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let response = self
            .client
            .get(self.chats(&["list"])?)
            .bearer_auth(self.auth.token())
            .send()
            .await?;
        let envelope: ConversationListEnvelope =
            http::decode(http::ensure_success(response).await?).await?;

        let mut conversations = Vec::with_capacity(envelope.conversations.len());
        for wire in envelope.conversations {
            let id = wire.id.clone();
            match Conversation::try_from(wire) {
                Ok(conversation) => conversations.push(conversation),
                Err(err) => warn!(conversation_id = %id, %err, "Skipping malformed conversation"),
            }
        }
        Ok(conversations)
    }

    async fn create_conversation(
        &self,
        subject: &str,
        message: &str,
    ) -> Result<Conversation, ApiError> {
        let response = self
            .client
            .post(self.chats(&["create"])?)
            .bearer_auth(self.auth.token())
            .json(&CreateConversationRequest { subject, message })
            .send()
            .await?;
        let envelope: ConversationEnvelope =
            http::decode(http::ensure_success(response).await?).await?;
        Ok(Conversation::try_from(envelope.conversation)?)
    }

    async fn send_with_attachments(
        &self,
        scope: &ConversationRef,
        content: &str,
        files: &[OutgoingFile],
        client_id: ClientMessageId,
    ) -> Result<Message, ApiError> {
        let mut form = match scope {
            ConversationRef::Order(order_id) => Form::new().text("orderId", order_id.to_string()),
            ConversationRef::Chat(chat_id) => Form::new().text("chatId", chat_id.to_string()),
        };
        form = form
            .text("content", content.to_string())
            .text("clientId", client_id.to_string());
        for file in files {
            let part = Part::bytes(file.bytes.clone())
                .file_name(file.filename.clone())
                .mime_str(&file.content_type)?;
            form = form.part("attachments", part);
        }

        debug!(%scope, files = files.len(), "Uploading attachments");
        let response = self
            .client
            .post(self.chats(&["send-with-attachment"])?)
            .bearer_auth(self.auth.token())
            .multipart(form)
            .send()
            .await?;
        let envelope: MessageEnvelope = http::decode(http::ensure_success(response).await?).await?;
        Ok(envelope.message.into_message())
    }

    async fn mark_all_read(&self, order_id: &OrderId) -> Result<(), ApiError> {
        let response = self
            .client
            .patch(self.chats(&["read", order_id.as_str()])?)
            .bearer_auth(self.auth.token())
            .send()
            .await?;
        http::ensure_success(response).await?;
        Ok(())
    }

    async fn fetch_attachment(
        &self,
        conversation: &str,
        message_id: &MessageId,
        index: usize,
    ) -> Result<Vec<u8>, ApiError> {
        let index = index.to_string();
        let url = self.chats(&[
            conversation,
            "messages",
            message_id.as_str(),
            "attachments",
            &index,
        ])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(self.auth.token())
            .send()
            .await?;
        let bytes = http::ensure_success(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
