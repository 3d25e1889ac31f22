use async_trait::async_trait;

use ripple_shared::protocol::PresenceUpdate;
use ripple_shared::types::{
    CallLogEntry, CallLogId, CallOutcome, Chat, ChatId, MessageDraft, MessageId, MessageRecord,
    UserId,
};

use crate::error::BackendError;

/// Scope of a message deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Hide for the requesting user only.
    Me,
    /// Remove for every participant; the backend enforces sender-only.
    Everyone,
}

/// The request/response data API of the managed backend.
///
/// Authorization lives on the other side of this trait: the engine never
/// duplicates sender checks, it only surfaces denial as an error.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist a new message and return the authoritative row.  The backend
    /// also emits a `message_inserted` echo on the chat topic, which may
    /// arrive before or after this response returns.
    async fn create_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        draft: &MessageDraft,
    ) -> Result<MessageRecord, BackendError>;

    async fn edit_message(
        &self,
        id: MessageId,
        editor: UserId,
        body: String,
    ) -> Result<MessageRecord, BackendError>;

    async fn delete_message(
        &self,
        id: MessageId,
        requester: UserId,
        scope: DeleteScope,
    ) -> Result<(), BackendError>;

    /// Full history fetch for a chat.  Arrival order across reconnect gaps
    /// is not creation order; callers re-sort by timestamp.
    async fn fetch_messages(&self, chat_id: ChatId) -> Result<Vec<MessageRecord>, BackendError>;

    /// Persist read state so unread counts survive reload.
    async fn mark_read(
        &self,
        chat_id: ChatId,
        reader: UserId,
        message_ids: &[MessageId],
    ) -> Result<(), BackendError>;

    /// Idempotent-create: a second private chat between the same two users
    /// resolves to the existing one.
    async fn find_or_create_private_chat(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Chat, BackendError>;

    async fn get_chat(&self, id: ChatId) -> Result<Chat, BackendError>;

    async fn chats_for_user(&self, user: UserId) -> Result<Vec<Chat>, BackendError>;

    async fn upsert_presence(&self, update: &PresenceUpdate) -> Result<(), BackendError>;

    /// Write a call-log row; the caller finalizes it at termination.
    async fn create_call_log(&self, entry: &CallLogEntry) -> Result<CallLogId, BackendError>;

    async fn update_call_log(
        &self,
        id: CallLogId,
        outcome: CallOutcome,
        duration_secs: Option<i64>,
    ) -> Result<(), BackendError>;

    async fn set_starred(
        &self,
        user: UserId,
        message_id: MessageId,
        starred: bool,
    ) -> Result<(), BackendError>;

    async fn set_pinned(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        pinned: bool,
    ) -> Result<(), BackendError>;
}

/// Binary upload collaborator.  The returned URL is treated as an opaque
/// `media_url` handle by everything above.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, BackendError>;
}
