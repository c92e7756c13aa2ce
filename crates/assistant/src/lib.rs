//! Chat panel state for one snippet scope, kept in step with the store.

use chat_stream::{ChatBackend, ChatError, ChatReply, ChatRequest, StreamObserver};
use core_model::{ChatMessage, Snippet, SnippetDraft, UNSAVED_SCOPE};
use store_sqlite::{SqliteStore, StoreError};
use tracing::{info, warn};

/// Assistant reply recorded when a chat turn fails.
pub const CHAT_ERROR_MESSAGE: &str =
    "Sorry, I encountered an error processing your request. Please try again.";

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

pub struct ChatSession {
    store: SqliteStore,
    scope: String,
    history: Vec<ChatMessage>,
    conversation_id: String,
}

impl ChatSession {
    /// Restores the history and conversation id of `scope`. Unreadable chat
    /// data starts the session empty.
    pub fn load(store: &SqliteStore, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        let history = store.load_chat_history(&scope).into_inner();
        let conversation_id = store.load_conversation_id(&scope).into_inner();
        Self {
            store: store.clone(),
            scope,
            history,
            conversation_id,
        }
    }

    pub fn unsaved(store: &SqliteStore) -> Self {
        Self::load(store, UNSAVED_SCOPE)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Empty until the service has issued one.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Runs one chat turn about `json_content`.
    ///
    /// Blank input is ignored and returns `Ok(None)`. On failure the error
    /// reply is appended to the history before the error is returned; the
    /// history is saved in both cases.
    pub async fn send<B, O>(
        &mut self,
        backend: &B,
        json_content: &str,
        text: &str,
        observer: &mut O,
    ) -> Result<Option<ChatReply>, AssistantError>
    where
        B: ChatBackend + ?Sized,
        O: StreamObserver + Send + ?Sized,
    {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        self.history.push(ChatMessage::user(text));

        let request = ChatRequest {
            json_content: json_content.to_string(),
            query: text.to_string(),
            conversation_id: self.conversation_id.clone(),
        };
        let mut persisting = PersistConversation {
            store: &self.store,
            scope: &self.scope,
            captured: None,
            inner: observer,
        };
        let result = backend.send(&request, &mut persisting).await;
        if let Some(id) = persisting.captured {
            self.conversation_id = id;
        }

        match result {
            Ok(reply) => {
                if !reply.answer.is_empty() {
                    let id = Some(reply.message_id.clone()).filter(|id| !id.is_empty());
                    self.history
                        .push(ChatMessage::assistant(reply.answer.clone(), id));
                }
                self.save_history()?;
                Ok(Some(reply))
            }
            Err(err) => {
                warn!(scope = %self.scope, error = %err, "chat turn failed");
                self.history
                    .push(ChatMessage::assistant(CHAT_ERROR_MESSAGE, None));
                if let Err(store_err) = self.save_history() {
                    warn!(scope = %self.scope, error = %store_err, "could not save chat history");
                }
                Err(err.into())
            }
        }
    }

    /// Forgets the history and conversation id, in memory and in the store.
    pub fn clear(&mut self) -> Result<(), AssistantError> {
        self.store.clear_chat_data(&self.scope)?;
        self.history.clear();
        self.conversation_id.clear();
        Ok(())
    }

    fn save_history(&self) -> Result<(), StoreError> {
        self.store.save_chat_history(&self.scope, &self.history)
    }
}

/// Saves the first snippet of a fresh document and moves the chat held under
/// the unsaved scope over to it.
pub fn adopt_unsaved(store: &SqliteStore, draft: SnippetDraft) -> Result<Snippet, AssistantError> {
    let snippet = store.create_snippet(draft)?;
    let moved = store.transfer_chat_scope(UNSAVED_SCOPE, &snippet.id)?;
    info!(snippet_id = %snippet.id, messages = moved, "adopted unsaved chat");
    Ok(snippet)
}

/// Writes each conversation id to the store as soon as it is issued, so an
/// interrupted stream still continues the same conversation next time.
struct PersistConversation<'a, O: ?Sized> {
    store: &'a SqliteStore,
    scope: &'a str,
    captured: Option<String>,
    inner: &'a mut O,
}

impl<O: StreamObserver + ?Sized> StreamObserver for PersistConversation<'_, O> {
    fn on_answer(&mut self, answer: &str) {
        self.inner.on_answer(answer);
    }

    fn on_conversation_id(&mut self, conversation_id: &str) {
        if let Err(err) = self.store.save_conversation_id(self.scope, conversation_id) {
            warn!(scope = self.scope, error = %err, "could not save conversation id");
        }
        self.captured = Some(conversation_id.to_string());
        self.inner.on_conversation_id(conversation_id);
    }
}
