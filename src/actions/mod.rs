//! Remote actions: every user-initiated operation that talks to the API and
//! folds the answer (including streamed replies) into the store.

use crate::api::{ ChatApi, ChunkStream };
use crate::config::ClientConfig;
use crate::error::{ ChatError, Result };
use crate::models::chat::{ ConversationId, Message, MessageId, Role };
use crate::store::selectors::effective_model;
use crate::store::ChatStore;
use futures::StreamExt;
use log::{ debug, error, info, warn };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex };
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Completed,
    Cancelled,
}

/// Outcome of pumping one reply: how many chunks landed, and how it ended.
struct Pumped {
    applied: usize,
    end: Result<StreamEnd>,
}

/// Releases the single-send gate when the send finishes, however it ends.
struct SendGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct ChatActions {
    store: ChatStore,
    api: Arc<dyn ChatApi>,
    reconcile_ids: bool,
    in_flight: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ChatActions {
    pub fn new(store: ChatStore, api: Arc<dyn ChatApi>, config: &ClientConfig) -> Self {
        Self {
            store,
            api,
            reconcile_ids: config.reconcile_ids,
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    fn fail(&self, err: ChatError) -> ChatError {
        error!("Chat action failed: {}", err);
        self.store.set_error(Some(err.to_string()));
        err
    }

    fn acquire_send(&self) -> Result<SendGuard<'_>> {
        if self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(self.fail(ChatError::SendInFlight));
        }
        Ok(SendGuard { flag: &self.in_flight })
    }

    fn cancel_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel_slot() = Some(token.clone());
        token
    }

    fn disarm_cancel(&self) {
        self.cancel_slot().take();
    }

    /// Stops applying chunks of the reply in flight. Content already applied
    /// stays and no error is recorded. Returns `false` when nothing streams.
    pub fn cancel_streaming(&self) -> bool {
        let Some(token) = self.cancel_slot().take() else {
            return false;
        };
        token.cancel();
        self.store.mutate(|s| s.finish_request());
        info!("Streaming cancelled");
        true
    }

    async fn pump(
        &self,
        conversation_id: ConversationId,
        target: MessageId,
        mut chunks: ChunkStream,
        cancel: &CancellationToken
    ) -> Pumped {
        let mut applied = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Pumped { applied, end: Ok(StreamEnd::Cancelled) };
                }
                next = chunks.next() => match next {
                    Some(Ok(chunk)) => {
                        debug!("Chunk of {} bytes for message {}", chunk.len(), target);
                        self.store.append_to_message_content(conversation_id, target, &chunk);
                        applied += 1;
                    }
                    Some(Err(e)) => {
                        return Pumped { applied, end: Err(e) };
                    }
                    None => {
                        return Pumped { applied, end: Ok(StreamEnd::Completed) };
                    }
                }
            }
        }
    }

    /// Creates a conversation from its first message and streams the reply.
    pub async fn create_direct_message(
        &self,
        token: &str,
        content: &str,
        base_model: &str,
        online_enabled: bool
    ) -> Result<ConversationId> {
        let _guard = self.acquire_send()?;
        let model = effective_model(base_model, online_enabled);
        self.store.mutate(|s| {
            s.clear_error();
            s.set_loading(true);
        });

        let conversation = match self.api.create_direct_message(token, content, &model).await {
            Ok(conversation) => conversation,
            Err(e) => {
                self.store.mutate(|s| s.finish_request());
                return Err(self.fail(e));
            }
        };
        let id = conversation.id;
        let placeholder = Message::placeholder(self.store.next_local_id(), id, &model);
        let placeholder_id = placeholder.id;
        info!("Created conversation {} with model {}", id, model);

        self.store.mutate(|s| {
            let mut conversation = conversation;
            // a create response may carry the first message only as its summary
            let mut messages = match conversation.messages.take() {
                Some(messages) => messages,
                None => conversation.last_message.clone().into_iter().collect(),
            };
            messages.push(placeholder);
            conversation.messages = Some(messages);
            s.upsert_conversation(conversation);
            s.set_active_conversation(Some(id));
            s.begin_streaming(id, placeholder_id);
        });

        let cancel = self.arm_cancel();
        let pumped = match self.api.stream_response(token, id, &model).await {
            Ok(chunks) => self.pump(id, placeholder_id, chunks, &cancel).await,
            Err(e) => Pumped { applied: 0, end: Err(e) },
        };
        self.disarm_cancel();

        match pumped.end {
            Ok(end) => {
                self.store.mutate(|s| s.finish_request());
                if end == StreamEnd::Completed {
                    self.reconcile(token, id, &[placeholder_id]).await;
                }
                Ok(id)
            }
            Err(e) => {
                self.store.mutate(|s| {
                    if pumped.applied == 0 {
                        s.remove_message(id, placeholder_id);
                    }
                    s.finish_request();
                });
                Err(self.fail(e))
            }
        }
    }

    /// Sends into an existing conversation. The user message and an empty
    /// assistant placeholder appear before the request is made and are
    /// rolled back if it fails before any reply text arrives.
    pub async fn send_message(
        &self,
        token: &str,
        conversation_id: ConversationId,
        content: &str,
        base_model: &str,
        online_enabled: bool
    ) -> Result<()> {
        let _guard = self.acquire_send()?;
        if !self.store.has_conversation(conversation_id) {
            return Err(self.fail(ChatError::ConversationNotFound(conversation_id)));
        }
        let model = effective_model(base_model, online_enabled);
        let user = Message::new(self.store.next_local_id(), conversation_id, Role::User, content, None);
        let placeholder = Message::placeholder(self.store.next_local_id(), conversation_id, &model);
        let (user_id, placeholder_id) = (user.id, placeholder.id);

        let mark = self.store.mutate(|s| {
            let mark = s.summary_mark(conversation_id);
            s.clear_error();
            s.set_loading(true);
            s.upsert_message(conversation_id, user);
            s.upsert_message(conversation_id, placeholder);
            s.begin_streaming(conversation_id, placeholder_id);
            mark
        });

        let cancel = self.arm_cancel();
        let pumped = match self.api.send_message(token, conversation_id, content, &model).await {
            Ok(chunks) => self.pump(conversation_id, placeholder_id, chunks, &cancel).await,
            Err(e) => Pumped { applied: 0, end: Err(e) },
        };
        self.disarm_cancel();

        match pumped.end {
            Ok(end) => {
                self.store.mutate(|s| s.finish_request());
                if end == StreamEnd::Completed {
                    self.reconcile(token, conversation_id, &[user_id, placeholder_id]).await;
                }
                Ok(())
            }
            Err(e) => {
                self.store.mutate(|s| {
                    if pumped.applied == 0 {
                        warn!("Rolling back unsent message in conversation {}", conversation_id);
                        if let Some(mark) = &mark {
                            s.roll_back(conversation_id, &[placeholder_id, user_id], mark);
                        }
                    }
                    s.finish_request();
                });
                Err(self.fail(e))
            }
        }
    }

    /// Fetches the conversation after a finished reply and swaps each local
    /// id for the id of the server message with the same role and content.
    async fn reconcile(&self, token: &str, conversation_id: ConversationId, locals: &[MessageId]) {
        if !self.reconcile_ids {
            return;
        }
        let server = match self.api.get_conversation(token, conversation_id).await {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!("Could not reconcile ids for conversation {}: {}", conversation_id, e);
                return;
            }
        };
        let server_messages = server.messages.clone().unwrap_or_default();
        self.store.mutate(|s| {
            for local in locals {
                let Some(pending) = s
                    .conversation(conversation_id)
                    .and_then(|c| c.find_message(*local))
                    .cloned() else {
                    continue;
                };
                let matched = server_messages
                    .iter()
                    .rev()
                    .find(|m| m.role == pending.role && m.content == pending.content);
                match matched {
                    Some(found) => {
                        s.reconcile_message_id(conversation_id, *local, found.clone());
                    }
                    None => debug!("No server copy of message {} yet", local),
                }
            }
            s.merge_loaded_conversation(server);
        });
    }

    pub async fn create_conversation(&self, token: &str, title: &str) -> Result<ConversationId> {
        match self.api.create_conversation(token, title).await {
            Ok(conversation) => {
                let id = conversation.id;
                self.store.mutate(|s| {
                    s.upsert_conversation(conversation);
                    s.set_active_conversation(Some(id));
                });
                Ok(id)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Replaces the list. A failed fetch keeps the previous list.
    pub async fn load_conversations(&self, token: &str) -> Result<()> {
        if token.is_empty() {
            debug!("No token, skipping conversation list");
            return Ok(());
        }
        self.store.mutate(|s| {
            s.clear_error();
            s.set_loading(true);
        });
        match self.api.list_conversations(token).await {
            Ok(conversations) => {
                info!("Loaded {} conversations", conversations.len());
                self.store.mutate(|s| {
                    s.set_conversations(conversations);
                    s.set_loading(false);
                });
                Ok(())
            }
            Err(e) => {
                self.store.set_loading(false);
                Err(self.fail(e))
            }
        }
    }

    pub async fn load_messages(&self, token: &str, conversation_id: ConversationId) -> Result<()> {
        match self.api.get_conversation(token, conversation_id).await {
            Ok(conversation) => {
                self.store.mutate(|s| s.merge_loaded_conversation(conversation));
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub async fn delete_conversation(&self, token: &str, conversation_id: ConversationId) -> Result<()> {
        if let Err(e) = self.api.delete_conversation(token, conversation_id).await {
            return Err(self.fail(e));
        }
        let next_active = self.store.mutate(|s| {
            let was_active = s.active_conversation_id() == Some(conversation_id);
            s.remove_conversation(conversation_id);
            if was_active { s.active_conversation_id() } else { None }
        });
        info!("Deleted conversation {}", conversation_id);
        if let Some(next) = next_active {
            if let Err(e) = self.load_messages(token, next).await {
                warn!("Could not load messages of conversation {}: {}", next, e);
            }
        }
        Ok(())
    }

    /// `None` clears the selection; an id selects it and loads its messages.
    pub async fn set_active_conversation(
        &self,
        token: &str,
        conversation_id: Option<ConversationId>
    ) -> Result<()> {
        self.store.set_active_conversation(conversation_id);
        if let Some(id) = conversation_id {
            self.load_messages(token, id).await?;
        }
        Ok(())
    }
}
