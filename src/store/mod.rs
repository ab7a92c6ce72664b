//! Conversation store: the single owner of conversation and message data.
//!
//! `ChatState` holds the data and implements every mutation as a plain
//! `&mut self` method. `ChatStore` is the shared handle: it applies each
//! mutation under one write lock and then bumps the revision published on its
//! change bus, so a reader never sees half of a multi-field update.

mod merge;
pub mod selectors;

use crate::models::chat::{
    Conversation,
    ConversationId,
    ConversationPatch,
    LocalIdGenerator,
    Message,
    MessageId,
    MessagePatch,
};
use log::{ debug, warn };
use std::sync::{ Arc, RwLock, RwLockReadGuard, RwLockWriteGuard };
use tokio::sync::watch;

use self::selectors::Memos;

pub const DEFAULT_BASE_MODEL: &str = "google/gemini-2.0-flash-lite-001";

/// Per-domain change counters. Selectors key their caches on these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Revisions {
    pub conversations: u64,
    pub active: u64,
    pub search: u64,
    pub model: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// A pending local message was matched and took over the server id.
    Adopted {
        local: MessageId,
    },
}

/// Summary fields of a conversation before an optimistic write.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryMark {
    loaded: bool,
    last_message: Option<Message>,
    message_count: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ChatState {
    conversations: Vec<Conversation>,
    active_conversation_id: Option<ConversationId>,
    search_term: String,
    selected_base_model: String,
    default_model: String,
    is_online_enabled: bool,
    is_loading: bool,
    is_streaming: bool,
    streaming_buffer: String,
    streaming_target: Option<(ConversationId, MessageId)>,
    last_error: Option<String>,
    revs: Revisions,
}

impl ChatState {
    pub fn new(default_model: impl Into<String>) -> Self {
        let default_model = default_model.into();
        Self {
            conversations: Vec::new(),
            active_conversation_id: None,
            search_term: String::new(),
            selected_base_model: default_model.clone(),
            default_model,
            is_online_enabled: false,
            is_loading: false,
            is_streaming: false,
            streaming_buffer: String::new(),
            streaming_target: None,
            last_error: None,
            revs: Revisions::default(),
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.active_conversation_id
    }

    pub fn search_term(&self) -> &str {
        &self.search_term
    }

    pub fn selected_base_model(&self) -> &str {
        &self.selected_base_model
    }

    pub fn is_online_enabled(&self) -> bool {
        self.is_online_enabled
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn streaming_buffer(&self) -> &str {
        &self.streaming_buffer
    }

    pub fn streaming_target(&self) -> Option<(ConversationId, MessageId)> {
        self.streaming_target
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn revisions(&self) -> Revisions {
        self.revs
    }

    fn conversation_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn touch_conversations(&mut self) {
        self.revs.conversations += 1;
    }

    fn touch_active(&mut self) {
        self.revs.active += 1;
    }

    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        if self.is_streaming {
            warn!("Replacing the conversation list while a response is streaming");
        }
        self.conversations = conversations;
        self.touch_conversations();
    }

    /// Prepends an unknown conversation; otherwise merges fields and nested
    /// messages into the existing entry. Returns `true` when inserted.
    pub fn upsert_conversation(&mut self, conversation: Conversation) -> bool {
        let protected = self.protected_message();
        let inserted = match self.conversation_mut(conversation.id) {
            Some(existing) => {
                let patch = ConversationPatch::from(conversation);
                merge_conversation(existing, patch, protected);
                false
            }
            None => {
                let mut conversation = conversation;
                sync_summary(&mut conversation);
                self.conversations.insert(0, conversation);
                true
            }
        };
        self.touch_conversations();
        inserted
    }

    /// Merges a partial conversation into an existing entry only.
    pub fn update_conversation(&mut self, patch: ConversationPatch) -> bool {
        let protected = self.protected_message();
        let Some(existing) = self.conversation_mut(patch.id) else {
            debug!("Ignoring update for unknown conversation {}", patch.id);
            return false;
        };
        merge_conversation(existing, patch, protected);
        self.touch_conversations();
        true
    }

    /// Installs a conversation fetched together with its full message list.
    /// The server list replaces ours in server order. Local messages that
    /// are still waiting for a server copy follow it, in their own order.
    pub fn merge_loaded_conversation(&mut self, mut conversation: Conversation) {
        let id = conversation.id;
        let protected = self.protected_message();
        let mut messages = conversation.messages.take().unwrap_or_default();
        match self.conversation_mut(id) {
            Some(existing) => {
                let pending = pending_locals(existing, &messages, protected);
                messages.extend(pending);
                existing.apply(&ConversationPatch::from(conversation));
            }
            None => self.conversations.insert(0, conversation),
        }
        if let Some(conv) = self.conversation_mut(id) {
            conv.message_count = Some(messages.len() as u32);
            conv.last_message = messages.last().cloned();
            conv.messages = Some(messages);
        }
        self.touch_conversations();
    }

    pub fn append_message(&mut self, conversation_id: ConversationId, message: Message) -> bool {
        let Some(conv) = self.conversation_mut(conversation_id) else {
            warn!(
                "Dropping message {} for unknown conversation {}",
                message.id,
                conversation_id
            );
            return false;
        };
        conv.last_message = Some(message.clone());
        conv.messages.get_or_insert_with(Vec::new).push(message);
        conv.message_count = Some(conv.message_count() + 1);
        self.touch_conversations();
        true
    }

    /// Merge-by-id. `None` when the conversation is unknown.
    pub fn upsert_message(
        &mut self,
        conversation_id: ConversationId,
        message: Message
    ) -> Option<MergeOutcome> {
        let protected = self.protected_message();
        let Some(conv) = self.conversation_mut(conversation_id) else {
            debug!(
                "Ignoring message {} for unknown conversation {}",
                message.id,
                conversation_id
            );
            return None;
        };
        let outcome = merge_message(conv, message, protected);
        self.touch_conversations();
        Some(outcome)
    }

    /// Merges into a message that already exists; never inserts.
    pub fn update_message(&mut self, patch: MessagePatch) -> bool {
        let Some(conv) = self.conversation_mut(patch.conversation_id) else {
            return false;
        };
        let Some(existing) = conv.messages
            .as_mut()
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == patch.id)) else {
            debug!("Ignoring update for unknown message {}", patch.id);
            return false;
        };
        existing.apply(&patch);
        let merged = existing.clone();
        if conv.last_message.as_ref().map(|m| m.id) == Some(merged.id) {
            conv.last_message = Some(merged);
        }
        self.touch_conversations();
        true
    }

    pub fn append_to_message_content(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
        chunk: &str
    ) -> bool {
        self.streaming_buffer.push_str(chunk);
        let found = match self.conversation_mut(conversation_id) {
            Some(conv) => {
                let target = conv.messages
                    .as_mut()
                    .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message_id));
                match target {
                    Some(message) => {
                        message.content.push_str(chunk);
                        if let Some(last) = conv.last_message.as_mut() {
                            if last.id == message_id {
                                last.content.push_str(chunk);
                            }
                        }
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };
        if !found {
            debug!(
                "Chunk for missing message {} in conversation {} kept in buffer only",
                message_id,
                conversation_id
            );
        }
        self.touch_conversations();
        found
    }

    pub fn remove_message(&mut self, conversation_id: ConversationId, message_id: MessageId) -> bool {
        let Some(conv) = self.conversation_mut(conversation_id) else {
            return false;
        };
        let Some(msgs) = conv.messages.as_mut() else {
            return false;
        };
        let Some(pos) = msgs.iter().position(|m| m.id == message_id) else {
            return false;
        };
        msgs.remove(pos);
        let tail = msgs.last().cloned();
        conv.message_count = Some(conv.message_count().saturating_sub(1));
        if conv.last_message.as_ref().map(|m| m.id) == Some(message_id) {
            conv.last_message = tail;
        }
        self.touch_conversations();
        true
    }

    /// Records what a rollback of messages added from now on has to restore.
    pub fn summary_mark(&self, conversation_id: ConversationId) -> Option<SummaryMark> {
        self.conversation(conversation_id).map(|conv| SummaryMark {
            loaded: conv.messages.is_some(),
            last_message: conv.last_message.clone(),
            message_count: conv.message_count,
        })
    }

    /// Removes `message_ids` and puts back the summary taken by
    /// `summary_mark`. A list that only existed for those messages is
    /// dropped again, so the conversation reads as not loaded.
    pub fn roll_back(
        &mut self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
        mark: &SummaryMark
    ) {
        for id in message_ids {
            self.remove_message(conversation_id, *id);
        }
        let Some(conv) = self.conversation_mut(conversation_id) else {
            return;
        };
        let emptied = conv.messages.as_ref().is_some_and(|msgs| msgs.is_empty());
        if !mark.loaded && emptied {
            conv.messages = None;
            conv.last_message = mark.last_message.clone();
            conv.message_count = mark.message_count;
            self.touch_conversations();
        }
    }

    /// Drops the conversation. If it was active, the first remaining
    /// conversation becomes active (or none).
    pub fn remove_conversation(&mut self, conversation_id: ConversationId) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != conversation_id);
        if self.conversations.len() == before {
            return false;
        }
        if self.active_conversation_id == Some(conversation_id) {
            self.active_conversation_id = self.conversations.first().map(|c| c.id);
            self.touch_active();
        }
        if matches!(self.streaming_target, Some((conv, _)) if conv == conversation_id) {
            self.streaming_target = None;
        }
        self.touch_conversations();
        true
    }

    /// Replaces a local temporary id with the id the server assigned. If the
    /// server message already arrived through another path the local copy is
    /// folded into it instead of leaving a duplicate.
    pub fn reconcile_message_id(
        &mut self,
        conversation_id: ConversationId,
        local_id: MessageId,
        server: Message
    ) -> bool {
        let Some(conv) = self.conversation_mut(conversation_id) else {
            return false;
        };
        let Some(msgs) = conv.messages.as_mut() else {
            return false;
        };
        let Some(local_pos) = msgs.iter().position(|m| m.id == local_id) else {
            return false;
        };
        let patch = MessagePatch::from(server);
        match msgs.iter().position(|m| m.id == patch.id) {
            Some(server_pos) => {
                msgs[server_pos].apply(&patch);
                msgs.remove(local_pos);
                conv.message_count = Some(conv.message_count().saturating_sub(1));
            }
            None => {
                msgs[local_pos].apply(&patch);
            }
        }
        conv.last_message = conv.messages.as_ref().and_then(|m| m.last().cloned());
        if self.streaming_target == Some((conversation_id, local_id)) {
            self.streaming_target = Some((conversation_id, patch.id));
        }
        self.touch_conversations();
        true
    }

    pub fn set_active_conversation(&mut self, id: Option<ConversationId>) {
        self.active_conversation_id = id;
        self.touch_active();
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.is_loading = loading;
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        self.is_streaming = streaming;
        if !streaming {
            self.streaming_target = None;
        }
    }

    /// Marks `message_id` as the message receiving chunks and clears the buffer.
    pub fn begin_streaming(&mut self, conversation_id: ConversationId, message_id: MessageId) {
        self.is_streaming = true;
        self.streaming_buffer.clear();
        self.streaming_target = Some((conversation_id, message_id));
    }

    /// Clears every transient flag a request sets. Message content stays.
    pub fn finish_request(&mut self) {
        self.is_loading = false;
        self.is_streaming = false;
        self.streaming_buffer.clear();
        self.streaming_target = None;
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn set_search_term(&mut self, term: impl Into<String>) {
        self.search_term = term.into();
        self.revs.search += 1;
    }

    pub fn set_selected_model(&mut self, model: impl Into<String>) {
        self.selected_base_model = model.into();
        self.revs.model += 1;
    }

    pub fn set_online_enabled(&mut self, enabled: bool) {
        self.is_online_enabled = enabled;
        self.revs.model += 1;
    }

    pub fn toggle_online_enabled(&mut self) {
        self.set_online_enabled(!self.is_online_enabled);
    }

    /// Back to a fresh state. Revisions keep counting so cached views from
    /// before the reset are never served again.
    pub fn reset(&mut self) {
        let revs = self.revs;
        *self = ChatState::new(self.default_model.clone());
        self.revs = Revisions {
            conversations: revs.conversations + 1,
            active: revs.active + 1,
            search: revs.search + 1,
            model: revs.model + 1,
        };
    }

    fn protected_message(&self) -> Option<MessageId> {
        self.streaming_target.map(|(_, id)| id)
    }
}

/// Merge one message into a conversation's list and keep `last_message` /
/// `message_count` in step.
fn merge_message(
    conv: &mut Conversation,
    message: Message,
    protected: Option<MessageId>
) -> MergeOutcome {
    let msgs = conv.messages.get_or_insert_with(Vec::new);
    let patch = MessagePatch::from(message);

    let (outcome, merged) = if let Some(existing) = msgs.iter_mut().find(|m| m.id == patch.id) {
        existing.apply(&patch);
        (MergeOutcome::Updated, existing.clone())
    } else if
        let Some(pending) = msgs
            .iter_mut()
            .find(|m| {
                !patch.id.is_local() &&
                    m.id.is_local() &&
                    Some(m.id) != protected &&
                    Some(m.role) == patch.role &&
                    Some(&m.content) == patch.content.as_ref()
            })
    {
        let local = pending.id;
        pending.apply(&patch);
        (MergeOutcome::Adopted { local }, pending.clone())
    } else {
        let message = new_message_from(patch);
        msgs.push(message.clone());
        (MergeOutcome::Inserted, message)
    };

    match outcome {
        MergeOutcome::Inserted => {
            conv.last_message = Some(merged);
            conv.message_count = Some(conv.message_count() + 1);
        }
        MergeOutcome::Updated => {
            let replace = match &conv.last_message {
                None => true,
                Some(last) => last.id == merged.id || merged.created_at > last.created_at,
            };
            if replace {
                conv.last_message = Some(merged);
            }
        }
        MergeOutcome::Adopted { local } => {
            let replace = match &conv.last_message {
                None => true,
                Some(last) => last.id == local || merged.created_at > last.created_at,
            };
            if replace {
                conv.last_message = Some(merged);
            }
        }
    }
    outcome
}

fn new_message_from(patch: MessagePatch) -> Message {
    let now = chrono::Utc::now();
    let created_at = patch.created_at.unwrap_or(now);
    Message {
        id: patch.id,
        conversation_id: patch.conversation_id,
        role: patch.role.unwrap_or(crate::models::chat::Role::Assistant),
        content: patch.content.unwrap_or_default(),
        model: patch.model,
        tokens_used: patch.tokens_used,
        created_at,
        updated_at: patch.updated_at.unwrap_or(created_at),
    }
}

fn merge_conversation(
    existing: &mut Conversation,
    mut patch: ConversationPatch,
    protected: Option<MessageId>
) {
    let incoming = patch.messages.take();
    existing.apply(&patch);
    if let Some(messages) = incoming {
        let was_loaded = existing.messages.is_some();
        let count = existing.message_count;
        for message in messages {
            merge_message(existing, message, protected);
        }
        // a reported count, or the count of a list we never held, already
        // includes the nested messages
        if patch.message_count.is_some() || !was_loaded {
            existing.message_count = count;
        }
    }
    sync_summary(existing);
}

/// Local messages of `conv` with no server copy in `loaded`. A copy has the
/// same role and content, and each server message stands for one local
/// message. The message receiving chunks is always kept.
fn pending_locals(
    conv: &Conversation,
    loaded: &[Message],
    protected: Option<MessageId>
) -> Vec<Message> {
    let Some(msgs) = conv.messages.as_ref() else {
        return Vec::new();
    };
    let mut claimed = vec![false; loaded.len()];
    let mut pending = Vec::new();
    for local in msgs.iter().filter(|m| m.id.is_local()) {
        if Some(local.id) != protected {
            let copy = loaded
                .iter()
                .enumerate()
                .find(|(i, m)| !claimed[*i] && m.role == local.role && m.content == local.content)
                .map(|(i, _)| i);
            if let Some(i) = copy {
                claimed[i] = true;
                continue;
            }
        }
        pending.push(local.clone());
    }
    pending
}

/// Once messages are loaded, `last_message` is their tail.
fn sync_summary(conv: &mut Conversation) {
    if let Some(msgs) = conv.messages.as_ref() {
        conv.last_message = msgs.last().cloned();
        let len = msgs.len() as u32;
        if conv.message_count() < len {
            conv.message_count = Some(len);
        }
    }
}

struct Inner {
    state: RwLock<ChatState>,
    changes: watch::Sender<u64>,
    ids: LocalIdGenerator,
    memos: Memos,
}

/// Cloneable handle to one store instance.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Inner>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_MODEL)
    }
}

impl ChatStore {
    pub fn new(default_model: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(ChatState::new(default_model)),
                changes,
                ids: LocalIdGenerator::new(),
                memos: Memos::default(),
            }),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, ChatState> {
        self.inner.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, ChatState> {
        self.inner.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receiver of the store revision; changes after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.inner.changes.borrow()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&*self.read_guard())
    }

    pub fn snapshot(&self) -> ChatState {
        self.read_guard().clone()
    }

    /// Applies `f` as one atomic update, then notifies subscribers.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        let result = {
            let mut state = self.write_guard();
            f(&mut *state)
        };
        self.inner.changes.send_modify(|rev| {
            *rev += 1;
        });
        result
    }

    pub fn next_local_id(&self) -> MessageId {
        self.inner.ids.next_id()
    }

    pub fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.read(|s| s.conversation(id).cloned())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.read(|s| s.conversations().to_vec())
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.read(|s| s.active_conversation_id())
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.mutate(|s| s.set_conversations(conversations))
    }

    pub fn upsert_conversation(&self, conversation: Conversation) -> bool {
        self.mutate(|s| s.upsert_conversation(conversation))
    }

    pub fn append_message(&self, conversation_id: ConversationId, message: Message) -> bool {
        self.mutate(|s| s.append_message(conversation_id, message))
    }

    pub fn upsert_message(
        &self,
        conversation_id: ConversationId,
        message: Message
    ) -> Option<MergeOutcome> {
        self.mutate(|s| s.upsert_message(conversation_id, message))
    }

    pub fn append_to_message_content(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        chunk: &str
    ) -> bool {
        self.mutate(|s| s.append_to_message_content(conversation_id, message_id, chunk))
    }

    pub fn remove_message(&self, conversation_id: ConversationId, message_id: MessageId) -> bool {
        self.mutate(|s| s.remove_message(conversation_id, message_id))
    }

    pub fn remove_conversation(&self, conversation_id: ConversationId) -> bool {
        self.mutate(|s| s.remove_conversation(conversation_id))
    }

    pub fn set_active_conversation(&self, id: Option<ConversationId>) {
        self.mutate(|s| s.set_active_conversation(id))
    }

    pub fn set_loading(&self, loading: bool) {
        self.mutate(|s| s.set_loading(loading))
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.mutate(|s| s.set_streaming(streaming))
    }

    pub fn set_error(&self, error: Option<String>) {
        self.mutate(|s| s.set_error(error))
    }

    pub fn clear_error(&self) {
        self.mutate(|s| s.clear_error())
    }

    pub fn set_search_term(&self, term: impl Into<String>) {
        let term = term.into();
        self.mutate(|s| s.set_search_term(term))
    }

    pub fn set_selected_model(&self, model: impl Into<String>) {
        let model = model.into();
        self.mutate(|s| s.set_selected_model(model))
    }

    pub fn set_online_enabled(&self, enabled: bool) {
        self.mutate(|s| s.set_online_enabled(enabled))
    }

    pub fn toggle_online_enabled(&self) {
        self.mutate(|s| s.toggle_online_enabled())
    }

    pub fn reset(&self) {
        self.mutate(|s| s.reset())
    }
}
