//! Read-only views over the store.
//!
//! The derived views are cached against the revisions of the fields they read,
//! so asking twice without a relevant change hands back the same `Arc`.

use super::{ ChatState, ChatStore };
use crate::models::chat::{ Conversation, ConversationId };
use std::sync::{ Arc, Mutex };

pub const ONLINE_SUFFIX: &str = ":online";

/// Single-slot cache keyed by whatever the view depends on.
pub(crate) struct Memo<K, V> {
    slot: Mutex<Option<(K, V)>>,
}

impl<K, V> Default for Memo<K, V> {
    fn default() -> Self {
        Self { slot: Mutex::new(None) }
    }
}

impl<K: PartialEq, V: Clone> Memo<K, V> {
    pub fn get_or_compute(&self, key: K, compute: impl FnOnce() -> V) -> V {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((cached_key, value)) = slot.as_ref() {
            if *cached_key == key {
                return value.clone();
            }
        }
        let value = compute();
        *slot = Some((key, value.clone()));
        value
    }
}

#[derive(Default)]
pub(crate) struct Memos {
    active: Memo<(u64, u64), Option<Arc<Conversation>>>,
    filtered: Memo<(u64, u64), Arc<Vec<Conversation>>>,
    model: Memo<u64, Arc<str>>,
}

/// `base` with the online suffix when web access is on.
pub fn effective_model(base: &str, online: bool) -> String {
    if online { format!("{}{}", base, ONLINE_SUFFIX) } else { base.to_string() }
}

/// Case-insensitive match of the trimmed term against the title or the last
/// message's content. A blank term keeps everything.
pub fn filter_conversations(conversations: &[Conversation], term: &str) -> Vec<Conversation> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return conversations.to_vec();
    }
    conversations
        .iter()
        .filter(|c| {
            c.title.to_lowercase().contains(&needle) ||
                c.last_message
                    .as_ref()
                    .map(|m| m.content.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
        .cloned()
        .collect()
}

fn find_active(state: &ChatState) -> Option<Arc<Conversation>> {
    let id = state.active_conversation_id()?;
    state.conversation(id).cloned().map(Arc::new)
}

impl ChatStore {
    pub fn active_conversation(&self) -> Option<Arc<Conversation>> {
        self.read(|state| {
            let revs = state.revisions();
            self.inner.memos.active.get_or_compute((revs.conversations, revs.active), || {
                find_active(state)
            })
        })
    }

    pub fn filtered_conversations(&self) -> Arc<Vec<Conversation>> {
        self.read(|state| {
            let revs = state.revisions();
            self.inner.memos.filtered.get_or_compute((revs.conversations, revs.search), || {
                Arc::new(filter_conversations(state.conversations(), state.search_term()))
            })
        })
    }

    /// Model id sent with requests.
    pub fn effective_model(&self) -> Arc<str> {
        self.read(|state| {
            self.inner.memos.model.get_or_compute(state.revisions().model, || {
                Arc::from(effective_model(state.selected_base_model(), state.is_online_enabled()))
            })
        })
    }

    pub fn search_term(&self) -> String {
        self.read(|s| s.search_term().to_string())
    }

    pub fn selected_base_model(&self) -> String {
        self.read(|s| s.selected_base_model().to_string())
    }

    pub fn is_online_enabled(&self) -> bool {
        self.read(|s| s.is_online_enabled())
    }

    pub fn is_loading(&self) -> bool {
        self.read(|s| s.is_loading())
    }

    pub fn is_streaming(&self) -> bool {
        self.read(|s| s.is_streaming())
    }

    pub fn streaming_buffer(&self) -> String {
        self.read(|s| s.streaming_buffer().to_string())
    }

    pub fn last_error(&self) -> Option<String> {
        self.read(|s| s.last_error().map(str::to_string))
    }

    pub fn has_conversation(&self, id: ConversationId) -> bool {
        self.read(|s| s.conversation(id).is_some())
    }
}
