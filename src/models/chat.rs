use chrono::{ DateTime, Utc };
use serde::de::{ self, Visitor };
use serde::{ Deserialize, Deserializer, Serialize, Serializer };
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{ AtomicU64, Ordering };

pub type ConversationId = i64;

const LOCAL_PREFIX: &str = "local-";

/// Identity of a message.
///
/// Server ids are the integers the API hands out. Messages created on this
/// client before the server confirms them carry a `Local` id, which lives in
/// its own namespace and serializes as `"local-<n>"` so it can never be
/// mistaken for a server id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    Server(i64),
    Local(u64),
}

impl MessageId {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Local(id) => write!(f, "{}{}", LOCAL_PREFIX, id),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseMessageIdError {
    input: String,
}

impl fmt::Display for ParseMessageIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message id: '{}'", self.input)
    }
}

impl std::error::Error for ParseMessageIdError {}

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMessageIdError { input: s.to_string() };
        match s.strip_prefix(LOCAL_PREFIX) {
            Some(n) => n.parse().map(MessageId::Local).map_err(|_| err()),
            None => s.parse().map(MessageId::Server).map_err(|_| err()),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageId::Server(id) => serializer.serialize_i64(*id),
            MessageId::Local(_) => serializer.collect_str(self),
        }
    }
}

struct MessageIdVisitor;

impl<'de> Visitor<'de> for MessageIdVisitor {
    type Value = MessageId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer message id or a \"local-<n>\" string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<MessageId, E> {
        Ok(MessageId::Server(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<MessageId, E> {
        i64::try_from(v)
            .map(MessageId::Server)
            .map_err(|_| E::custom(format!("message id {} out of range", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MessageId, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MessageIdVisitor)
    }
}

/// Hands out strictly increasing local ids: clock milliseconds shifted left
/// with a sequence in the low bits, so ids issued in the same millisecond
/// still differ.
#[derive(Debug, Default)]
pub struct LocalIdGenerator {
    last: AtomicU64,
}

impl LocalIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> MessageId {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let candidate = millis << 10;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(prev + 1);
            match
                self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return MessageId::Local(next);
                }
                Err(actual) => {
                    prev = actual;
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "chat_id")]
    pub conversation_id: ConversationId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        role: Role,
        content: impl Into<String>,
        model: Option<String>
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation_id,
            role,
            content: content.into(),
            model,
            tokens_used: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Empty assistant message that streamed chunks get appended to.
    pub fn placeholder(id: MessageId, conversation_id: ConversationId, model: &str) -> Self {
        Self::new(id, conversation_id, Role::Assistant, "", Some(model.to_string()))
    }

    /// Shallow merge: every field the patch carries overwrites ours.
    pub fn apply(&mut self, patch: &MessagePatch) {
        self.id = patch.id;
        self.conversation_id = patch.conversation_id;
        if let Some(role) = patch.role {
            self.role = role;
        }
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if patch.model.is_some() {
            self.model = patch.model.clone();
        }
        if patch.tokens_used.is_some() {
            self.tokens_used = patch.tokens_used;
        }
        if let Some(created_at) = patch.created_at {
            self.created_at = created_at;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

/// Partial message as carried by `message_updated` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: MessageId,
    #[serde(rename = "chat_id")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<Message> for MessagePatch {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            role: Some(m.role),
            content: Some(m.content),
            model: m.model,
            tokens_used: m.tokens_used,
            created_at: Some(m.created_at),
            updated_at: Some(m.updated_at),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// `None` until the conversation has been opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

impl Conversation {
    pub fn message_count(&self) -> u32 {
        self.message_count.unwrap_or(0)
    }

    pub fn find_message(&self, id: MessageId) -> Option<&Message> {
        self.messages.as_ref().and_then(|msgs| msgs.iter().find(|m| m.id == id))
    }

    /// Shallow merge of the scalar fields. Nested messages are merged by the
    /// store so that ids can be matched.
    pub fn apply(&mut self, patch: &ConversationPatch) {
        if let Some(user_id) = patch.user_id {
            self.user_id = user_id;
        }
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(is_active) = patch.is_active {
            self.is_active = is_active;
        }
        if let Some(created_at) = patch.created_at {
            self.created_at = created_at;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
        if patch.message_count.is_some() {
            self.message_count = patch.message_count;
        }
        if patch.last_message.is_some() {
            self.last_message = patch.last_message.clone();
        }
    }
}

/// Partial conversation as carried by `conversation_updated` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationPatch {
    pub id: ConversationId,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: Option<u32>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
}

impl From<Conversation> for ConversationPatch {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id,
            user_id: Some(c.user_id),
            title: Some(c.title),
            is_active: Some(c.is_active),
            created_at: Some(c.created_at),
            updated_at: Some(c.updated_at),
            message_count: c.message_count,
            last_message: c.last_message,
            messages: c.messages,
        }
    }
}
