use crate::error::{ ChatError, Result };
use crate::models::chat::{
    Conversation,
    ConversationId,
    ConversationPatch,
    Message,
    MessageId,
    MessagePatch,
};
use serde::{ Deserialize, Serialize };
use serde_json::Value;

pub const CLIENT_CONNECTED: &str = "client_connected";
pub const CLIENT_CONNECT: &str = "client_connect";

/// Frame shape in both directions. Incoming frames only carry `client_id`
/// during the handshake; outgoing frames always tag it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl PushEnvelope {
    pub fn new(kind: impl Into<String>, data: Value, client_id: Option<String>) -> Self {
        Self { kind: kind.into(), data, client_id }
    }
}

#[derive(Deserialize)]
struct ClientConnectedData {
    client_id: String,
}

#[derive(Deserialize)]
struct DeletedConversation {
    id: ConversationId,
}

#[derive(Deserialize)]
struct DeletedMessage {
    id: MessageId,
    #[serde(rename = "chat_id")]
    conversation_id: ConversationId,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    ClientConnected {
        client_id: String,
    },
    ConversationCreated(Conversation),
    MessageCreated(Message),
    ConversationDeleted {
        id: ConversationId,
    },
    ConversationUpdated(ConversationPatch),
    MessageUpdated(MessagePatch),
    MessageDeleted {
        id: MessageId,
        conversation_id: ConversationId,
    },
    Unknown(String),
}

impl PushEvent {
    /// Types the server used before the `conversation_*` naming are accepted
    /// as aliases.
    pub fn from_envelope(envelope: &PushEnvelope) -> Result<Self> {
        let kind = envelope.kind.as_str();
        let data = &envelope.data;
        let event = match kind {
            CLIENT_CONNECTED => {
                let client_id = match envelope.client_id.clone() {
                    Some(id) if data.get("client_id").is_none() => id,
                    _ => decode::<ClientConnectedData>(kind, data)?.client_id,
                };
                PushEvent::ClientConnected { client_id }
            }
            "conversation_created" | "chat_created" => {
                PushEvent::ConversationCreated(decode(kind, data)?)
            }
            "message_created" | "message_added" => PushEvent::MessageCreated(decode(kind, data)?),
            "conversation_deleted" | "chat_deleted" => {
                let DeletedConversation { id } = decode(kind, data)?;
                PushEvent::ConversationDeleted { id }
            }
            "conversation_updated" | "chat_updated" => {
                PushEvent::ConversationUpdated(decode(kind, data)?)
            }
            "message_updated" => PushEvent::MessageUpdated(decode(kind, data)?),
            "message_deleted" => {
                let DeletedMessage { id, conversation_id } = decode(kind, data)?;
                PushEvent::MessageDeleted { id, conversation_id }
            }
            other => PushEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(kind: &str, data: &Value) -> Result<T> {
    T::deserialize(data).map_err(|source| ChatError::MalformedEvent {
        kind: kind.to_string(),
        source,
    })
}
