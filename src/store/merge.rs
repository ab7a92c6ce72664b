use super::{ ChatState, ChatStore };
use crate::models::websocket::{ PushEnvelope, PushEvent };
use log::{ debug, warn };

impl ChatState {
    /// Folds one server event into the state. Every branch merges by id, so
    /// a repeated event or one that echoes a local write changes nothing
    /// beyond what the first delivery did.
    pub fn apply_push_event(&mut self, event: PushEvent) {
        match event {
            PushEvent::ConversationCreated(conversation) => {
                self.upsert_conversation(conversation);
            }
            PushEvent::MessageCreated(message) => {
                let conversation_id = message.conversation_id;
                self.upsert_message(conversation_id, message);
            }
            PushEvent::ConversationDeleted { id } => {
                if !self.remove_conversation(id) {
                    debug!("Conversation {} already gone", id);
                }
            }
            PushEvent::ConversationUpdated(patch) => {
                self.update_conversation(patch);
            }
            PushEvent::MessageUpdated(patch) => {
                self.update_message(patch);
            }
            PushEvent::MessageDeleted { id, conversation_id } => {
                if !self.remove_message(conversation_id, id) {
                    debug!("Message {} in conversation {} already gone", id, conversation_id);
                }
            }
            PushEvent::ClientConnected { .. } | PushEvent::Unknown(_) => {}
        }
    }
}

impl ChatStore {
    pub fn apply_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::ClientConnected { client_id } => {
                debug!("Push channel assigned client id {}", client_id);
            }
            PushEvent::Unknown(kind) => {
                warn!("Ignoring push event of unknown type '{}'", kind);
            }
            event => self.mutate(|s| s.apply_push_event(event)),
        }
    }

    /// Decodes and applies a raw frame. Malformed payloads are logged and
    /// dropped; the state is left untouched.
    pub fn apply_push_envelope(&self, envelope: &PushEnvelope) {
        match PushEvent::from_envelope(envelope) {
            Ok(event) => self.apply_push_event(event),
            Err(e) => warn!("Dropping push frame: {}", e),
        }
    }
}
