use async_trait::async_trait;
use chat_sync::api::{ ChatApi, ChunkStream };
use chat_sync::models::chat::{ Conversation, ConversationId, Message, MessageId, Role };
use chat_sync::models::websocket::PushEvent;
use chat_sync::{ ChatActions, ChatError, ChatStore, ClientConfig, Result };
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{ Arc, Mutex };
use std::time::Duration;

#[derive(Clone)]
enum Step {
    Chunk(&'static str),
    Fail(&'static str),
    Hang,
}

/// In-memory API. Each stream replays `script`; opening fails with
/// `open_error` when set.
#[derive(Default)]
struct FakeApi {
    list: Mutex<Option<Vec<Conversation>>>,
    server: Mutex<HashMap<ConversationId, Conversation>>,
    created: Mutex<Option<Conversation>>,
    script: Mutex<Vec<Step>>,
    open_error: Mutex<Option<(u16, &'static str)>>,
    delete_error: Mutex<Option<(u16, &'static str)>>,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn open(&self) -> Result<ChunkStream> {
        if let Some((status, message)) = *self.open_error.lock().unwrap() {
            return Err(ChatError::api(status, message));
        }
        let script = self.script.lock().unwrap().clone();
        let hang = script.iter().any(|s| matches!(s, Step::Hang));
        let items: Vec<Result<String>> = script
            .into_iter()
            .filter_map(|step| {
                match step {
                    Step::Chunk(text) => Some(Ok(text.to_string())),
                    Step::Fail(reason) => Some(Err(ChatError::Stream(reason.to_string()))),
                    Step::Hang => None,
                }
            })
            .collect();
        let stream = futures::stream::iter(items);
        if hang {
            Ok(Box::pin(stream.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(stream))
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self, _token: &str) -> Result<Vec<Conversation>> {
        self.record("list".into());
        self.list
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChatError::api(503, "Service Unavailable"))
    }

    async fn create_conversation(&self, _token: &str, title: &str) -> Result<Conversation> {
        self.record(format!("create:{}", title));
        Ok(conversation(30, title, None))
    }

    async fn create_direct_message(
        &self,
        _token: &str,
        content: &str,
        model: &str
    ) -> Result<Conversation> {
        self.record(format!("direct:{}:{}", content, model));
        self.created
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChatError::api(400, "content required"))
    }

    async fn get_conversation(&self, _token: &str, id: ConversationId) -> Result<Conversation> {
        self.record(format!("get:{}", id));
        self.server
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| ChatError::api(404, "chat not found"))
    }

    async fn delete_conversation(&self, _token: &str, id: ConversationId) -> Result<()> {
        self.record(format!("delete:{}", id));
        match *self.delete_error.lock().unwrap() {
            Some((status, message)) => Err(ChatError::api(status, message)),
            None => Ok(()),
        }
    }

    async fn send_message(
        &self,
        _token: &str,
        id: ConversationId,
        content: &str,
        model: &str
    ) -> Result<ChunkStream> {
        self.record(format!("send:{}:{}:{}", id, content, model));
        self.open()
    }

    async fn stream_response(
        &self,
        _token: &str,
        id: ConversationId,
        model: &str
    ) -> Result<ChunkStream> {
        self.record(format!("stream:{}:{}", id, model));
        self.open()
    }
}

fn message(id: i64, conv: ConversationId, role: Role, content: &str) -> Message {
    Message::new(MessageId::Server(id), conv, role, content, None)
}

fn conversation(id: ConversationId, title: &str, messages: Option<Vec<Message>>) -> Conversation {
    let now = Utc::now();
    Conversation {
        id,
        user_id: 1,
        title: title.to_string(),
        is_active: true,
        created_at: now,
        updated_at: now,
        message_count: messages.as_ref().map(|m| m.len() as u32),
        last_message: messages.as_ref().and_then(|m| m.last().cloned()),
        messages,
    }
}

/// As the list endpoint returns it: summary only, messages not loaded.
fn listed(id: ConversationId, title: &str) -> Conversation {
    let mut conv = conversation(id, title, None);
    conv.message_count = Some(2);
    conv.last_message = Some(message(2, id, Role::Assistant, "answer"));
    conv
}

fn ids(conv: &Conversation) -> Vec<MessageId> {
    conv.messages
        .as_ref()
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect()
}

fn history() -> Vec<Message> {
    vec![message(1, 1, Role::User, "question"), message(2, 1, Role::Assistant, "answer")]
}

fn setup(reconcile_ids: bool) -> (ChatStore, Arc<FakeApi>, Arc<ChatActions>) {
    let store = ChatStore::new("base/model");
    let api = Arc::new(FakeApi::default());
    let config = ClientConfig { reconcile_ids, ..ClientConfig::default() };
    let actions = Arc::new(ChatActions::new(store.clone(), api.clone(), &config));
    (store, api, actions)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn send_message_streams_chunks_into_placeholder() {
    let (store, api, actions) = setup(false);
    store.set_conversations(vec![conversation(1, "Trip plan", Some(history()))]);
    *api.script.lock().unwrap() = vec![Step::Chunk("Hel"), Step::Chunk("lo, "), Step::Chunk("world")];

    actions.send_message("tok", 1, "next?", "base/model", true).await.unwrap();

    let conv = store.conversation(1).unwrap();
    let messages = conv.messages.as_ref().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, Role::User);
    assert_eq!(messages[2].content, "next?");
    assert!(messages[2].id.is_local());
    assert_eq!(messages[3].content, "Hello, world");
    assert_eq!(conv.message_count, Some(4));
    assert_eq!(conv.last_message.as_ref().unwrap().content, "Hello, world");
    assert!(!store.is_streaming());
    assert!(!store.is_loading());
    assert_eq!(store.streaming_buffer(), "");
    assert_eq!(api.calls(), vec!["send:1:next?:base/model:online".to_string()]);
}

#[tokio::test]
async fn failed_send_rolls_back_both_messages() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![conversation(1, "Trip plan", Some(history()))]);
    let before = store.conversation(1).unwrap();
    *api.open_error.lock().unwrap() = Some((500, "model unavailable"));

    let err = actions.send_message("tok", 1, "next?", "base/model", false).await.unwrap_err();

    assert_eq!(err.to_string(), "model unavailable");
    let after = store.conversation(1).unwrap();
    assert_eq!(after.messages, before.messages);
    assert_eq!(after.message_count, Some(2));
    assert_eq!(after.last_message, before.last_message);
    assert_eq!(store.last_error().as_deref(), Some("model unavailable"));
    assert!(!store.is_streaming());
}

#[tokio::test]
async fn mid_stream_failure_keeps_partial_reply() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![conversation(1, "Trip plan", Some(history()))]);
    *api.script.lock().unwrap() = vec![Step::Chunk("par"), Step::Fail("connection reset")];

    let err = actions.send_message("tok", 1, "next?", "base/model", false).await.unwrap_err();

    assert!(matches!(err, ChatError::Stream(_)));
    let conv = store.conversation(1).unwrap();
    assert_eq!(conv.message_count, Some(4));
    assert_eq!(conv.last_message.unwrap().content, "par");
    assert!(store.last_error().is_some());
    assert!(!store.is_streaming());
    assert!(!api.calls().iter().any(|c| c.starts_with("get:")));
}

#[tokio::test]
async fn send_into_unknown_conversation_is_rejected() {
    let (store, _api, actions) = setup(false);
    let err = actions.send_message("tok", 8, "hi", "base/model", false).await.unwrap_err();
    assert!(matches!(err, ChatError::ConversationNotFound(8)));
    assert!(store.conversations().is_empty());
}

#[tokio::test]
async fn second_send_while_streaming_is_rejected_and_cancel_keeps_content() {
    let (store, api, actions) = setup(false);
    store.set_conversations(vec![conversation(1, "Trip plan", Some(history()))]);
    *api.script.lock().unwrap() = vec![Step::Chunk("partial"), Step::Hang];

    let first = {
        let actions = actions.clone();
        tokio::spawn(async move { actions.send_message("tok", 1, "first", "base/model", false).await })
    };
    eventually(|| store.streaming_buffer() == "partial").await;

    let err = actions.send_message("tok", 1, "second", "base/model", false).await.unwrap_err();
    assert!(matches!(err, ChatError::SendInFlight));
    assert!(store.last_error().is_some());

    assert!(actions.cancel_streaming());
    first.await.unwrap().unwrap();

    let conv = store.conversation(1).unwrap();
    assert_eq!(conv.message_count, Some(4));
    assert_eq!(conv.last_message.unwrap().content, "partial");
    assert!(!store.is_streaming());
    assert!(!actions.cancel_streaming());
}

#[tokio::test]
async fn completed_send_swaps_local_ids_for_server_ids() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![conversation(1, "Trip plan", Some(history()))]);
    *api.script.lock().unwrap() = vec![Step::Chunk("Sure.")];
    let mut server_history = history();
    server_history.push(message(3, 1, Role::User, "next?"));
    server_history.push(message(4, 1, Role::Assistant, "Sure."));
    api.server.lock().unwrap().insert(1, conversation(1, "Trip plan", Some(server_history)));

    actions.send_message("tok", 1, "next?", "base/model", false).await.unwrap();

    let conv = store.conversation(1).unwrap();
    let ids: Vec<_> = conv.messages
        .as_ref()
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, (1..=4).map(MessageId::Server).collect::<Vec<_>>());
    assert_eq!(conv.message_count, Some(4));
    assert_eq!(conv.last_message.unwrap().id, MessageId::Server(4));
}

#[tokio::test]
async fn direct_message_creates_activates_and_streams() {
    let (store, api, actions) = setup(true);
    let user = message(70, 7, Role::User, "hello");
    *api.created.lock().unwrap() = Some(conversation(7, "hello", Some(vec![user.clone()])));
    *api.script.lock().unwrap() = vec![Step::Chunk("Hi "), Step::Chunk("there")];
    api.server
        .lock()
        .unwrap()
        .insert(
            7,
            conversation(7, "hello", Some(vec![user, message(71, 7, Role::Assistant, "Hi there")]))
        );

    let id = actions.create_direct_message("tok", "hello", "base/model", true).await.unwrap();

    assert_eq!(id, 7);
    assert_eq!(store.active_conversation_id(), Some(7));
    let conv = store.active_conversation().unwrap();
    let messages = conv.messages.as_ref().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, MessageId::Server(71));
    assert_eq!(messages[1].content, "Hi there");
    assert_eq!(conv.message_count, Some(2));
    assert!(!store.is_streaming());
    assert_eq!(
        api.calls(),
        vec![
            "direct:hello:base/model:online".to_string(),
            "stream:7:base/model:online".to_string(),
            "get:7".to_string()
        ]
    );
}

#[tokio::test]
async fn failed_direct_message_sets_error() {
    let (store, _api, actions) = setup(true);
    let err = actions.create_direct_message("tok", "", "base/model", false).await.unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(store.last_error().as_deref(), Some("content required"));
    assert!(store.conversations().is_empty());
    assert!(!store.is_loading());
}

#[tokio::test]
async fn load_conversations_failure_keeps_previous_list() {
    let (store, api, actions) = setup(true);
    *api.list.lock().unwrap() = Some(vec![conversation(1, "a", None), conversation(2, "b", None)]);
    actions.load_conversations("tok").await.unwrap();
    assert_eq!(store.conversations().len(), 2);

    *api.list.lock().unwrap() = None;
    assert!(actions.load_conversations("tok").await.is_err());
    assert_eq!(store.conversations().len(), 2);
    assert_eq!(store.last_error().as_deref(), Some("Service Unavailable"));
    assert!(!store.is_loading());
}

#[tokio::test]
async fn load_conversations_without_token_does_nothing() {
    let (store, api, actions) = setup(true);
    actions.load_conversations("").await.unwrap();
    assert!(api.calls().is_empty());
    assert_eq!(store.revision(), 0);
}

#[tokio::test]
async fn deleting_active_conversation_loads_the_next_one() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![conversation(1, "a", None), conversation(2, "b", None)]);
    store.set_active_conversation(Some(1));
    api.server
        .lock()
        .unwrap()
        .insert(2, conversation(2, "b", Some(vec![message(20, 2, Role::User, "hey")])));

    actions.delete_conversation("tok", 1).await.unwrap();

    assert_eq!(store.active_conversation_id(), Some(2));
    let active = store.active_conversation().unwrap();
    assert_eq!(active.messages.as_ref().unwrap().len(), 1);
    assert_eq!(api.calls(), vec!["delete:1".to_string(), "get:2".to_string()]);

    actions.delete_conversation("tok", 2).await.unwrap();
    assert_eq!(store.active_conversation_id(), None);
}

#[tokio::test]
async fn failed_delete_leaves_state_unchanged() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![conversation(1, "a", None)]);
    *api.delete_error.lock().unwrap() = Some((403, "not yours"));

    assert!(actions.delete_conversation("tok", 1).await.is_err());
    assert!(store.has_conversation(1));
    assert_eq!(store.last_error().as_deref(), Some("not yours"));
}

#[tokio::test]
async fn selecting_a_conversation_loads_its_messages() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![conversation(5, "a", None)]);
    api.server
        .lock()
        .unwrap()
        .insert(5, conversation(5, "a", Some(vec![message(50, 5, Role::User, "x")])));

    actions.set_active_conversation("tok", Some(5)).await.unwrap();
    assert_eq!(store.active_conversation_id(), Some(5));
    assert_eq!(store.conversation(5).unwrap().message_count, Some(1));

    actions.set_active_conversation("tok", None).await.unwrap();
    assert_eq!(store.active_conversation_id(), None);
    assert!(store.active_conversation().is_none());
}

#[tokio::test]
async fn create_conversation_becomes_active() {
    let (store, _api, actions) = setup(true);
    let id = actions.create_conversation("tok", "Budget").await.unwrap();
    assert_eq!(id, 30);
    assert_eq!(store.active_conversation().unwrap().title, "Budget");
}

#[tokio::test]
async fn failed_send_into_unopened_conversation_restores_it() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![listed(1, "Trip plan")]);
    let before = store.conversation(1).unwrap();
    *api.open_error.lock().unwrap() = Some((500, "model unavailable"));

    assert!(actions.send_message("tok", 1, "next?", "base/model", false).await.is_err());

    let after = store.conversation(1).unwrap();
    assert_eq!(after, before);
    assert!(after.messages.is_none());
    assert_eq!(after.last_message.unwrap().id, MessageId::Server(2));
}

#[tokio::test]
async fn send_into_unopened_conversation_ends_in_server_order() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![listed(1, "Trip plan")]);
    *api.script.lock().unwrap() = vec![Step::Chunk("Sure.")];
    let mut server_history = history();
    server_history.push(message(3, 1, Role::User, "next?"));
    server_history.push(message(4, 1, Role::Assistant, "Sure."));
    api.server.lock().unwrap().insert(1, conversation(1, "Trip plan", Some(server_history)));

    actions.send_message("tok", 1, "next?", "base/model", false).await.unwrap();

    let conv = store.conversation(1).unwrap();
    assert_eq!(ids(&conv), (1..=4).map(MessageId::Server).collect::<Vec<_>>());
    assert_eq!(conv.message_count, Some(4));
}

#[tokio::test]
async fn loading_after_a_push_keeps_server_order() {
    let (store, api, actions) = setup(true);
    store.set_conversations(vec![listed(1, "Trip plan")]);
    store.apply_push_event(PushEvent::MessageCreated(message(3, 1, Role::User, "from phone")));
    let mut server_history = history();
    server_history.push(message(3, 1, Role::User, "from phone"));
    api.server.lock().unwrap().insert(1, conversation(1, "Trip plan", Some(server_history)));

    actions.load_messages("tok", 1).await.unwrap();

    let conv = store.conversation(1).unwrap();
    assert_eq!(ids(&conv), (1..=3).map(MessageId::Server).collect::<Vec<_>>());
    assert_eq!(conv.message_count, Some(3));
    assert_eq!(conv.last_message.unwrap().id, MessageId::Server(3));
}

#[tokio::test]
async fn direct_message_seeds_user_message_from_summary() {
    for reconcile in [false, true] {
        let (store, api, actions) = setup(reconcile);
        let user = message(70, 7, Role::User, "hello");
        let mut created = conversation(7, "hello", None);
        created.message_count = Some(1);
        created.last_message = Some(user.clone());
        *api.created.lock().unwrap() = Some(created);
        *api.script.lock().unwrap() = vec![Step::Chunk("Hi")];
        api.server
            .lock()
            .unwrap()
            .insert(7, conversation(7, "hello", Some(vec![user, message(71, 7, Role::Assistant, "Hi")])));

        actions.create_direct_message("tok", "hello", "base/model", false).await.unwrap();

        let conv = store.conversation(7).unwrap();
        let turns: Vec<_> = conv.messages
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect();
        assert_eq!(
            turns,
            vec![(Role::User, "hello".to_string()), (Role::Assistant, "Hi".to_string())]
        );
        assert_eq!(conv.message_count, Some(2));
        if reconcile {
            assert_eq!(ids(&conv), vec![MessageId::Server(70), MessageId::Server(71)]);
        }
    }
}
