pub mod decode;

use crate::config::ClientConfig;
use crate::error::{ ChatError, Result };
use crate::models::chat::{ Conversation, ConversationId, Role };
use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use log::{ debug, warn };
use reqwest::{ Client as HttpClient, Method, RequestBuilder, Response };
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{ Deserialize, Serialize };
use std::pin::Pin;
use std::sync::{ Arc, RwLock };
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use self::decode::Utf8Decoder;

/// Raw text chunks of a streamed assistant reply, in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The id the push server assigned to this client. Written by the push
/// transport on `client_connected`, read by the HTTP client for request bodies.
#[derive(Clone, Debug, Default)]
pub struct ClientIdentity {
    id: Arc<RwLock<Option<String>>>,
}

impl ClientIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, id: impl Into<String>) {
        *self.id.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.into());
    }

    pub fn clear(&self) {
        *self.id.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self, token: &str) -> Result<Vec<Conversation>>;

    async fn create_conversation(&self, token: &str, title: &str) -> Result<Conversation>;

    /// Creates a conversation whose first message is `content`.
    async fn create_direct_message(
        &self,
        token: &str,
        content: &str,
        model: &str
    ) -> Result<Conversation>;

    /// The conversation with its full message list.
    async fn get_conversation(&self, token: &str, id: ConversationId) -> Result<Conversation>;

    async fn delete_conversation(&self, token: &str, id: ConversationId) -> Result<()>;

    async fn send_message(
        &self,
        token: &str,
        id: ConversationId,
        content: &str,
        model: &str
    ) -> Result<ChunkStream>;

    /// Streams the assistant reply to the latest user message.
    async fn stream_response(
        &self,
        token: &str,
        id: ConversationId,
        model: &str
    ) -> Result<ChunkStream>;
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct CreateConversationBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct DirectMessageBody<'a> {
    content: &'a str,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    content: &'a str,
    role: Role,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

#[derive(Serialize)]
struct StreamBody<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

pub struct HttpChatApi {
    http: HttpClient,
    base_url: String,
    timeout: Option<Duration>,
    identity: ClientIdentity,
}

impl HttpChatApi {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Option<Duration>,
        identity: ClientIdentity
    ) -> Result<Self> {
        let http = HttpClient::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            identity,
        })
    }

    pub fn from_config(config: &ClientConfig, identity: ClientIdentity) -> Result<Self> {
        Self::new(config.api_url.clone(), config.request_timeout, identity)
    }

    fn request(&self, method: Method, route: &str, token: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, route);
        debug!("{} {}", method, url);
        let mut builder = self.http.request(method, url);
        if !token.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder
    }

    /// Request with the JSON timeout applied.
    fn json_request(&self, method: Method, route: &str, token: &str) -> RequestBuilder {
        let builder = self.request(method, route, token);
        match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }
}

/// Maps a non-2xx answer to `ChatError::Api`, preferring the body's `error`.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let fallback = status.canonical_reason().unwrap_or("Request failed").to_string();
    let message = match resp.json::<ErrorBody>().await {
        Ok(ErrorBody { error: Some(error) }) if !error.is_empty() => error,
        _ => fallback,
    };
    warn!("Request failed with status {}: {}", status.as_u16(), message);
    Err(ChatError::api(status.as_u16(), message))
}

async fn read_data<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let resp = check_status(resp).await?;
    let bytes = resp.bytes().await?;
    let envelope: DataEnvelope<T> = serde_json::from_slice(&bytes)?;
    Ok(envelope.data)
}

/// Pumps a response body into a channel, decoding UTF-8 across chunk
/// boundaries. The body is read on its own task so the caller can stop
/// polling at any time.
fn body_stream(resp: Response) -> ChunkStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut decoder = Utf8Decoder::new();
        let mut bytes = resp.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(buf) => {
                    let text = decoder.push(&buf);
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(text)).await.is_err() {
                        debug!("Chunk receiver dropped, abandoning body");
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(ChatError::Stream(e.to_string()))).await;
                    return;
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = tx.send(Ok(rest)).await;
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self, token: &str) -> Result<Vec<Conversation>> {
        let resp = self.json_request(Method::GET, "/chats", token).send().await?;
        read_data(resp).await
    }

    async fn create_conversation(&self, token: &str, title: &str) -> Result<Conversation> {
        let resp = self
            .json_request(Method::POST, "/chats", token)
            .json(&CreateConversationBody { title })
            .send().await?;
        read_data(resp).await
    }

    async fn create_direct_message(
        &self,
        token: &str,
        content: &str,
        model: &str
    ) -> Result<Conversation> {
        let body = DirectMessageBody { content, model, client_id: self.identity.get() };
        let resp = self.json_request(Method::POST, "/messages", token).json(&body).send().await?;
        read_data(resp).await
    }

    async fn get_conversation(&self, token: &str, id: ConversationId) -> Result<Conversation> {
        let route = format!("/chats/{}", id);
        let resp = self.json_request(Method::GET, &route, token).send().await?;
        read_data(resp).await
    }

    async fn delete_conversation(&self, token: &str, id: ConversationId) -> Result<()> {
        let route = format!("/chats/{}", id);
        let resp = self.json_request(Method::DELETE, &route, token).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        token: &str,
        id: ConversationId,
        content: &str,
        model: &str
    ) -> Result<ChunkStream> {
        let route = format!("/chats/{}/messages", id);
        let body = SendMessageBody {
            content,
            role: Role::User,
            model,
            client_id: self.identity.get(),
        };
        let resp = self.request(Method::POST, &route, token).json(&body).send().await?;
        let resp = check_status(resp).await?;
        Ok(body_stream(resp))
    }

    async fn stream_response(
        &self,
        token: &str,
        id: ConversationId,
        model: &str
    ) -> Result<ChunkStream> {
        let route = format!("/chats/{}/stream", id);
        let body = StreamBody { model, client_id: self.identity.get() };
        let resp = self.request(Method::POST, &route, token).json(&body).send().await?;
        let resp = check_status(resp).await?;
        Ok(body_stream(resp))
    }
}

pub fn new_client(config: &ClientConfig, identity: ClientIdentity) -> Result<Arc<dyn ChatApi>> {
    let client: Arc<dyn ChatApi> = Arc::new(HttpChatApi::from_config(config, identity)?);
    Ok(client)
}
