//! Push transport: one persistent WebSocket per auth token, reconnected after
//! a fixed delay when the server drops it.
//!
//! Every connection attempt is tagged with an epoch. `connect` with a new
//! token and `disconnect` both advance the epoch, so close handlers and
//! reconnect timers that belong to an older attempt find a newer epoch and
//! do nothing.

use crate::api::ClientIdentity;
use crate::config::ClientConfig;
use crate::error::{ ChatError, Result };
use crate::models::websocket::{ PushEnvelope, PushEvent, CLIENT_CONNECT };
use crate::store::ChatStore;
use futures::{ SinkExt, StreamExt };
use log::{ debug, info, warn };
use serde_json::{ json, Value };
use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;
use tokio::sync::{ mpsc, watch };
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{ CloseFrame, Message };
use tokio_tungstenite::tungstenite::Error as WsError;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Link {
    state: ConnectionState,
    token: Option<String>,
    url: Option<Url>,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    ws_url: String,
    reconnect_delay: Duration,
    announce: bool,
    store: ChatStore,
    identity: ClientIdentity,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    latest_tx: watch::Sender<Option<PushEnvelope>>,
}

#[derive(Clone)]
pub struct PushTransport {
    inner: Arc<Inner>,
}

impl PushTransport {
    pub fn new(config: &ClientConfig, store: ChatStore, identity: ClientIdentity) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (latest_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                ws_url: config.ws_url.clone(),
                reconnect_delay: config.reconnect_delay,
                announce: config.announce_client,
                store,
                identity,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    token: None,
                    url: None,
                    epoch: 0,
                    outbound: None,
                    task: None,
                    reconnect: None,
                }),
                state_tx,
                latest_tx,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// The most recent frame received, whatever its type.
    pub fn latest_event(&self) -> Option<PushEnvelope> {
        self.inner.latest_tx.borrow().clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.identity.get()
    }

    /// Opens `<ws-url>?token=<token>`. A live or pending connection for the
    /// same token is left alone; a different token replaces it.
    pub fn connect(&self, token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(ChatError::MissingToken);
        }
        let mut url = Url::parse(&self.inner.ws_url)?;
        url.query_pairs_mut().append_pair("token", token);

        let mut link = self.inner.lock();
        let live = matches!(link.state, ConnectionState::Connecting | ConnectionState::Connected);
        if live && link.token.as_deref() == Some(token) {
            debug!("Push channel already open for this token");
            return Ok(());
        }
        if let Some(timer) = link.reconnect.take() {
            timer.abort();
        }
        if let Some(task) = link.task.take() {
            info!("Replacing push connection for a new token");
            task.abort();
        }
        link.outbound = None;
        link.token = Some(token.to_string());
        link.url = Some(url);
        self.inner.start_attempt(&mut link);
        Ok(())
    }

    /// Closes with code 1000 and forgets the token; no reconnect follows.
    pub fn disconnect(&self) {
        let mut link = self.inner.lock();
        link.epoch += 1;
        link.token = None;
        link.url = None;
        if let Some(timer) = link.reconnect.take() {
            timer.abort();
        }
        match link.outbound.take() {
            Some(outbound) => {
                info!("Disconnecting push channel");
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                let _ = outbound.send(Message::Close(Some(frame)));
            }
            None => {
                debug!("Push channel not connected, nothing to close");
            }
        }
        // the connection task exits once the close handshake completes
        link.task = None;
        link.state = ConnectionState::Disconnected;
        drop(link);
        self.inner.identity.clear();
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Sends `{type, data, client_id}`. Returns `false` when not connected.
    pub fn send(&self, kind: &str, data: Value) -> bool {
        self.inner.send_frame(kind, data)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_attempt(self: &Arc<Self>, link: &mut Link) {
        let Some(url) = link.url.clone() else {
            return;
        };
        link.epoch += 1;
        link.state = ConnectionState::Connecting;
        link.task = Some(tokio::spawn(run_connection(Arc::clone(self), url, link.epoch)));
        self.state_tx.send_replace(ConnectionState::Connecting);
    }

    fn send_frame(&self, kind: &str, data: Value) -> bool {
        let link = self.lock();
        let outbound = match (&link.state, &link.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            _ => {
                warn!("Push channel not connected, dropping '{}' frame", kind);
                return false;
            }
        };
        let frame = PushEnvelope::new(kind, data, self.identity.get());
        match serde_json::to_string(&frame) {
            Ok(text) => outbound.send(Message::Text(text)).is_ok(),
            Err(e) => {
                warn!("Could not encode '{}' frame: {}", kind, e);
                false
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    fn handle_text(&self, epoch: u64, text: &str) {
        if !self.is_current(epoch) {
            debug!("Ignoring frame from a superseded connection");
            return;
        }
        let envelope = match serde_json::from_str::<PushEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to parse push frame: {}", e);
                return;
            }
        };
        self.latest_tx.send_replace(Some(envelope.clone()));
        match PushEvent::from_envelope(&envelope) {
            Ok(PushEvent::ClientConnected { client_id }) => {
                info!("Client id received: {}", client_id);
                self.identity.set(client_id);
            }
            Ok(event) => self.store.apply_push_event(event),
            Err(e) => warn!("Dropping push frame: {}", e),
        }
    }

    fn on_opened(&self, epoch: u64, outbound: mpsc::UnboundedSender<Message>) -> bool {
        let mut link = self.lock();
        if link.epoch != epoch {
            return false;
        }
        link.state = ConnectionState::Connected;
        link.outbound = Some(outbound);
        drop(link);
        self.state_tx.send_replace(ConnectionState::Connected);
        true
    }

    fn on_closed(self: &Arc<Self>, epoch: u64, code: Option<CloseCode>) {
        let mut link = self.lock();
        if link.epoch != epoch {
            debug!("Close of a superseded connection ignored");
            return;
        }
        link.state = ConnectionState::Disconnected;
        link.outbound = None;
        link.task = None;
        if let Some(timer) = link.reconnect.take() {
            timer.abort();
        }

        let clean = code == Some(CloseCode::Normal);
        match link.token.clone() {
            Some(token) if !clean => {
                let delay = self.reconnect_delay;
                info!("Push channel dropped ({:?}), reconnecting in {:?}", code, delay);
                let inner = Arc::clone(self);
                link.reconnect = Some(
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.reconnect(epoch, &token);
                    })
                );
            }
            _ => {
                info!("Push channel closed, not reconnecting");
                link.token = None;
                link.url = None;
            }
        }
        drop(link);
        self.identity.clear();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn reconnect(self: &Arc<Self>, epoch: u64, token: &str) {
        let mut link = self.lock();
        if link.epoch != epoch || link.token.as_deref() != Some(token) {
            debug!("Stale reconnect timer ignored");
            return;
        }
        link.reconnect = None;
        info!("Reconnecting push channel");
        self.start_attempt(&mut link);
    }
}

async fn run_connection(inner: Arc<Inner>, url: Url, epoch: u64) {
    info!("Connecting push channel to {}", url.host_str().unwrap_or("?"));
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("Push connection failed: {}", ChatError::from(e));
            inner.on_closed(epoch, None);
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if !inner.on_opened(epoch, tx) {
        debug!("Connection opened after being superseded, dropping it");
        return;
    }
    info!("Push channel connected");
    if inner.announce {
        inner.send_frame(CLIENT_CONNECT, json!({}));
    }

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                warn!("Push write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut close_code = None;
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => inner.handle_text(epoch, &text),
            Ok(Message::Close(frame)) => {
                close_code = frame.as_ref().map(|f| f.code);
                info!("Server closed push channel: {:?}", frame);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Binary(_)) => {
                warn!("Ignoring binary push frame");
            }
            Ok(Message::Frame(_)) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                break;
            }
            Err(e) => {
                warn!("Push read failed: {}", e);
                break;
            }
        }
    }
    writer.abort();
    inner.on_closed(epoch, close_code);
}
