pub mod actions;
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod push;
pub mod store;

pub use actions::ChatActions;
pub use api::{ ChatApi, ClientIdentity, HttpChatApi };
pub use config::ClientConfig;
pub use error::{ ChatError, Result };
pub use push::{ ConnectionState, PushTransport };
pub use store::ChatStore;

use cli::Args;
use log::{ error, info, warn };
use models::chat::Role;
use std::error::Error;
use std::io::Write;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::Arc;
use std::time::Duration;

pub async fn run(args: Args) -> std::result::Result<(), Box<dyn Error + Send + Sync>> {
    let config = ClientConfig::from_args(&args);
    info!("--- Core Configuration ---");
    info!("API URL: {}", config.api_url);
    info!("Push URL: {}", config.ws_url);
    info!("Base Model: {}", config.default_model);
    info!("Online Model: {}", args.online);
    info!("Reconnect Delay: {:?}", config.reconnect_delay);
    info!("Request Timeout: {:?}", config.request_timeout);
    info!("Reconcile Ids: {}", config.reconcile_ids);
    info!("Announce Client: {}", config.announce_client);
    info!("Token Provided: {}", !args.token.is_empty());
    info!("-------------------------");

    let store = ChatStore::new(config.default_model.clone());
    store.set_online_enabled(args.online);
    let identity = ClientIdentity::new();
    let api = api::new_client(&config, identity.clone())?;
    let actions = ChatActions::new(store.clone(), api, &config);
    let push = PushTransport::new(&config, store.clone(), identity);

    if args.token.is_empty() {
        warn!("No token set; the push channel stays closed");
    } else {
        push.connect(&args.token)?;
    }

    if let Err(e) = actions.load_conversations(&args.token).await {
        error!("Could not load conversations: {}", e);
    }
    for conversation in store.filtered_conversations().iter() {
        info!(
            "[{}] {} ({} messages)",
            conversation.id,
            conversation.title,
            conversation.message_count()
        );
    }

    if let Some(text) = args.message.as_deref() {
        send_and_print(&actions, &args, text).await;
    }

    if args.watch {
        watch_events(&store, &push).await;
    }

    push.disconnect();
    // let the close frame go out before the runtime shuts down
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

/// Sends `text` and echoes the streamed reply to stdout as it arrives.
async fn send_and_print(actions: &ChatActions, args: &Args, text: &str) {
    let store = actions.store().clone();
    let printed = Arc::new(AtomicUsize::new(0));
    let mut changes = store.subscribe();
    let printer = {
        let printed = Arc::clone(&printed);
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let buffer = store.streaming_buffer();
                let done = printed.load(Ordering::Acquire);
                if let Some(fresh) = buffer.get(done..) {
                    if !fresh.is_empty() {
                        print!("{}", fresh);
                        let _ = std::io::stdout().flush();
                        printed.store(buffer.len(), Ordering::Release);
                    }
                }
            }
        })
    };

    let base_model = actions.store().selected_base_model();
    let result = match args.chat_id {
        Some(chat_id) =>
            actions.send_message(&args.token, chat_id, text, &base_model, args.online).await,
        None =>
            actions
                .create_direct_message(&args.token, text, &base_model, args.online).await
                .map(|id| info!("Started conversation {}", id)),
    };
    printer.abort();
    let _ = printer.await;
    // chunks that landed after the printer's last wake-up
    let reply = actions
        .store()
        .active_conversation()
        .and_then(|c| c.last_message.clone())
        .filter(|m| m.role == Role::Assistant);
    if let Some(rest) = reply.as_ref().and_then(|m| m.content.get(printed.load(Ordering::Acquire)..)) {
        print!("{}", rest);
    }
    println!();
    if let Err(e) = result {
        error!("Sending failed: {}", e);
    }
}

async fn watch_events(store: &ChatStore, push: &PushTransport) {
    info!("Watching push events, press Ctrl-C to stop");
    let mut changes = store.subscribe();
    let mut states = push.subscribe_state();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!("Push channel is {:?}", state);
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                changes.borrow_and_update();
                if let Some(event) = push.latest_event() {
                    info!(
                        "Applied '{}' event, {} conversations in store",
                        event.kind,
                        store.conversations().len()
                    );
                }
            }
        }
    }
}
