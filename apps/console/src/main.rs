use std::sync::Arc;

use anyhow::Result;
use backend_api::LoopbackHub;
use clap::Parser;
use shared::domain::{ChannelId, UserId};
use sync_core::{EngineEvent, LocalProfile, SyncConfig, SyncEngine};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "general")]
    channel: String,
    #[arg(long, default_value = "hello from the console demo")]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let channel = ChannelId::new(args.channel);

    // two engines on one in-process hub: alice sends, bob observes
    let hub = LoopbackHub::new();
    let alice = SyncEngine::new(
        Arc::new(hub.client(UserId::new("alice"))),
        LocalProfile {
            user_id: UserId::new("alice"),
            name: "Alice".into(),
            avatar: None,
            color: Some("#e96d5e".into()),
        },
        SyncConfig::default(),
    );
    let bob = SyncEngine::new(
        Arc::new(hub.client(UserId::new("bob"))),
        LocalProfile {
            user_id: UserId::new("bob"),
            name: "Bob".into(),
            avatar: None,
            color: Some("#5e8fe9".into()),
        },
        SyncConfig::default(),
    );

    let mut bob_events = bob.subscribe_events();
    alice.activate(channel.clone()).await?;
    bob.activate(channel.clone()).await?;

    alice.set_typing(true).await;
    alice.send_message(&args.message, None).await?;

    loop {
        if let EngineEvent::MessagesUpdated = bob_events.recv().await? {
            let view = bob.snapshot().await;
            if let Some(entry) = view.messages.last() {
                println!(
                    "[{}] {}: {}",
                    channel,
                    entry.sender.name,
                    entry.text.clone().unwrap_or_default()
                );
                println!(
                    "online: {}",
                    view.online_users
                        .iter()
                        .map(|user| user.display_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                break;
            }
        }
    }

    bob.mark_read().await;
    alice.deactivate().await;
    bob.deactivate().await;
    Ok(())
}
