/// VibeChat walkthrough - two clients chatting over the in-memory backend
use tracing::info;
use tracing_subscriber::EnvFilter;
use vibechat_core::timeline::MessageBody;
use vibechat_core::types::Profile;
use vibechat_core::{ChatClient, Config, MemoryBackend};

fn profile(id: &str, username: &str) -> Profile {
    Profile {
        id: id.to_string(),
        username: username.to_string(),
        full_name: None,
        avatar_url: None,
        status: None,
        vibe: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let store = MemoryBackend::new();
    store.add_profile(profile("u1", "alice")).await;
    store.add_profile(profile("u2", "bob")).await;

    let alice = ChatClient::new(store.signed_in("u1"), config.clone());
    let bob = ChatClient::new(store.signed_in("u2"), config);

    let mut alice_view = alice.start_direct("u2").await?;
    let mut bob_view = bob.start_direct("u1").await?;
    info!("Both sides resolved {}", alice_view.conversation_id());

    alice_view.on_input().await?;
    bob_view.pump().await?;
    info!("Bob sees alice typing: {}", bob_view.is_typing());

    let sent = alice_view.send_text("yo").await?;
    alice_view.pump().await?;
    bob_view.pump().await?;
    info!(
        "Message {} - alice has {} entries, bob has {}",
        sent.id,
        alice_view.timeline().len(),
        bob_view.timeline().len()
    );

    for summary in bob.inbox().await? {
        info!("Bob's inbox: {} unread in {}", summary.unread_count, summary.conversation.id);
    }
    bob.mark_as_read(bob_view.conversation_id()).await?;

    alice_view.delete_message(&sent.id).await?;
    bob_view.pump().await?;
    if let Some(entry) = bob_view.timeline().get(&sent.id) {
        let shown = match entry.body() {
            MessageBody::Tombstone => "Message deleted".to_string(),
            MessageBody::Visible { text, .. } => text.unwrap_or_default().to_string(),
        };
        info!("Bob now sees: {}", shown);
    }

    alice_view.close().await?;
    bob_view.close().await?;
    Ok(())
}
