//! Parlor Net Server
//!
//! Standalone table server. Game rules live in the embedding
//! application, so on its own this binary just hosts the table and
//! narrates the traffic; handy for poking at the protocol with a
//! client.

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use parlor_net::{Server, ServerConfig, ServerEvent, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("PARLOR_BIND") {
        config.bind_addr = addr;
    }
    if let Ok(name) = std::env::var("PARLOR_NAME") {
        config.server_name = name;
    }
    if let Ok(secret) = std::env::var("PARLOR_SECRET") {
        config.cipher_secret = Some(secret);
    }
    if let Ok(password) = std::env::var("PARLOR_PASSWORD") {
        config.password = Some(password);
    }

    info!("Parlor Net v{}", VERSION);
    info!("Table: {}", config.server_name);
    info!("Seats: {}", config.max_clients);

    let server = Server::bind(config).await?;

    // Application command kinds the codec should let through, e.g.
    // PARLOR_KINDS=deal,play,fold
    if let Ok(kinds) = std::env::var("PARLOR_KINDS") {
        for kind in kinds.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            server.register_kind(kind).await;
        }
    }

    let mut events = server.start().await?;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                server.shutdown();
                break;
            }
        }
    }
    Ok(())
}

/// Narrate one table event.
fn log_event(event: ServerEvent) {
    match event {
        ServerEvent::Connected { name } => info!("{} joined the table", name),
        ServerEvent::Reconnected { name } => info!("{} returned to the table", name),
        ServerEvent::Disconnected { name, reason } => info!("{} left ({})", name, reason),
        ServerEvent::Kicked { name, reason } => warn!("{} was kicked ({})", name, reason),
        ServerEvent::Command { from, command } => {
            info!("{} sent `{}` with {} args", from, command.kind(), command.len());
        }
        ServerEvent::PropertyChanged { name, key, value } => {
            info!("{} set {} = {:?}", name, key, value);
        }
        ServerEvent::StatusChanged { name, status } => {
            info!("{} connection is now {:?}", name, status);
        }
    }
}
