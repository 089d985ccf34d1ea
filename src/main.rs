use anyhow::Context;
use group_channel::message::Event;
use group_channel::stack::{Channel, ProtocolRegistry, StackConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_GROUP: &str = "default";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>]... [--group <name>] [--config <file>] [--debug]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:7800", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:7801 --seed 127.0.0.1:7800",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut group = DEFAULT_GROUP.to_string();
    let mut config_path: Option<PathBuf> = None;
    let mut debug = false;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(value)) => {
                bind_addr = Some(value.parse().context("invalid --bind address")?);
                i += 2;
            }
            ("--seed", Some(value)) => {
                seed_nodes.push(value.parse().context("invalid --seed address")?);
                i += 2;
            }
            ("--group", Some(value)) => {
                group = value.clone();
                i += 2;
            }
            ("--config", Some(value)) => {
                config_path = Some(PathBuf::from(value));
                i += 2;
            }
            ("--debug", _) => {
                debug = true;
                i += 1;
            }
            _ => {
                i += 1;
            }
        }
    }

    tracing_subscriber::fmt()
        .with_max_level(if debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = match config_path {
        Some(path) => StackConfig::load(&path)
            .with_context(|| format!("loading stack configuration from {}", path.display()))?,
        None => {
            let bind_addr = bind_addr.context("--bind is required without --config")?;
            let mut hosts = seed_nodes.clone();
            hosts.push(bind_addr);
            StackConfig::default_udp(bind_addr, &hosts)
        }
    };

    tracing::info!("Protocol stack: {}", config.protocol_spec());
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("No seed nodes, this member may found the group");
    }

    // 1. Stack and channel:
    let registry = ProtocolRegistry::with_defaults();
    let channel = Channel::new(&config, &registry)?;

    // 2. Join:
    channel.connect(&group).await?;
    tracing::info!(
        "Member {:?} joined '{}', view: {:?}",
        channel.local_address(),
        group,
        channel.view().map(|v| v.to_string())
    );
    tracing::info!("Press Ctrl+C to leave the group");

    // 3. Event loop with a periodic stats line:
    let mut stats = tokio::time::interval(Duration::from_secs(5));
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = stats.tick() => {
                match channel.view() {
                    Some(view) => tracing::info!(
                        "Group stats: {} member(s), {} message(s) received, view {}",
                        view.size(),
                        received,
                        view
                    ),
                    None => tracing::info!("Group stats: not a member"),
                }
            }
            evt = channel.receive(Duration::from_secs(1)) => match evt {
                Ok(Some(Event::Msg(msg))) => {
                    received += 1;
                    tracing::info!(
                        "Message from {:?}: {}",
                        msg.src,
                        String::from_utf8_lossy(&msg.payload)
                    );
                }
                Ok(Some(Event::ViewChange(view))) => tracing::info!("New view: {}", view),
                Ok(Some(Event::Suspect(mbr))) => tracing::warn!("Member {} suspected", mbr),
                Ok(Some(Event::Exit)) => {
                    tracing::warn!("Excluded from the group, rejoining '{}'", group);
                    channel.connect(&group).await?;
                }
                Ok(Some(other)) => tracing::debug!("Event: {:?}", other.kind()),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Channel closed: {}", e);
                    break;
                }
            }
        }
    }

    channel.close().await;
    Ok(())
}
