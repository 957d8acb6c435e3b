//! Headless Witra node.
//!
//! Spawns the runtime, prints every core event, and reads operations from
//! stdin — the same surface a desktop frontend would drive. `help` lists
//! the commands.

use std::path::PathBuf;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use witra::logging::setup_logger;
use witra::runtime::config::Config;
use witra::{spawn_runtime, Runtime, RuntimeEvent, RuntimeHandle, StartOptions};

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger()?;

    let config_path = PathBuf::from("config.toml");
    let mut config = Config::load_or_init(&config_path)?;

    // Minimal flag handling: `--name <display name>` overrides the config.
    let args: Vec<String> = std::env::args().collect();
    if let Some(position) = args.iter().position(|arg| arg == "--name") {
        if let Some(name) = args.get(position + 1) {
            config.display_name = Some(name.clone());
        }
    }

    let Runtime { handle, mut events } = spawn_runtime(StartOptions {
        config: config.clone(),
        ..Default::default()
    })
    .await;

    println!(
        "witra node '{}' ({}) — type `help` for commands",
        handle.display_name(),
        handle.peer_id()
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },

            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, &mut config, &config_path, line.trim()).await {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            },
        }
    }

    handle.shutdown().await.ok();
    Ok(())
}

/// Execute one stdin command; returns `false` on `quit`.
async fn run_command(
    handle: &RuntimeHandle,
    config: &mut Config,
    config_path: &std::path::Path,
    line: &str,
) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };
    let args: Vec<&str> = parts.collect();

    let result = match (command, args.as_slice()) {
        ("help", _) => {
            println!(
                "commands:\n  peers\n  transfers\n  connect <peer-id>\n  accept <peer-id>\n  \
                 reject <peer-id>\n  disconnect <peer-id>\n  send <peer-id> <path> [path…]\n  \
                 cancel <transfer-id>\n  name <display-name>\n  clear\n  quit"
            );
            Ok(())
        }
        ("peers", _) => match handle.list_peers().await {
            Ok(peers) => {
                for peer in peers {
                    println!(
                        "  {}  {} ({})  {}:{}  {:?}",
                        peer.id,
                        peer.display_name,
                        peer.device_name,
                        peer.address,
                        peer.transfer_port,
                        peer.state
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        ("transfers", _) => match handle.list_transfers().await {
            Ok(transfers) => {
                for transfer in transfers {
                    println!(
                        "  {}  {}  {:?}/{:?}  {}/{} bytes  {} B/s",
                        transfer.id,
                        transfer.file_name,
                        transfer.direction,
                        transfer.status,
                        transfer.transferred,
                        transfer.total_size,
                        transfer.speed_bps
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        ("connect", [peer_id]) => handle.connect(peer_id).await,
        ("accept", [peer_id]) => handle.accept(peer_id).await,
        ("reject", [peer_id]) => handle.reject(peer_id).await,
        ("disconnect", [peer_id]) => handle.disconnect(peer_id).await,
        ("send", [peer_id, paths @ ..]) if !paths.is_empty() => {
            let paths = paths.iter().map(PathBuf::from).collect();
            handle.send_files(peer_id, paths).await
        }
        ("cancel", [transfer_id]) => handle.cancel_transfer(transfer_id).await,
        ("name", rest) if !rest.is_empty() => {
            let name = rest.join(" ");
            config.display_name = Some(name.clone());
            if let Err(e) = config.save(config_path) {
                eprintln!("could not save config: {:#}", e);
            }
            handle.set_display_name(name).await
        }
        ("clear", _) => handle.clear_finished().await,
        ("quit" | "exit", _) => return false,
        _ => {
            println!("unknown command — try `help`");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
    }
    true
}

fn print_event(event: &RuntimeEvent) {
    match event {
        RuntimeEvent::PeerAdded(peer) => {
            println!(
                "[peer] found {} ({}) at {}:{}",
                peer.display_name, peer.id, peer.address, peer.transfer_port
            );
        }
        RuntimeEvent::PeerUpdated(peer) => {
            println!("[peer] {} ({}) is now {:?}", peer.display_name, peer.id, peer.state);
        }
        RuntimeEvent::PeerRemoved { peer_id } => {
            println!("[peer] {} left", peer_id);
        }
        RuntimeEvent::ConnectionRequestReceived {
            peer_id,
            display_name,
        } => {
            println!(
                "[conn] {} ({}) wants to connect — `accept {}` or `reject {}`",
                display_name, peer_id, peer_id, peer_id
            );
        }
        RuntimeEvent::ConnectionAccepted { peer_id } => {
            println!("[conn] connected to {}", peer_id);
        }
        RuntimeEvent::ConnectionRejected { peer_id } => {
            println!("[conn] {} rejected the connection", peer_id);
        }
        RuntimeEvent::TransferAdded(transfer) => {
            println!(
                "[xfer] {} {:?} '{}' ({} bytes) with {}",
                transfer.id,
                transfer.direction,
                transfer.file_name,
                transfer.total_size,
                transfer.peer_name
            );
        }
        RuntimeEvent::TransferUpdated(transfer) => {
            println!(
                "[xfer] {} {:?} {}/{} bytes{}",
                transfer.id,
                transfer.status,
                transfer.transferred,
                transfer.total_size,
                transfer
                    .error
                    .as_ref()
                    .map(|error| format!(" — {}", error))
                    .unwrap_or_default()
            );
        }
        RuntimeEvent::TransferRemoved { transfer_id } => {
            println!("[xfer] {} cleared", transfer_id);
        }
        RuntimeEvent::Error { message } => {
            eprintln!("[error] {}", message);
        }
    }
}
