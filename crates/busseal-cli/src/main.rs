//! BusSeal CLI
//!
//! Secure group sessions over a broadcast bus with 64-byte frames

mod config;
mod demo;

use anyhow::Context;
use busseal_core::{Error, GroupId, SessionManager};
use busseal_crypto::{AeadKey, OsRandom};
use busseal_transport::{BusTransport, UdpBus};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use config::Config;

/// BusSeal - authenticated, encrypted group sessions for CAN-style buses
#[derive(Parser)]
#[command(name = "busseal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new group long-term key
    Keygen {
        /// Print a ready-to-paste group table for this group id
        #[arg(long)]
        group: Option<u32>,

        /// Members of the group (with --group)
        #[arg(long, value_delimiter = ',')]
        members: Vec<u8>,
    },

    /// Join the bus and exchange secured messages.
    ///
    /// Reads `<group> <text>` lines from stdin and sends each as a secured
    /// message. `request <group>` starts a handshake, `reset <group>` drops a
    /// session.
    Node {
        /// Start a handshake for every group on startup
        #[arg(long)]
        initiate: bool,
    },

    /// Run a two-node demonstration on an in-process bus
    Demo,

    /// Validate a configuration file and list its groups
    CheckConfig {
        /// Extra group files to validate
        #[arg(long = "group-file")]
        group_files: Vec<PathBuf>,
    },
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let path = path.cloned().unwrap_or_else(Config::default_path);
    Config::load(&path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { group, members } => {
            init_logging(cli.verbose, "warn");
            generate_key(group, &members)?;
        }
        Commands::Demo => {
            init_logging(cli.verbose, "warn");
            demo::run().await?;
        }
        Commands::Node { initiate } => {
            let config = load_config(cli.config.as_ref())?;
            init_logging(cli.verbose, &config.logging.level);
            config.validate()?;
            run_node(&config, initiate).await?;
        }
        Commands::CheckConfig { group_files } => {
            let mut config = load_config(cli.config.as_ref())?;
            init_logging(cli.verbose, &config.logging.level);
            config.node.group_files.extend(group_files);
            check_config(&config)?;
        }
    }

    Ok(())
}

/// Generate a new group long-term key
fn generate_key(group: Option<u32>, members: &[u8]) -> anyhow::Result<()> {
    let key = AeadKey::generate(&OsRandom).context("cannot generate key")?;
    let encoded = hex::encode(key.as_bytes());

    match group {
        Some(id) => {
            println!("[[groups]]");
            println!("id = {id}");
            println!("key = \"{encoded}\"");
            println!("members = {members:?}");
        }
        None => println!("{encoded}"),
    }

    Ok(())
}

/// Validate a configuration and print its groups
fn check_config(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    let keystore = config.keystore()?;

    println!("{} configuration valid", style("✓").green().bold());
    println!("Node: {}", config.node.id);
    println!("Header: {:?}", config.node.header_type);
    println!(
        "Bus: {}:{} (frame id {:#x})",
        config.bus.group,
        config.bus.port,
        config.frame_id()
    );
    println!();

    let mut groups: Vec<_> = keystore.groups_of(config.node_id()).collect();
    groups.sort_by_key(|g| g.id());
    println!("Groups:");
    for group in groups {
        let members: Vec<String> = group.members().iter().map(ToString::to_string).collect();
        println!("  {} members [{}]", group.id(), members.join(", "));
    }

    Ok(())
}

/// Parse `<group> <rest>` from an input line
fn split_group(line: &str) -> Option<(GroupId, &str)> {
    let (group, rest) = line.split_once(' ').unwrap_or((line, ""));
    let id: u32 = group.parse().ok()?;
    GroupId::try_from(id).ok().map(|gid| (gid, rest))
}

async fn send_pdu(
    bus: &UdpBus,
    manager: &SessionManager,
    frame_id: u32,
    pdu: &busseal_core::Pdu,
) -> anyhow::Result<()> {
    let frame = manager.pack(pdu)?;
    bus.send_frame(frame_id, &frame).await?;
    Ok(())
}

fn report(group: Option<GroupId>, err: &Error) {
    let label = match group {
        Some(gid) => format!("group {gid}"),
        None => "frame".to_string(),
    };
    if err.is_security_warning() {
        eprintln!("{} {label}: {err}", style("!").red().bold());
    } else {
        eprintln!("{} {label}: {err}", style("-").yellow());
    }
}

/// Join the bus and run until stdin closes or Ctrl+C.
async fn run_node(config: &Config, initiate: bool) -> anyhow::Result<()> {
    let keystore = Arc::new(config.keystore()?);
    let manager = SessionManager::new(config.node_id(), keystore, config.session_config());
    let bus = UdpBus::join(&config.transport_config()?)
        .await
        .context("cannot join bus")?;
    let frame_id = config.frame_id();

    tracing::info!(
        node = %config.node_id(),
        groups = manager.groups().len(),
        "node started"
    );
    println!(
        "Node {} on {}:{}, groups {:?}",
        config.node.id,
        config.bus.group,
        config.bus.port,
        manager.groups().iter().map(|g| g.as_u16()).collect::<Vec<_>>()
    );

    if initiate {
        for gid in manager.groups() {
            match manager.build_request(gid) {
                Ok(pdu) => send_pdu(&bus, &manager, frame_id, &pdu).await?,
                Err(err) => report(Some(gid), &err),
            }
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            frame = bus.recv_frame() => {
                let frame = frame?;
                match manager.process_received(&frame.data) {
                    Ok(received) => {
                        if let Some(reaction) = received.reaction {
                            println!(
                                "{} group {} session established (responder)",
                                style("✓").green(),
                                reaction.group_id
                            );
                            send_pdu(&bus, &manager, frame_id, &reaction).await?;
                        }
                        if let Some(message) = received.message {
                            println!(
                                "{} [{}#{} from {}] {}",
                                style("<").cyan(),
                                message.group_id,
                                message.counter,
                                message.sender,
                                String::from_utf8_lossy(&message.plaintext)
                            );
                        }
                    }
                    Err(err) => report(None, &err),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                handle_line(&bus, &manager, frame_id, line.trim()).await?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bus.close().await?;
    println!("\nShutting down...");
    Ok(())
}

async fn handle_line(
    bus: &UdpBus,
    manager: &SessionManager,
    frame_id: u32,
    line: &str,
) -> anyhow::Result<()> {
    if line.is_empty() {
        return Ok(());
    }

    if let Some(rest) = line.strip_prefix("request ") {
        let Some((gid, _)) = split_group(rest.trim()) else {
            eprintln!("usage: request <group>");
            return Ok(());
        };
        match manager.build_request(gid) {
            Ok(pdu) => send_pdu(bus, manager, frame_id, &pdu).await?,
            Err(err) => report(Some(gid), &err),
        }
        return Ok(());
    }

    if let Some(rest) = line.strip_prefix("reset ") {
        let Some((gid, _)) = split_group(rest.trim()) else {
            eprintln!("usage: reset <group>");
            return Ok(());
        };
        if let Err(err) = manager.reset(gid) {
            report(Some(gid), &err);
        }
        return Ok(());
    }

    let Some((gid, text)) = split_group(line) else {
        eprintln!("usage: <group> <text>");
        return Ok(());
    };
    match manager.build_secured_message(gid, text.as_bytes()) {
        Ok(pdu) => send_pdu(bus, manager, frame_id, &pdu).await?,
        Err(err) => report(Some(gid), &err),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_group() {
        assert_eq!(split_group("1 LOCK"), Some((GroupId::new(1), "LOCK")));
        assert_eq!(split_group("7"), Some((GroupId::new(7), "")));
        assert_eq!(split_group("x LOCK"), None);
        assert_eq!(split_group("70000 LOCK"), None);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["busseal", "keygen", "--group", "1", "--members", "1,2"])
            .unwrap();
        match cli.command {
            Commands::Keygen { group, members } => {
                assert_eq!(group, Some(1));
                assert_eq!(members, vec![1, 2]);
            }
            _ => panic!("expected keygen"),
        }
    }
}
