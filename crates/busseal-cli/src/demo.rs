//! Two-node demonstration on an in-process bus.
//!
//! A door controller and a body controller share one group. The controller
//! opens the session, then sends status commands the body controller applies
//! to its vehicle state. Finally an attacker replays a captured frame.

use anyhow::Context;
use busseal_core::{GroupConfig, GroupId, KeyStore, NodeId, SessionConfig, SessionManager};
use busseal_crypto::OsRandom;
use busseal_crypto::random::random_array;
use busseal_transport::{BusTransport, MemoryBus, MemoryPort};
use console::style;
use std::sync::Arc;

const GROUP: GroupId = GroupId::new(1);
const CONTROLLER: NodeId = NodeId::new(1);
const BODY: NodeId = NodeId::new(2);

/// Application commands carried as secured payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Lock all doors
    Lock,
    /// Unlock all doors
    Unlock,
    /// Turn signal on one side, or off
    Turn(Signal),
    /// Report vehicle speed in km/h
    Speed(u8),
}

/// Turn signal setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Left indicator
    Left,
    /// Right indicator
    Right,
    /// Indicators off
    Off,
}

impl Command {
    /// Encode as a payload
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        match self {
            Self::Lock => b"LOCK".to_vec(),
            Self::Unlock => b"UNLOCK".to_vec(),
            Self::Turn(Signal::Left) => b"TURN L".to_vec(),
            Self::Turn(Signal::Right) => b"TURN R".to_vec(),
            Self::Turn(Signal::Off) => b"TURN -".to_vec(),
            Self::Speed(kmh) => {
                let mut out = b"SPEED ".to_vec();
                out.push(kmh);
                out
            }
        }
    }

    /// Decode a payload
    #[must_use]
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match payload {
            b"LOCK" => Some(Self::Lock),
            b"UNLOCK" => Some(Self::Unlock),
            b"TURN L" => Some(Self::Turn(Signal::Left)),
            b"TURN R" => Some(Self::Turn(Signal::Right)),
            b"TURN -" => Some(Self::Turn(Signal::Off)),
            [b'S', b'P', b'E', b'E', b'D', b' ', kmh] => Some(Self::Speed(*kmh)),
            _ => None,
        }
    }
}

/// State held by the receiving controller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleState {
    /// Doors locked
    pub locked: bool,
    /// Active turn signal
    pub signal: Option<Signal>,
    /// Last reported speed
    pub speed: u8,
}

impl VehicleState {
    /// Apply a command
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Lock => self.locked = true,
            Command::Unlock => self.locked = false,
            Command::Turn(Signal::Off) => self.signal = None,
            Command::Turn(side) => self.signal = Some(side),
            Command::Speed(kmh) => self.speed = kmh,
        }
    }
}

struct Node {
    name: &'static str,
    manager: SessionManager,
    port: MemoryPort,
    frame_id: u32,
}

impl Node {
    async fn send(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.port.send_frame(self.frame_id, frame).await?;
        Ok(())
    }

    /// Receive one frame and feed it to the manager, sending any reaction.
    async fn pump(&self) -> anyhow::Result<busseal_core::Result<Option<Vec<u8>>>> {
        let frame = self.port.recv_frame().await?;
        match self.manager.process_received(&frame.data) {
            Ok(received) => {
                if let Some(reaction) = received.reaction {
                    self.send(&self.manager.pack(&reaction)?).await?;
                }
                Ok(Ok(received.message.map(|m| m.plaintext)))
            }
            Err(err) => Ok(Err(err)),
        }
    }
}

/// Run the demonstration.
///
/// # Errors
///
/// Returns an error if any protocol step that should succeed fails.
pub async fn run() -> anyhow::Result<()> {
    let key: [u8; 32] = random_array(&OsRandom).context("cannot generate group key")?;
    let group = GroupConfig {
        id: u32::from(GROUP.as_u16()),
        long_term_key: key.to_vec(),
        members: vec![CONTROLLER.as_u8(), BODY.as_u8()],
    };
    let keystore = Arc::new(KeyStore::from_configs([&group])?);

    let bus = MemoryBus::new(16);
    let attacker = bus.port();
    let controller = Node {
        name: "controller",
        manager: SessionManager::new(CONTROLLER, Arc::clone(&keystore), SessionConfig::default()),
        port: bus.port(),
        frame_id: 0x101,
    };
    let body = Node {
        name: "body",
        manager: SessionManager::new(BODY, keystore, SessionConfig::default()),
        port: bus.port(),
        frame_id: 0x102,
    };

    println!("{}", style("BusSeal demo").bold());
    println!("group {GROUP}, nodes {CONTROLLER} and {BODY}\n");

    let request = controller.manager.build_request(GROUP)?;
    controller.send(&controller.manager.pack(&request)?).await?;
    println!(
        "{} -> request (session {})",
        controller.name, request.session_id
    );

    body.pump().await?.context("body rejected the request")?;
    println!("{} -> response", body.name);
    controller
        .pump()
        .await?
        .context("controller rejected the response")?;
    println!(
        "{} session established\n",
        style("✓").green().bold()
    );

    let commands = [
        Command::Unlock,
        Command::Turn(Signal::Left),
        Command::Speed(50),
        Command::Turn(Signal::Off),
        Command::Lock,
    ];
    let mut state = VehicleState::default();
    let mut captured = Vec::new();

    for command in commands {
        let pdu = controller
            .manager
            .build_secured_message(GROUP, &command.encode())?;
        let frame = controller.manager.pack(&pdu)?;
        controller.send(&frame).await?;
        captured.clone_from(&frame);

        let plaintext = body
            .pump()
            .await?
            .context("body rejected a secured frame")?
            .context("secured frame carried no message")?;
        let decoded = Command::decode(&plaintext).context("unknown command")?;
        state.apply(decoded);
        println!(
            "{} {:?}  ({} bytes on the bus) -> {:?}",
            style("→").cyan(),
            decoded,
            frame.len(),
            state
        );
    }

    println!("\nattacker replays the last frame");
    attacker.send_frame(controller.frame_id, &captured).await?;
    match body.pump().await? {
        Err(err) => println!("{} rejected: {err}", style("✗").red().bold()),
        Ok(_) => anyhow::bail!("replayed frame was accepted"),
    }

    let mut forged = captured;
    let counter_at = body.manager.codec().header_len();
    forged[counter_at..counter_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
    println!("attacker forges a frame with a fresh counter");
    attacker.send_frame(controller.frame_id, &forged).await?;
    match body.pump().await? {
        Err(err) => println!("{} rejected: {err}", style("✗").red().bold()),
        Ok(_) => anyhow::bail!("forged frame was accepted"),
    }

    Ok(())
}
