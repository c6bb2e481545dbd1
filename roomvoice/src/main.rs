mod audio_io;
mod control;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use roomvoice_cluster::{transport_from_config, RoomMessageHub};
use roomvoice_core::{logging, Config, Identity, ParticipantId, RoomName, SessionDeps, VoiceSession};
use roomvoice_rtc::WebRtcPeerFactory;

use audio_io::{CpalMicrophone, CpalSpeaker};
use control::{Control, HELP};

#[derive(Debug, Parser)]
#[command(name = "roomvoice", version, about = "Peer-to-peer voice chat for rooms")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "ROOMVOICE_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Join a room and talk until `q` or Ctrl-C
    Join {
        #[arg(short, long)]
        room: String,
        /// Participant id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Validate and print the effective configuration
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = Config::load(path)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (fail fast on misconfigurations)
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Join {
            room,
            id,
            name,
            avatar,
        } => {
            // 2. Initialize logging
            logging::init_logging(&config.logging)?;
            info!("RoomVoice starting...");

            let id = id.map_or_else(ParticipantId::new, ParticipantId::from);
            let mut identity = Identity::new(id, name);
            if let Some(avatar) = avatar {
                identity = identity.with_avatar(avatar);
            }
            run(config, RoomName::from(room), identity).await
        }
    }
}

async fn run(config: Config, room: RoomName, identity: Identity) -> Result<()> {
    // 3. Wire the session's collaborators
    let hub = RoomMessageHub::new();
    let deps = SessionDeps {
        signaling: transport_from_config(&config.signaling, &hub)?,
        peers: Arc::new(WebRtcPeerFactory::new(&config.rtc)?),
        media: Arc::new(CpalMicrophone),
        output: Some(Arc::new(CpalSpeaker::new())),
    };
    let session = VoiceSession::new(config.voice.clone(), deps);

    // 4. Join the room
    if let Err(e) = session.connect(room.clone(), identity.clone()).await {
        eprintln!("Failed to join {room}: {e}");
        return Err(e.into());
    }
    println!("Joined {room} as {} ({})", identity.name, identity.id);
    println!("{HELP}");

    // 5. Run controls until quit, Ctrl-C or a fatal session error
    let mut participants = session.participants();
    let mut errors = session.error();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, leaving room");
                break;
            }
            changed = participants.changed() => {
                if changed.is_err() {
                    break;
                }
                print_participants(&participants.borrow_and_update());
            }
            changed = errors.changed() => {
                if changed.is_err() {
                    break;
                }
                let error = errors.borrow_and_update().clone();
                if let Some(error) = error {
                    eprintln!("Error: {error}");
                    if !session.is_connected() {
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // stdin closed; stay until Ctrl-C
                    tokio::signal::ctrl_c().await?;
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Control>() {
                    Ok(Control::Quit) => break,
                    Ok(control) => apply(&session, control).await,
                    Err(e) => eprintln!("{e}\n{HELP}"),
                }
            }
        }
    }

    // 6. Leave
    session.disconnect().await;
    info!("RoomVoice stopped");
    Ok(())
}

async fn apply(session: &VoiceSession, control: Control) {
    match control {
        Control::ToggleMute => {
            let muted = session.toggle_mute();
            println!("{}", if muted { "muted" } else { "unmuted" });
        }
        Control::Volume(percent) => {
            session.set_volume(percent);
            println!("volume {}", session.volume());
        }
        Control::ResumeAudio => {
            if let Err(e) = session.resume_audio().await {
                warn!(error = %e, "Failed to resume audio");
            }
        }
        Control::Foreground => {
            if let Err(e) = session.on_foreground().await {
                warn!(error = %e, "Failed to handle foreground");
            }
        }
        Control::Stats => match serde_json::to_string_pretty(&session.stats().await) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "Failed to encode stats"),
        },
        Control::Participants => print_participants(&session.snapshot()),
        Control::Help => println!("{HELP}"),
        Control::Quit => {}
    }
}

fn print_participants(participants: &[roomvoice_core::VoiceParticipant]) {
    println!("-- {} in room --", participants.len());
    for p in participants {
        let mut flags = Vec::new();
        if p.is_speaking {
            flags.push("speaking");
        }
        if p.is_muted {
            flags.push("muted");
        }
        if !p.has_stream {
            flags.push("connecting");
        }
        println!("  {} ({}) {}", p.name, p.id, flags.join(" "));
    }
}
