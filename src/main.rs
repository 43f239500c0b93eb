use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use webrtc_meeting::{
    ClientConfig, LocalTrack, MediaKind, MeetingSession, ParticipantId, RtcConnector,
    SessionCommand, SessionContext, SignalingChannel, SystemMediaDevices, TopologyMode,
    TrackSource, WsSignaling,
};

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Parser)]
#[command(name = "meeting-client", about = "Join a mesh video meeting from the terminal")]
struct Cli {
    /// Signaling server URL
    #[arg(long, env = "MEETING_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Participant id; a random one is generated when omitted
    #[arg(long)]
    id: Option<String>,

    #[arg(long, default_value = "guest")]
    name: String,

    /// Join with the microphone only
    #[arg(long)]
    no_video: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new meeting and print its room id
    Create {
        #[arg(long, default_value = "mesh")]
        mode: TopologyMode,
    },
    /// Join an existing meeting
    Join { room_id: String },
}

async fn connect_signaling(url: &str) -> Result<WsSignaling> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match WsSignaling::connect(url).await {
            Ok(signaling) => return Ok(signaling),
            Err(e) if attempt < MAX_CONNECT_ATTEMPTS => {
                warn!("signaling connect attempt {} failed: {}", attempt, e);
                sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS * attempt as u64)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("could not reach signaling server {url}"))
            }
        }
    }
}

/// Reads simple commands from stdin: `mic`, `cam`, `share`, `unshare`, `quit`.
fn spawn_console(commands: mpsc::Sender<SessionCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let command = match line.trim() {
                "mic" => SessionCommand::ToggleTrack(MediaKind::Audio),
                "cam" => SessionCommand::ToggleTrack(MediaKind::Video),
                "share" => SessionCommand::StartScreenShare(LocalTrack::new(TrackSource::Screen)),
                "unshare" => SessionCommand::StopScreenShare,
                "quit" => SessionCommand::Leave(None),
                "" => continue,
                other => {
                    println!("unknown command: {other}");
                    continue;
                }
            };
            if commands.send(command).await.is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env().context("invalid configuration")?;
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    if cli.no_video {
        config.request_video = false;
    }

    let signaling: Arc<dyn SignalingChannel> =
        Arc::new(connect_signaling(&config.signaling_url).await?);
    let connector = Arc::new(RtcConnector::new(&config.ice_servers)?);
    let devices = Arc::new(SystemMediaDevices::new().with_camera(config.request_video));

    let user = ParticipantId::new(
        cli.id
            .unwrap_or_else(|| format!("user-{}", rand::random::<u32>())),
    );
    let mut session = MeetingSession::new(SessionContext {
        config,
        signaling,
        connector,
        devices,
        router: None,
    });

    match cli.command {
        Command::Create { mode } => {
            let room_id = session.create_meeting(user.clone(), &cli.name, mode).await?;
            println!("room id: {room_id}");
        }
        Command::Join { room_id } => {
            session.join_meeting(&room_id, user.clone(), &cli.name).await?;
        }
    }
    session.start().await?;
    info!("{} is in the meeting; type mic, cam, share, unshare or quit", user);

    let (commands_tx, commands_rx) = mpsc::channel(16);
    spawn_console(commands_tx.clone());

    let ctrl_c = commands_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let (done_tx, done_rx) = oneshot::channel();
            if ctrl_c.send(SessionCommand::Leave(Some(done_tx))).await.is_ok() {
                let _ = done_rx.await;
            }
        }
    });
    drop(commands_tx);

    session.run(commands_rx).await;
    info!("left the meeting");
    Ok(())
}
