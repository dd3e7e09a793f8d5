//! Terminal shell for the TripSync real-time core.
//!
//! Joins one trip room over WebSocket signaling, prints room activity and
//! sends every stdin line as a chat message. Lines starting with `/` are
//! commands (`/help` lists them).
//!
//! Calls run over webrtc-rs. A terminal has no capture devices, so the
//! shell joins calls with a silent microphone and drains remote media.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use tripsync_core::api::{RosterSource, StaticRoster, TripApi};
use tripsync_core::auth::{AuthContext, StaticAuth};
use tripsync_core::config::{API_URL_VAR, SIGNALING_URL_VAR};
use tripsync_core::events::ConnectionState;
use tripsync_core::location::{FixedLocation, GeoFix};
use tripsync_core::rtc::{DrainSink, SilentDevices, WebRtcFactory};
use tripsync_core::settings::SettingsStore;
use tripsync_core::transport::WsConnector;
use tripsync_core::{
    ClientConfig, RoomBinder, RoomHandle, RoomServices, SessionRegistry, TripEvent,
    TripEventListener,
};

const DEFAULT_LOG_FILTER: &str = "tripsync_core=debug,tripsync_cli=info";

#[derive(Parser, Debug)]
#[command(name = "tripsync")]
#[command(about = "Join a trip room from the terminal")]
struct Args {
    /// Trip room to join
    room: String,

    /// Local participant id
    #[arg(long, env = "TRIPSYNC_PARTICIPANT")]
    participant: String,

    /// Display name; saved for later runs
    #[arg(long)]
    name: Option<String>,

    /// Bearer token for signaling and the trip API
    #[arg(long, env = "TRIPSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Signaling endpoint (http(s) or ws(s))
    #[arg(long, env = "TRIPSYNC_SIGNALING_URL")]
    signaling_url: String,

    /// Trip REST API base URL
    #[arg(long, env = "TRIPSYNC_API_URL")]
    api_url: String,

    /// Skip the REST roster and chat history lookups
    #[arg(long)]
    offline: bool,

    /// Share a fixed position on join, as "lat,lon"
    #[arg(long, value_parser = parse_fix)]
    share: Option<GeoFix>,

    /// Directory holding settings.json
    #[arg(long, default_value = ".tripsync")]
    data_dir: PathBuf,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn parse_fix(input: &str) -> Result<GeoFix, String> {
    let (lat, lon) = input
        .split_once(',')
        .ok_or_else(|| format!("expected \"lat,lon\", got \"{input}\""))?;
    let latitude: f64 = lat.trim().parse().map_err(|_| format!("bad latitude: {lat}"))?;
    let longitude: f64 = lon.trim().parse().map_err(|_| format!("bad longitude: {lon}"))?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(format!("position out of range: {latitude},{longitude}"));
    }
    Ok(GeoFix {
        latitude,
        longitude,
        accuracy_m: None,
    })
}

#[derive(Debug, PartialEq)]
enum Command {
    Say(String),
    Who,
    Where,
    Call,
    Hangup,
    Mute(bool),
    Share(GeoFix),
    Unshare,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    match name {
        "who" => Command::Who,
        "where" => Command::Where,
        "call" => Command::Call,
        "hangup" => Command::Hangup,
        "mute" => Command::Mute(true),
        "unmute" => Command::Mute(false),
        "share" => match parse_fix(arg) {
            Ok(fix) => Command::Share(fix),
            Err(e) => Command::Unknown(e),
        },
        "unshare" => Command::Unshare,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(format!("unknown command /{other}")),
    }
}

const HELP: &str = "/who /where /call /hangup /mute /unmute /share lat,lon /unshare /quit";

struct ConsolePrinter;

impl TripEventListener for ConsolePrinter {
    fn on_event(&self, event: TripEvent) {
        match event {
            TripEvent::ParticipantJoined(p) => {
                let name = p.display_name.as_deref().unwrap_or(&p.participant_id);
                println!("* {name} joined");
            }
            TripEvent::ParticipantLeft(id) => println!("* {id} left"),
            TripEvent::ChatMessageReceived(msg) => println!("[{}] {}", msg.sender_name, msg.text),
            TripEvent::LocationReceived(s) => {
                println!("@ {} at {:.5},{:.5}", s.participant_id, s.latitude, s.longitude)
            }
            TripEvent::ConnectionStateChanged(ConnectionState::Errored { reason }) => {
                println!("! connection lost: {reason}")
            }
            TripEvent::CallStateChanged(state) => println!("* call {state:?}"),
            TripEvent::MediaError(e) => println!("! media: {e}"),
            TripEvent::RemoteTrackAttached { participant_id, track } => {
                println!("* receiving {:?} from {participant_id}", track.kind)
            }
            other => tracing::debug!("event: {other:?}"),
        }
    }
}

async fn run_command(room: &RoomHandle, settings: &SettingsStore, interval: Duration, command: Command) -> bool {
    match command {
        Command::Say(text) => {
            if let Err(e) = room.chat().send_message(&text) {
                println!("! {e}");
            }
        }
        Command::Who => {
            for p in room.presence().roster() {
                let name = p.display_name.as_deref().unwrap_or(&p.participant_id);
                let status = if p.online { "online" } else { "offline" };
                println!("  {name} ({}) {status}", p.color_tag);
            }
        }
        Command::Where => {
            for s in room.location().latest() {
                println!("  {} at {:.5},{:.5}", s.participant_id, s.latitude, s.longitude);
            }
        }
        Command::Call => {
            let constraints = settings.get().call_constraints();
            if let Err(e) = room.mesh().start_call(constraints).await {
                println!("! cannot start call: {e}");
            }
        }
        Command::Hangup => match room.mesh().end_call().await {
            Ok(closed) => println!("* call ended ({closed} link(s))"),
            Err(e) => println!("! {e}"),
        },
        Command::Mute(muted) => {
            if let Err(e) = room.mesh().set_microphone_enabled(!muted).await {
                println!("! {e}");
            }
        }
        Command::Share(fix) => {
            match room.location().start_sharing(Arc::new(FixedLocation(fix)), interval) {
                Ok(()) => settings.set_share_location_on_join(true),
                Err(e) => println!("! {e}"),
            }
        }
        Command::Unshare => {
            room.location().stop_sharing();
            settings.set_share_location_on_join(false);
        }
        Command::Help => println!("{HELP}"),
        Command::Unknown(message) => println!("! {message} ({HELP})"),
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let settings = SettingsStore::new(&args.data_dir);
    if let Some(name) = &args.name {
        settings.set_display_name(Some(name.clone()));
    }
    let display_name = settings
        .get()
        .display_name
        .unwrap_or_else(|| args.participant.clone());

    let config = ClientConfig::from_lookup(|key| match key {
        SIGNALING_URL_VAR => Some(args.signaling_url.clone()),
        API_URL_VAR => Some(args.api_url.clone()),
        other => std::env::var(other).ok(),
    })
    .context("invalid configuration")?;
    let interval = settings
        .get()
        .location_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(config.location_interval);

    let auth: Arc<dyn AuthContext> = Arc::new(StaticAuth::signed_in(
        &args.participant,
        display_name,
        args.token.clone(),
    ));
    let roster: Arc<dyn RosterSource> = if args.offline {
        Arc::new(StaticRoster::default())
    } else {
        Arc::new(TripApi::new(config.api_url.clone(), auth.clone()))
    };
    let peers = WebRtcFactory::new(config.ice_servers.clone()).context("cannot set up webrtc")?;
    let services = RoomServices {
        registry: SessionRegistry::new(Arc::new(WsConnector::default())),
        auth,
        roster,
        peers: Arc::new(peers),
        devices: Arc::new(SilentDevices),
        sink: Arc::new(DrainSink::default()),
    };

    let binder = RoomBinder::new(services, config);
    binder.add_listener(Arc::new(ConsolePrinter));
    let room = binder
        .enter(&args.room)
        .await
        .with_context(|| format!("cannot join room {}", args.room))?;
    tracing::info!("joined {} as {}", args.room, args.participant);

    match args.share {
        Some(fix) => {
            if let Err(e) = room.location().start_sharing(Arc::new(FixedLocation(fix)), interval) {
                println!("! cannot share location: {e}");
            }
        }
        None if settings.get().share_location_on_join => {
            println!("* location sharing was on last time; /share lat,lon to resume");
        }
        None => {}
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !run_command(&room, &settings, interval, parse_command(&line)).await {
                    break;
                }
            }
        }
    }

    binder.exit().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_chat() {
        assert_eq!(parse_command("  hello all "), Command::Say("hello all".into()));
    }

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("/who"), Command::Who);
        assert_eq!(parse_command("/mute"), Command::Mute(true));
        assert_eq!(parse_command("/unmute"), Command::Mute(false));
        assert_eq!(
            parse_command("/share 48.85, 2.35"),
            Command::Share(GeoFix {
                latitude: 48.85,
                longitude: 2.35,
                accuracy_m: None,
            })
        );
        assert!(matches!(parse_command("/share north"), Command::Unknown(_)));
        assert!(matches!(parse_command("/dance"), Command::Unknown(_)));
    }

    #[test]
    fn fix_must_be_in_range() {
        assert!(parse_fix("91,0").is_err());
        assert!(parse_fix("0,181").is_err());
        assert!(parse_fix("45.5,-73.6").is_ok());
    }

    #[test]
    fn args_read_required_flags() {
        let args = Args::try_parse_from([
            "tripsync",
            "trip-42",
            "--participant",
            "alice",
            "--signaling-url",
            "https://signal.example.com/socket",
            "--api-url",
            "https://api.example.com/v1",
            "--share",
            "48.85,2.35",
        ])
        .unwrap();
        assert_eq!(args.room, "trip-42");
        assert_eq!(args.share.map(|f| f.latitude), Some(48.85));
        assert!(!args.offline);
    }
}
