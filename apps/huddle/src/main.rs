use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use huddle::link::{PeerLinkFactory, WebRtcLinkConfig, WebRtcLinkFactory};
use huddle::model::{Participant, ParticipantId, RoomId};
use huddle::reconciler::ReconcileConfig;
use huddle::session::{self, RoomEvent, RoomSession};
use huddle::store::{HttpRoomStore, RoomStore};
use huddle::telemetry::{self, LogConfig, LogLevel};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    let _log_guard = telemetry::init(&log_config).context("logging setup failed")?;
    debug!(store = %cli.store, "huddle starting");

    let store: Arc<dyn RoomStore> =
        Arc::new(HttpRoomStore::new(&cli.store).context("invalid store url")?);

    match cli.command {
        Command::Rooms => {
            let rooms = session::list_rooms(store.as_ref()).await?;
            if rooms.is_empty() {
                println!("no rooms");
            }
            for room in rooms {
                println!("{}  {}", room.id, room.name);
            }
            Ok(())
        }
        Command::Host(args) => {
            let local = local_participant(cli.identity, &args.common.alias);
            let links = link_factory(&args.common);
            let config = args.common.timing.to_config();
            let session = RoomSession::create(store, links, local, &args.name, config).await?;
            println!("room {} created as {}", session.room(), session.local().id);
            attend(session, &args.common.invite).await
        }
        Command::Join(args) => {
            let local = local_participant(cli.identity, &args.common.alias);
            let links = link_factory(&args.common);
            let config = args.common.timing.to_config();
            let room = RoomId::new(args.room);
            let session = RoomSession::join(store, links, local, room, config).await?;
            println!("joined room {} as {}", session.room(), session.local().id);
            attend(session, &args.common.invite).await
        }
    }
}

/// Send any requested invites, then print room events until interrupted.
async fn attend(session: RoomSession, invites: &[String]) -> anyhow::Result<()> {
    for spec in invites {
        let peer = parse_invite(spec)?;
        session.invite(peer).await?;
    }

    let mut events = session
        .events()
        .context("event stream already taken")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }
    session.leave();
    info!(target: "session", "session ended");
    Ok(())
}

fn print_event(event: &RoomEvent) {
    match event {
        RoomEvent::OfferPublished { peer } => println!("offer sent to {peer}"),
        RoomEvent::AnswerPublished { peer } => println!("answered offer from {peer}"),
        RoomEvent::HandshakeCompleted { peer } => println!("handshake with {peer} complete"),
        RoomEvent::TrackReceived { peer, track } => {
            println!("{} track from {peer} ({})", track.kind, track.id)
        }
        RoomEvent::LinkStateChanged { peer, state } => println!("link to {peer}: {state:?}"),
    }
}

fn local_participant(identity: Option<String>, alias: &str) -> Participant {
    let id = match identity {
        Some(id) => ParticipantId::new(id),
        None => ParticipantId::generate(),
    };
    Participant::new(id, alias)
}

fn link_factory(common: &CommonArgs) -> Arc<dyn PeerLinkFactory> {
    let config = WebRtcLinkConfig::with_ice_servers(common.ice_servers.clone());
    Arc::new(WebRtcLinkFactory::new(config))
}

/// `id` or `id:alias`; the alias defaults to the identifier.
fn parse_invite(spec: &str) -> anyhow::Result<Participant> {
    let (id, alias) = match spec.split_once(':') {
        Some((id, alias)) => (id, alias),
        None => (spec, spec),
    };
    if id.is_empty() || alias.is_empty() {
        bail!("invalid invite {spec:?}: expected ID or ID:ALIAS");
    }
    Ok(Participant::new(id, alias))
}

#[derive(Parser, Debug)]
#[command(
    name = "huddle",
    about = "Room-based peer-to-peer media rendezvous over a polled store",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "HUDDLE_STORE",
        default_value = "http://127.0.0.1:8790",
        help = "Base URL of the room store"
    )]
    store: String,

    #[arg(
        long,
        global = true,
        env = "HUDDLE_IDENTITY",
        help = "Opaque local identifier (generated when omitted)"
    )]
    identity: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "HUDDLE_LOG_LEVEL",
        default_value = "warn",
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "HUDDLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the rooms visible on the store
    Rooms,
    /// Create a room and reconcile it until interrupted
    Host(HostArgs),
    /// Join an existing room and reconcile it until interrupted
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct HostArgs {
    /// Display name for the new room
    name: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Identifier of the room to join
    room: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CommonArgs {
    #[arg(
        long,
        env = "HUDDLE_ALIAS",
        default_value = "anonymous",
        help = "Display alias for the local participant"
    )]
    alias: String,

    /// Peer to offer to directly, as ID or ID:ALIAS; repeatable
    #[arg(long = "invite", value_name = "PEER")]
    invite: Vec<String>,

    /// ICE server URL; repeatable, defaults to a public STUN server
    #[arg(long = "ice-server", value_name = "URL")]
    ice_servers: Vec<String>,

    #[command(flatten)]
    timing: TimingArgs,
}

#[derive(Args, Debug, Clone)]
struct TimingArgs {
    #[arg(
        long,
        value_name = "MS",
        default_value_t = 5000,
        help = "Milliseconds between reconcile passes"
    )]
    tick_interval: u64,

    #[arg(
        long,
        value_name = "MS",
        default_value_t = 2000,
        help = "Milliseconds to gather candidates before publishing"
    )]
    settle_delay: u64,

    #[arg(
        long,
        value_name = "MS",
        default_value_t = 1000,
        help = "Milliseconds between answer polls"
    )]
    answer_poll_interval: u64,
}

impl TimingArgs {
    fn to_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            tick_interval: Duration::from_millis(self.tick_interval),
            settle_delay: Duration::from_millis(self.settle_delay),
            answer_poll_interval: Duration::from_millis(self.answer_poll_interval),
        }
    }
}
