//! Group call client binary
//!
//! Joins a signaling hub as one identity and either starts a call in a group
//! or waits for incoming calls.
//!
//! # Usage
//!
//! ```bash
//! # Start a video call in a group
//! cargo run --bin group_call -- \
//!   --identity alice \
//!   --hub-url ws://localhost:8080 \
//!   --call team-standup --kind video
//!
//! # Wait for calls and accept them automatically
//! cargo run --bin group_call -- --identity bob --auto-accept
//!
//! # Fetch ICE credentials from a REST endpoint
//! cargo run --bin group_call -- \
//!   --identity carol \
//!   --ice-endpoint https://example.com/ice --ice-token secret
//! ```

use clap::Parser;
use group_call::{
    CallHandle, CallKind, CallNotice, CallRuntime, CallServices, GroupCallConfig,
    GroupCallOrchestrator, IceServerProvider, RtcConnectionFactory, StaticSampleDevices,
    TurnServerConfig, VideoCodec, WsSignalingClient,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh group call client
///
/// Connects to a JSON-RPC signaling hub and runs one participant of a
/// peer-to-peer group call.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local identity on the hub
    #[arg(short, long, env = "GROUP_CALL_IDENTITY")]
    identity: String,

    /// JSON configuration file; CLI flags override its values
    #[arg(long, env = "GROUP_CALL_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling hub URL
    #[arg(long, env = "GROUP_CALL_HUB_URL")]
    hub_url: Option<String>,

    /// Start a call in this group
    #[arg(long)]
    call: Option<String>,

    /// Call kind when starting: audio, video
    #[arg(long, default_value = "video")]
    kind: CallKind,

    /// Accept every incoming call
    #[arg(long, default_value_t = false)]
    auto_accept: bool,

    /// ICE credential endpoint
    #[arg(long, env = "GROUP_CALL_ICE_ENDPOINT")]
    ice_endpoint: Option<String>,

    /// Bearer token for the ICE credential endpoint
    #[arg(long, env = "GROUP_CALL_ICE_TOKEN")]
    ice_token: Option<String>,

    /// STUN servers used without an endpoint (comma-separated)
    #[arg(long, value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "GROUP_CALL_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Maximum simultaneous peer links
    #[arg(long, env = "GROUP_CALL_MAX_PEERS")]
    max_peers: Option<u32>,

    /// Video codec: vp8, vp9, h264
    #[arg(long, env = "GROUP_CALL_VIDEO_CODEC")]
    video_codec: Option<VideoCodecArg>,
}

/// Video codec CLI argument wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum VideoCodecArg {
    Vp8,
    Vp9,
    H264,
}

impl From<VideoCodecArg> for VideoCodec {
    fn from(arg: VideoCodecArg) -> Self {
        match arg {
            VideoCodecArg::Vp8 => VideoCodec::VP8,
            VideoCodecArg::Vp9 => VideoCodec::VP9,
            VideoCodecArg::H264 => VideoCodec::H264,
        }
    }
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    // Password may contain colons, so join remaining parts
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

/// Build the client configuration from the optional file and CLI overrides
fn build_config_from_args(args: &Args) -> Result<GroupCallConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            GroupCallConfig::from_json_file(path)?
        }
        None => GroupCallConfig::default(),
    };

    config.local_identity = args.identity.clone();

    if let Some(hub_url) = &args.hub_url {
        config = config.with_hub_url(hub_url);
    }
    if let Some(max_peers) = args.max_peers {
        config = config.with_max_peers(max_peers);
    }
    if let Some(codec) = args.video_codec {
        config.media.video_codec = codec.into();
    }
    if let Some(endpoint) = &args.ice_endpoint {
        config = config.with_ice_endpoint(endpoint, args.ice_token.clone());
    }
    if !args.stun_servers.is_empty() {
        config.ice.stun_servers = args.stun_servers.clone();
    }

    let mut turn_servers = Vec::new();
    for turn_str in &args.turn_servers {
        let turn_config =
            parse_turn_server(turn_str).map_err(|e| format!("Failed to parse TURN server: {}", e))?;
        info!(
            "Adding TURN server: {} (user: {})",
            turn_config.url, turn_config.username
        );
        turn_servers.push(turn_config);
    }
    if !turn_servers.is_empty() {
        config = config.with_turn_servers(turn_servers);
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        eprintln!("\nCtrl+C received, leaving call...");

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("Graceful shutdown timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("group-call-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = build_config_from_args(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        identity = %config.local_identity,
        hub_url = %config.hub_url,
        max_peers = config.max_peers,
        ice_endpoint = ?config.ice.endpoint_url,
        stun_servers = config.ice.stun_servers.len(),
        turn_servers = config.ice.turn_servers.len(),
        video_codec = ?config.media.video_codec,
        "Group call client starting"
    );

    let (signaling, hub_events) = WsSignalingClient::connect(
        &config.hub_url,
        Duration::from_millis(config.rpc_timeout_ms),
    )
    .await?;
    let signaling = Arc::new(signaling);

    let services = CallServices {
        signaling: signaling.clone(),
        ice: Arc::new(IceServerProvider::from_config(&config.ice)?),
        devices: Arc::new(StaticSampleDevices),
        connections: Arc::new(RtcConnectionFactory::new()),
    };

    let (orchestrator, link_events) = GroupCallOrchestrator::new(&config, services)?;
    let (call, task) = CallRuntime::spawn(orchestrator, link_events, hub_events);

    tokio::spawn(watch_notices(call.clone(), args.auto_accept));

    if let Some(group) = &args.call {
        match call.start_call(group, args.kind).await {
            Ok(()) => info!("Calling group {}", group),
            Err(e) => warn!("Failed to start call: {}", e),
        }
    }

    info!("Client running. Press Ctrl+C to leave.");

    while !shutdown_flag.load(Ordering::SeqCst) && !task.is_finished() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, leaving call...");

    if let Err(e) = call.leave_call().await {
        warn!("Error leaving call: {}", e);
    }
    call.shutdown();
    task.await?;
    signaling.close();

    info!("Group call client shut down gracefully");
    Ok(())
}

async fn watch_notices(call: CallHandle, auto_accept: bool) {
    let mut notices = call.store().notices();

    while let Ok(notice) = notices.recv().await {
        match notice {
            CallNotice::IncomingCall(incoming) => {
                info!(
                    "Incoming {} call {} from {}",
                    incoming.kind, incoming.call_id, incoming.caller_identity
                );
                if auto_accept {
                    if let Err(e) = call.accept_call().await {
                        warn!("Failed to accept call: {}", e);
                    }
                }
            }
            CallNotice::IncomingCallCancelled { call_id } => {
                info!("Call {} was cancelled by the caller", call_id);
            }
            CallNotice::RosterEmptied => {
                info!("Everyone else left the call");
            }
            CallNotice::StartFailed(reason) => {
                warn!("Call setup failed: {}", reason);
            }
            CallNotice::CallEnded => {
                info!("Call ended");
            }
        }

        let snapshot = call.snapshot();
        info!(
            lifecycle = ?snapshot.lifecycle(),
            participants = ?snapshot.usernames(),
            "Call state"
        );
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
