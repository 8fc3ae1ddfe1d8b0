//! radionet node binary.
//!
//! Runs one sensor, repeater or gateway engine on a host. Nodes on the same
//! host or LAN share a UDP multicast group as their radio; a gateway also
//! serves the controller text bridge over TCP.

use clap::Parser;
use radionet_node::{MessageHandler, Node, NodeState, Role, SystemClock};
use radionet_routing::RouterStats;
use radionet_storage::{open_store, StorageMode};
use radionet_wire::{parse_from_text, render_as_text, Message};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod bridge;
mod config;
mod logging;
mod udp_radio;

use config::{parse_role, RadioNetConfig};
use logging::RadioLogFormatter;
use udp_radio::UdpRadio;

/// How often the engine loop publishes a snapshot
const SNAPSHOT_EVERY: Duration = Duration::from_secs(1);

/// radionet node on a simulated radio
#[derive(Parser, Debug)]
#[command(name = "radionet", version, about = "Tree-mesh radio node over UDP multicast")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "radionet.yaml")]
    config: PathBuf,

    /// Role: sensor, repeater or gateway
    #[arg(long)]
    role: Option<String>,

    /// Static node id (otherwise requested from the controller)
    #[arg(long)]
    node_id: Option<u8>,

    /// Static parent (disables parent discovery)
    #[arg(long)]
    parent_id: Option<u8>,

    /// Persist node state in this image file
    #[arg(long)]
    storage_file: Option<PathBuf>,

    /// Controller bridge listen address (gateway only), e.g. 127.0.0.1:5003
    #[arg(long)]
    bridge_listen: Option<std::net::SocketAddr>,

    /// UDP port of the multicast radio
    #[arg(long)]
    radio_port: Option<u16>,

    /// Let the gateway hand out node ids itself
    #[arg(long)]
    assign_ids: bool,

    /// Reply timeout for parent search and id requests, e.g. 2s
    #[arg(long)]
    reply_timeout: Option<humantime::Duration>,

    /// Stats log interval, e.g. 60s (0s disables)
    #[arg(long)]
    stats_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Flags win over file and environment
    fn apply(&self, config: &mut RadioNetConfig) -> anyhow::Result<()> {
        if let Some(role) = &self.role {
            config.node.role =
                parse_role(role).ok_or_else(|| anyhow::anyhow!("Invalid role: {}. Use sensor, repeater or gateway", role))?;
        }
        if let Some(id) = self.node_id {
            config.node.node_id = Some(id);
        }
        if let Some(parent) = self.parent_id {
            config.node.parent_node_id = Some(parent);
        }
        if let Some(path) = &self.storage_file {
            config.storage = StorageMode::File {
                path: path.clone(),
                fsync_every: 1,
            };
        }
        if let Some(listen) = self.bridge_listen {
            config.bridge.listen = listen;
        }
        if let Some(port) = self.radio_port {
            config.radio.port = port;
        }
        if self.assign_ids {
            config.node.assign_ids = true;
        }
        if let Some(timeout) = self.reply_timeout {
            config.node.reply_timeout_ms = Duration::from(timeout).as_millis() as u64;
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval_secs = Duration::from(interval).as_secs();
        }
        Ok(())
    }
}

/// What the engine loop reports to the async side
#[derive(Debug, Clone)]
struct EngineSnapshot {
    state: NodeState,
    node_id: u8,
    parent: u8,
    distance: u8,
    routes: usize,
    stats: RouterStats,
}

/// Delivers engine output: bridge lines on a gateway, log lines elsewhere
struct EngineHandler {
    role: Role,
    to_controller: Option<mpsc::UnboundedSender<String>>,
}

impl MessageHandler for EngineHandler {
    fn on_message(&mut self, msg: &Message) {
        match &self.to_controller {
            Some(tx) => {
                if tx.send(render_as_text(msg)).is_err() {
                    warn!("Controller bridge is gone, dropping {}", render_as_text(msg).trim_end());
                }
            }
            None => info!("{} received {}", self.role, render_as_text(msg).trim_end()),
        }
    }

    fn on_time(&mut self, seconds: u32) {
        info!("Controller time: {}", seconds);
    }
}

/// Drive the engine until `stop` is set or the engine halts
fn run_engine(
    config: RadioNetConfig,
    radio: UdpRadio,
    mut from_controller: mpsc::UnboundedReceiver<String>,
    to_controller: Option<mpsc::UnboundedSender<String>>,
    snapshots: watch::Sender<Option<EngineSnapshot>>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let store = open_store(&config.storage)?;
    let role = config.node.role;
    let handler = EngineHandler { role, to_controller };
    let mut node = Node::new(config.node, radio, store, SystemClock::new(), handler)?;

    node.begin()?;
    info!(
        "{} is {:?}: id={} parent={} distance={}",
        role,
        node.state(),
        node.node_id(),
        node.parent_node_id(),
        node.distance()
    );

    let mut last_snapshot: Option<Instant> = None;
    while !stop.load(Ordering::SeqCst) {
        let mut busy = false;

        while let Ok(line) = from_controller.try_recv() {
            busy = true;
            match parse_from_text(&line) {
                Ok(msg) => {
                    node.send_route(msg)?;
                }
                Err(e) => warn!("Dropping bridge line {:?}: {}", line, e),
            }
        }

        busy |= node.pump()?;

        if last_snapshot.map_or(true, |at| at.elapsed() >= SNAPSHOT_EVERY) {
            let _ = snapshots.send(Some(EngineSnapshot {
                state: node.state(),
                node_id: node.node_id(),
                parent: node.parent_node_id(),
                distance: node.distance(),
                routes: node.routes().len(),
                stats: node.stats().clone(),
            }));
            last_snapshot = Some(Instant::now());
        }

        if node.state() == NodeState::Halted {
            anyhow::bail!("engine halted");
        }
        if !busy {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    info!("Engine stopped");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for krate in ["radionet", "radionet_wire", "radionet_storage", "radionet_routing", "radionet_node"] {
        env_filter = env_filter.add_directive(format!("{}={}", krate, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(RadioLogFormatter::new("radionet"))
        .init();

    info!("Starting radionet v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RadioNetConfig::load_from_file(&args.config)?;
    args.apply(&mut config)?;
    let role = config.node.role;

    let radio = UdpRadio::open(&config.radio)?;

    let (to_engine, from_controller) = mpsc::unbounded_channel::<String>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (snapshot_tx, snapshot_rx) = watch::channel::<Option<EngineSnapshot>>(None);

    // Controller bridge
    let (to_controller, bridge_task) = if role.is_gateway() {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let listener = TcpListener::bind(config.bridge.listen).await?;
        let task = tokio::spawn(bridge::serve(listener, to_engine.clone(), rx, shutdown_rx.clone()));
        (Some(tx), Some(task))
    } else {
        (None, None)
    };

    // Periodic stats
    let stats_task = if config.stats_interval_secs > 0 {
        let mut snapshot_rx = snapshot_rx.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.stats_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(s) = snapshot_rx.borrow_and_update().clone() {
                            component_info!(
                                "stats",
                                "{:?} id={} parent={} distance={} routes={} sent={} forwarded={} local={} dropped={} failures={}",
                                s.state,
                                s.node_id,
                                s.parent,
                                s.distance,
                                s.routes,
                                s.stats.frames_sent,
                                s.stats.frames_forwarded,
                                s.stats.frames_local,
                                s.stats.frames_dropped,
                                s.stats.send_failures
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut engine = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            run_engine(config, radio, from_controller, to_controller, snapshot_tx, stop)
        })
    };
    drop(to_engine);

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            stop.store(true, Ordering::SeqCst);
            engine.await
        }
        result = &mut engine => result,
    };

    let _ = shutdown_tx.send(true);
    if let Some(task) = bridge_task {
        match task.await {
            Ok(Err(e)) => warn!("Bridge ended with error: {}", e),
            Err(e) => warn!("Bridge task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    if let Some(task) = stats_task {
        let _ = task.await;
    }

    match outcome {
        Ok(Ok(())) => {
            info!("radionet stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Engine failed: {:#}", e);
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("engine task failed: {}", e)),
    }
}
