//! run CLI command.
//!
//! Wires the exit engine to its collaborators and runs it until Ctrl+C.
//! Entries, market data and order updates arrive as JSON lines from
//! `--events` (a recorded session or a bridge process writing to a FIFO).
//! An `open` line records a pending position; later lines refer to it by the
//! id the store assigns, which counts up from 1 on the in-memory store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use algo_trade_core::{
    ConfigWatcher, MarketTick, NewPosition, OrderUpdate, PositionStore, UnderlyingSignal,
};
use algo_trade_options_manager::feed::SubscriptionSet;
use algo_trade_options_manager::ledger::PositionLedger;
use algo_trade_options_manager::paper::DisconnectedGateway;
use algo_trade_options_manager::store::{MemoryPositionStore, PgPositionStore};
use algo_trade_options_manager::{Collaborators, InMemoryTier1, Inputs, OptionsManager};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use super::load_config;

const EVENT_BUFFER: usize = 1024;

/// Arguments for the run command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Profile overlay (e.g. "paper" loads Config.paper.toml on top)
    #[arg(short, long)]
    pub profile: Option<String>,

    /// JSON-lines file of entries, ticks, order updates and underlying signals
    #[arg(long)]
    pub events: Option<PathBuf>,

    /// Do not reload the config file when it changes
    #[arg(long)]
    pub no_watch: bool,
}

/// One line of the event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundEvent {
    /// Entry order placed.
    Open {
        position: NewPosition,
        timestamp: DateTime<Utc>,
    },
    Tick(MarketTick),
    OrderUpdate(OrderUpdate),
    Underlying(UnderlyingSignal),
}

struct EventSenders {
    ledger: Arc<PositionLedger>,
    ticks: mpsc::Sender<MarketTick>,
    order_updates: mpsc::Sender<OrderUpdate>,
    underlying: mpsc::Sender<UnderlyingSignal>,
}

impl EventSenders {
    async fn send(&self, event: InboundEvent) -> Result<()> {
        let sent = match event {
            InboundEvent::Open {
                position,
                timestamp,
            } => {
                // Opens go straight to the ledger so the position exists
                // before any later line refers to it.
                match self.ledger.open(position, timestamp).await {
                    Ok(opened) => tracing::info!(position_id = opened.id, "Entry recorded"),
                    Err(e) => tracing::warn!(error = %e, "Entry rejected"),
                }
                true
            }
            InboundEvent::Tick(tick) => self.ticks.send(tick).await.is_ok(),
            InboundEvent::OrderUpdate(update) => self.order_updates.send(update).await.is_ok(),
            InboundEvent::Underlying(signal) => self.underlying.send(signal).await.is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(anyhow!("engine stopped consuming events"))
        }
    }
}

/// Runs the engine until Ctrl+C.
///
/// # Errors
/// Returns an error if the config is invalid, the store is unreachable, or
/// an engine task fails.
pub async fn run_engine(args: RunArgs) -> Result<()> {
    let config = load_config(&args.config, args.profile.as_deref())?;

    let store: Arc<dyn PositionStore> = match &config.database.url {
        Some(url) => {
            let store = PgPositionStore::connect(url, config.database.max_connections).await?;
            tracing::info!("Connected to database");
            Arc::new(store)
        }
        None => {
            tracing::warn!("No database.url configured, positions are kept in memory");
            Arc::new(MemoryPositionStore::new())
        }
    };

    let (watcher, config_rx) = ConfigWatcher::new(config);
    if args.profile.is_none() && !args.no_watch {
        let path = args.config.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.watch(&path).await {
                tracing::error!(error = %e, "Config watcher stopped");
            }
        });
    }

    let manager = OptionsManager::new(
        Collaborators {
            store,
            tier1: Arc::new(InMemoryTier1::new()),
            feed: Arc::new(SubscriptionSet::new()),
            // Paper positions fill internally; live exits wait for a broker.
            gateway: Arc::new(DisconnectedGateway),
        },
        config_rx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let (tick_tx, ticks) = mpsc::channel(EVENT_BUFFER);
    let (update_tx, order_updates) = mpsc::channel(EVENT_BUFFER);
    let (underlying_tx, underlying) = mpsc::channel(EVENT_BUFFER);
    let senders = EventSenders {
        ledger: manager.ledger.clone(),
        ticks: tick_tx,
        order_updates: update_tx,
        underlying: underlying_tx,
    };
    tokio::spawn(forward_events(args.events, senders, shutdown_rx.clone()));

    manager
        .run(
            Inputs {
                ticks,
                order_updates,
                underlying,
            },
            shutdown_rx,
        )
        .await?;

    let metrics = manager.metrics.snapshot();
    tracing::info!(
        submitted = metrics.exits_submitted,
        completed = metrics.exits_completed,
        reconcile_passes = metrics.reconcile_passes,
        "Engine stopped"
    );
    Ok(())
}

/// Replays `path` into the engine, then holds the inputs open until
/// shutdown so the engine keeps running on its own loops.
async fn forward_events(
    path: Option<PathBuf>,
    senders: EventSenders,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(path) = path {
        match replay(&path, &senders).await {
            Ok(count) => tracing::info!(events = count, path = %path.display(), "Event replay finished"),
            Err(e) => tracing::error!(error = %e, "Event replay stopped"),
        }
    }
    let _ = shutdown.wait_for(|stop| *stop).await;
    drop(senders);
}

async fn replay(path: &Path, senders: &EventSenders) -> Result<usize> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut line_no = 0usize;
    let mut forwarded = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_line(&line) {
            Ok(Some(event)) => {
                senders.send(event).await?;
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(line = line_no, error = %e, "Skipping malformed event"),
        }
    }
    Ok(forwarded)
}

/// Blank lines and `#` comments carry no event.
fn parse_line(line: &str) -> Result<Option<InboundEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}
