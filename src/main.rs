//! sweepbot entry point
//!
//! Wires config from flags and environment, attaches log and trade-log
//! observers to the event bus, and runs the engine against either the
//! in-process simulated venue or a replay file of recorded ticks.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sweepbot::events::{EventKind, EngineEvent};
use sweepbot::{Engine, EngineConfig, ExecutionMode, SimVenue, Tick};

#[derive(Parser, Debug)]
#[command(name = "sweepbot", about = "Liquidity-sweep futures trading engine")]
struct Args {
    /// Trade live instead of in simulation
    #[arg(long)]
    live: bool,

    /// Symbols to trade
    #[arg(long, default_value = "NQ.c.0", value_delimiter = ',')]
    symbols: Vec<String>,

    /// Directory for durable state snapshots
    #[arg(long, env = "SWEEPBOT_STATE_DIR", default_value = "state")]
    state_dir: PathBuf,

    /// Starting equity for risk tracking
    #[arg(long, env = "SWEEPBOT_EQUITY", default_value_t = 50_000.0)]
    equity: f64,

    /// Prior-session high override (derived from overnight candles when omitted)
    #[arg(long)]
    session_high: Option<f64>,

    /// Prior-session low
    #[arg(long)]
    session_low: Option<f64>,

    /// Replay a JSON file of recorded ticks instead of streaming
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.live {
        // The VenueClient seam is where a live adapter plugs in
        bail!("no live venue adapter is wired; run without --live");
    }

    let config = EngineConfig {
        mode: ExecutionMode::Simulation,
        symbols: args.symbols.clone(),
        state_dir: args.state_dir.clone(),
        starting_equity: args.equity,
        session_high_override: args.session_high,
        session_low_override: args.session_low,
        ..Default::default()
    };

    let venue = Arc::new(SimVenue::new(0.0));
    let mut engine = Engine::new(config, venue.clone())?;

    attach_observers(&engine, &args.state_dir)?;

    engine.start().await?;

    match args.replay {
        Some(path) => replay(&mut engine, venue, &path).await,
        None => {
            let shutdown = engine.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, requesting shutdown");
                    let _ = shutdown.send(true);
                }
            });
            engine.run().await
        }
    }
}

/// Feed recorded ticks through the full decision path, then shut down
async fn replay(engine: &mut Engine, venue: Arc<SimVenue>, path: &PathBuf) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading replay file {}", path.display()))?;
    let ticks: Vec<Tick> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    info!("Replaying {} tick(s) from {}", ticks.len(), path.display());

    use sweepbot::venue::{VenueClient, VenueEvent};
    let mut venue_events = venue.subscribe_events();

    for tick in &ticks {
        venue.set_mark_price(tick.price);
        engine.on_tick(tick).await?;
        // Apply any fills the simulated venue produced for this tick
        while let Ok(event) = venue_events.try_recv() {
            if !matches!(event, VenueEvent::Tick(_)) {
                engine.process_venue_event(&event).await?;
            }
        }
    }
    engine.end_session().await?;

    info!("Replay done: {}", engine.executor().stats().summary());
    engine.shutdown().await
}

/// Log observer plus a CSV trade log under the state directory
fn attach_observers(engine: &Engine, state_dir: &std::path::Path) -> Result<()> {
    let bus = engine.bus();

    bus.subscribe_many(
        &[
            EventKind::SetupDetected,
            EventKind::SetupInvalidated,
            EventKind::SafeModeEntered,
            EventKind::ReconciliationAlert,
        ],
        "log",
        Arc::new(|event| {
            Box::pin(async move {
                match event {
                    EngineEvent::SetupDetected {
                        symbol,
                        entry,
                        stop,
                        target,
                        ..
                    } => info!(
                        "Setup detected on {}: entry {:.2} stop {:.2} target {:.2}",
                        symbol, entry, stop, target
                    ),
                    EngineEvent::SetupInvalidated { symbol, reason, .. } => {
                        info!("Setup on {} invalidated: {}", symbol, reason)
                    }
                    EngineEvent::SafeModeEntered {
                        consecutive_failures,
                    } => error!(
                        "SAFE MODE after {} connection failures; manual clear required",
                        consecutive_failures
                    ),
                    EngineEvent::ReconciliationAlert { symbol, detail } => {
                        error!("RECONCILIATION ALERT on {}: {}", symbol, detail)
                    }
                    _ => {}
                }
                Ok(())
            })
        }),
    );

    let csv_path = state_dir.join("fills.csv");
    if !csv_path.exists() {
        std::fs::create_dir_all(state_dir)?;
        std::fs::write(&csv_path, "time,setup_id,leg,price,quantity\n")?;
    }
    bus.subscribe(
        EventKind::OrderFilled,
        "fill-log",
        Arc::new(move |event| {
            let csv_path = csv_path.clone();
            Box::pin(async move {
                if let EngineEvent::OrderFilled {
                    setup_id,
                    leg,
                    fill_price,
                    quantity,
                    ..
                } = event
                {
                    let mut file = std::fs::OpenOptions::new()
                        .append(true)
                        .open(&csv_path)
                        .with_context(|| format!("opening {}", csv_path.display()))?;
                    writeln!(
                        file,
                        "{},{},{},{:.2},{}",
                        chrono::Utc::now().to_rfc3339(),
                        setup_id,
                        leg,
                        fill_price,
                        quantity
                    )?;
                }
                Ok(())
            })
        }),
    );

    Ok(())
}
