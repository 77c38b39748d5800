mod main_runtime;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use warden::cli::{Cli, Commands};
use warden::config::AppConfig;
use warden::coordination::install_signal_handlers;
use warden::domain::MarketEvent;
use warden::engine::{EventOutcome, SignalOutcome, TradingEngine};
use warden::exchange::PaperExchange;
use warden::persistence::{FileStateStore, StateStore};

use main_runtime::{init_logging, init_logging_simple};

const EVENT_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("loading configuration from {}", cli.config_dir.display()))?;
    if let Some(dir) = &cli.state_dir {
        config.store.dir = dir.clone();
    }

    match &cli.command {
        Commands::CheckConfig => {
            init_logging_simple();
            check_config(&config)
        }
        Commands::Status => {
            init_logging_simple();
            show_status(&config).await
        }
        Commands::Replay { events } => {
            init_logging(&config.logging);
            replay(config, events).await
        }
        Commands::Run => {
            init_logging(&config.logging);
            run(config).await
        }
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            println!("  ✗ {}", e);
        }
        bail!("{} configuration error(s)", errors.len());
    }
    println!("Configuration OK");
    println!("  risk.limits: {:?}", config.risk.limits);
    println!("  sizing.long: {:?}", config.sizing.long);
    println!("  sizing.short: {:?}", config.sizing.short);
    println!("  store.dir: {}", config.store.dir.display());
    Ok(())
}

/// Persisted state only; does not contact an exchange
async fn show_status(config: &AppConfig) -> Result<()> {
    let store = FileStateStore::open(&config.store.dir).await?;
    let state = store.load().await?;
    let realized: Decimal = state.trades.iter().map(|t| t.record.realized_pnl).sum();

    println!("State store: {}", config.store.dir.display());
    match state.last_equity() {
        Some(s) => println!(
            "  equity: {} (open margin {}, at {})",
            s.equity, s.open_margin_used, s.timestamp
        ),
        None => println!("  equity: {} (initial)", config.account.initial_equity),
    }
    println!("  closed trades: {} (realized {})", state.trades.len(), realized);
    let live = state.live_positions();
    println!("  open positions: {}", live.len());
    for p in &live {
        println!(
            "    {} {} {} size={} entry={} stop={} target={} status={}",
            p.id, p.symbol, p.direction, p.size, p.entry_price, p.stop_price, p.target_price, p.status
        );
    }
    Ok(())
}

/// The paper book lives in memory, so it is rebuilt from the state store
/// before the engine reconciles against it.
async fn start_engine(config: AppConfig) -> Result<(Arc<PaperExchange>, Arc<TradingEngine>)> {
    let exchange = Arc::new(PaperExchange::new(&config.paper));
    let store = Arc::new(FileStateStore::open(&config.store.dir).await?);
    let persisted = store.load().await?;
    exchange
        .restore_positions(&persisted.live_positions())
        .await;
    let engine = TradingEngine::start(config, exchange.clone(), store).await?;
    Ok((exchange, Arc::new(engine)))
}

fn parse_event(line: &str, line_no: usize) -> Option<MarketEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(line = line_no, "Skipping malformed event: {}", e);
            None
        }
    }
}

/// Sequential replay: each tick's closes settle before the next event, so the
/// result is deterministic. Paper fills use the order's reference price.
async fn replay(config: AppConfig, path: &Path) -> Result<()> {
    let (_exchange, engine) = start_engine(config).await?;
    let mut trades = engine.subscribe_trades();

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0;
    let (mut signals, mut opened, mut ticks) = (0usize, 0usize, 0usize);

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let Some(event) = parse_event(&line, line_no) else {
            continue;
        };
        match engine.process(event).await {
            Ok(EventOutcome::Signal(outcome)) => {
                signals += 1;
                if matches!(outcome, SignalOutcome::Opened(_)) {
                    opened += 1;
                }
            }
            Ok(EventOutcome::Tick(_)) => {
                ticks += 1;
                engine.settle().await;
            }
            Err(e) if e.is_operator_visible() => error!(line = line_no, "Event failed: {}", e),
            Err(e) => warn!(line = line_no, "Event failed: {}", e),
        }
    }
    engine.shutdown().await?;

    let (mut closed, mut realized) = (0usize, Decimal::ZERO);
    loop {
        match trades.try_recv() {
            Ok(trade) => {
                closed += 1;
                realized += trade.realized_pnl;
            }
            Err(TryRecvError::Lagged(missed)) => warn!(missed, "Trade stream lagged"),
            Err(_) => break,
        }
    }

    let status = engine.status().await;
    println!("Replayed {} events ({} signals, {} ticks)", line_no, signals, ticks);
    println!("  opened: {}  closed: {}  realized: {}", opened, closed, realized);
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Live mode: JSONL events from stdin feed the engine until EOF or a signal
async fn run(config: AppConfig) -> Result<()> {
    let (exchange, engine) = start_engine(config).await?;
    install_signal_handlers(engine.shutdown_handle());

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let reader = tokio::spawn(read_events(tokio::io::stdin(), exchange, tx));

    let result = engine.run(rx).await;
    reader.abort();
    if let Err(e) = &result {
        error!("Engine stopped with error: {}", e);
    }
    result?;
    info!("Engine stopped");
    Ok(())
}

async fn read_events<R: AsyncRead + Unpin>(
    input: R,
    exchange: Arc<PaperExchange>,
    tx: mpsc::Sender<MarketEvent>,
) {
    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                line_no += 1;
                let Some(event) = parse_event(&line, line_no) else {
                    continue;
                };
                // Paper marks follow the feed
                if let MarketEvent::Tick(tick) = &event {
                    exchange.set_price(&tick.symbol, tick.close).await;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Reading events failed: {}", e);
                break;
            }
        }
    }
}
