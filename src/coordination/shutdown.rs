//! Graceful Shutdown Handler
//!
//! Ordered teardown: stop signal intake first, let in-flight exchange calls
//! finish or time out, checkpoint open positions, then flush the state store.
//! In-flight calls are never hard-aborted so no order is left in an unknown state.

use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - skip waiting for the drain
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Total timeout for graceful shutdown (default: 120s)
    pub total_timeout_secs: u64,
    /// Time to wait for in-flight orders to resolve (default: 60s)
    pub drain_timeout_secs: u64,
    /// Time to wait for the state store flush (default: 30s)
    pub flush_timeout_secs: u64,
    /// Poll interval when waiting for in-flight orders (default: 100ms)
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 120,
            drain_timeout_secs: 60,
            flush_timeout_secs: 30,
            poll_interval_ms: 100,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// No new signals accepted
    StoppingIntake,
    /// Waiting for in-flight exchange calls
    DrainingOrders,
    /// Writing the final position snapshot
    Checkpointing,
    FlushingStore,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingIntake => write!(f, "stopping_intake"),
            ShutdownPhase::DrainingOrders => write!(f, "draining_orders"),
            ShutdownPhase::Checkpointing => write!(f, "checkpointing"),
            ShutdownPhase::FlushingStore => write!(f, "flushing_store"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub type PhaseFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    urgent: AtomicBool,
    phase: watch::Sender<ShutdownPhase>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            urgent: AtomicBool::new(false),
            phase: phase_tx,
            phase_rx,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_rx.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if signal == ShutdownSignal::Urgent {
            self.urgent.store(true, Ordering::SeqCst);
        }
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        let _ = self.signal_tx.send(signal);
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        let _ = self.phase.send(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Execute the shutdown sequence
    ///
    /// 1. Stop signal intake
    /// 2. Wait for in-flight orders (bounded by `drain_timeout_secs`)
    /// 3. Write the final position snapshot
    /// 4. Flush the state store
    pub async fn execute<F1, F2, F3, F4>(
        &self,
        stop_intake: F1,
        drain_orders: F2,
        checkpoint: F3,
        flush_store: F4,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce() -> PhaseFuture<()>,
        F2: FnOnce() -> PhaseFuture<bool>,
        F3: FnOnce() -> PhaseFuture<Result<(), String>>,
        F4: FnOnce() -> PhaseFuture<Result<(), String>>,
    {
        let start = std::time::Instant::now();
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs);
        let mut failures = Vec::new();

        info!(
            "Starting graceful shutdown (timeout: {}s)",
            self.config.total_timeout_secs
        );

        // Phase 1: Stop intake
        self.set_phase(ShutdownPhase::StoppingIntake);
        stop_intake().await;
        debug!("Signal intake stopped");

        // Phase 2: Drain in-flight orders
        self.set_phase(ShutdownPhase::DrainingOrders);
        let drain_timeout = if self.urgent.load(Ordering::SeqCst) {
            Duration::from_secs(self.config.drain_timeout_secs.min(5))
        } else {
            Duration::from_secs(self.config.drain_timeout_secs)
        };
        match tokio::time::timeout(drain_timeout, drain_orders()).await {
            Ok(true) => info!("All in-flight orders resolved"),
            Ok(false) => warn!("Some orders may not have resolved during drain"),
            Err(_) => warn!(
                "Order drain timeout after {}s, proceeding anyway",
                drain_timeout.as_secs()
            ),
        }

        if start.elapsed() > total_timeout {
            error!("Total shutdown timeout exceeded before checkpoint");
        }

        // Phase 3: Checkpoint
        self.set_phase(ShutdownPhase::Checkpointing);
        if let Err(e) = checkpoint().await {
            error!("Final checkpoint failed: {}", e);
            failures.push(format!("checkpoint: {}", e));
        }

        // Phase 4: Flush store
        self.set_phase(ShutdownPhase::FlushingStore);
        let flush_timeout = Duration::from_secs(self.config.flush_timeout_secs);
        match tokio::time::timeout(flush_timeout, flush_store()).await {
            Ok(Ok(())) => debug!("State store flushed"),
            Ok(Err(e)) => {
                error!("State store flush error: {}", e);
                failures.push(format!("flush: {}", e));
            }
            Err(_) => {
                error!(
                    "State store flush timeout after {}s",
                    self.config.flush_timeout_secs
                );
                failures.push("flush: timeout".to_string());
            }
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());

        if !failures.is_empty() {
            return Err(ShutdownError::ComponentFailed(failures.join("; ")));
        }
        if start.elapsed() > total_timeout {
            return Err(ShutdownError::Timeout);
        }
        Ok(())
    }
}

/// Shutdown errors
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownError {
    /// Shutdown timed out
    Timeout,
    /// Component failed during shutdown
    ComponentFailed(String),
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
            ShutdownError::ComponentFailed(c) => write!(f, "failed during shutdown: {}", c),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Helper to install OS signal handlers
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, urgency) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                        return;
                    }
                };
                stream.recv().await;
                info!("Received {}", name);
                shutdown.request_shutdown(urgency);
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                return;
            }
            info!("Received Ctrl+C");
            shutdown.request_shutdown(ShutdownSignal::Graceful);
        });
    }
}
