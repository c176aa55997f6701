//! Scheduler and worker pool (C4). A single scanner lists eligible
//! strategies on the monitor cadence and feeds a bounded queue; N workers
//! drain it, each taking the per-strategy execution lease before running
//! the status handler. One strategy is never processed by two workers.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::activation::ActivationHandler;
use super::expiry::ExpiryHandler;
use super::orchestrator::TriggerOrchestrator;
use super::submitter::OrderSubmitter;
use super::EngineContext;
use crate::domain::StrategyStatus;
use crate::error::{Result, SentraError};

#[derive(Debug, Clone)]
struct StrategyTask {
    strategy_id: String,
    reason: &'static str,
    expected_status: StrategyStatus,
    expected_version: i64,
}

/// Snapshot of the engine's runtime state for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatus {
    pub enabled: bool,
    pub running: bool,
    pub monitor_interval_seconds: u64,
    pub configured_threads: usize,
    pub queue_maxsize: usize,
    pub inflight_tasks: usize,
}

pub struct WorkerEngine {
    ctx: Arc<EngineContext>,
    sender: mpsc::Sender<StrategyTask>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<StrategyTask>>>,
    inflight: Arc<Mutex<HashSet<String>>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl WorkerEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(ctx.config.worker.queue_maxsize);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            running: AtomicBool::new(false),
        })
    }

    pub fn runtime_status(&self) -> WorkerStatus {
        WorkerStatus {
            enabled: self.ctx.config.worker.enabled,
            running: self.running.load(Ordering::SeqCst),
            monitor_interval_seconds: self.ctx.config.worker.monitor_interval_seconds,
            configured_threads: self.ctx.config.worker.configured_threads,
            queue_maxsize: self.ctx.config.worker.queue_maxsize,
            inflight_tasks: self.inflight.lock().map(|set| set.len()).unwrap_or(0),
        }
    }

    /// Spawn the scanner and worker tasks when worker.enabled is set.
    pub fn start_if_enabled(self: &Arc<Self>) {
        if !self.ctx.config.worker.enabled {
            info!("strategy execution engine disabled (worker.enabled=false)");
            return;
        }
        self.start();
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            info!(
                interval = engine.ctx.config.worker.monitor_interval_seconds,
                workers = engine.ctx.config.worker.configured_threads,
                "scanner loop started"
            );
            let interval =
                std::time::Duration::from_secs(engine.ctx.config.worker.monitor_interval_seconds);
            loop {
                match engine.scan_once().await {
                    Ok(enqueued) => debug!(enqueued, "scanner cycle"),
                    Err(err) => error!(error = %err, "scanner cycle failed"),
                }
                if let Err(err) = ExpiryHandler::sweep(&engine.ctx, Utc::now()).await {
                    error!(error = %err, "expiry sweep failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("scanner loop stopped");
        });

        for worker_index in 0..self.ctx.config.worker.configured_threads {
            let engine = self.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                debug!(worker_index, "worker loop started");
                loop {
                    let task = {
                        let mut receiver = engine.receiver.lock().await;
                        tokio::select! {
                            task = receiver.recv() => task,
                            _ = shutdown_rx.changed() => break,
                        }
                    };
                    let Some(task) = task else { break };
                    if let Err(err) = engine.process_task(&task).await {
                        error!(
                            strategy_id = %task.strategy_id,
                            reason = task.reason,
                            error = %err,
                            "worker task failed"
                        );
                    }
                    engine.release_inflight(&task.strategy_id);
                }
                debug!(worker_index, "worker loop stopped");
            });
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
            info!("strategy execution engine stopped");
        }
    }

    /// One scan: enqueue every scannable strategy not already in flight.
    pub async fn scan_once(&self) -> Result<usize> {
        let candidates = self.ctx.store.list_scannable().await?;
        let mut enqueued = 0;
        for candidate in candidates {
            let task = StrategyTask {
                strategy_id: candidate.id,
                reason: "periodic_scan",
                expected_status: candidate.status,
                expected_version: candidate.version,
            };
            if !self.claim_inflight(&task.strategy_id) {
                continue;
            }
            match self.sender.try_send(task.clone()) {
                Ok(()) => enqueued += 1,
                Err(mpsc::error::TrySendError::Full(task)) => {
                    self.release_inflight(&task.strategy_id);
                    warn!(
                        strategy_id = %task.strategy_id,
                        "work queue full; dropping enqueue"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(task)) => {
                    self.release_inflight(&task.strategy_id);
                    return Err(SentraError::Internal("work queue closed".to_string()));
                }
            }
        }
        Ok(enqueued)
    }

    /// Run one strategy synchronously (manual kicks).
    pub async fn process_strategy_once(&self, strategy_id: &str) -> Result<()> {
        self.process_strategy_at(strategy_id, Utc::now()).await
    }

    /// Run one strategy synchronously at an explicit instant. Tests drive
    /// the lifecycle deterministically through this entry point.
    pub async fn process_strategy_at(
        &self,
        strategy_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.claim_inflight(strategy_id) {
            debug!(strategy_id, "already in flight; skipping");
            return Ok(());
        }
        let result = async {
            let Some(record) = self.ctx.store.get_strategy_opt(strategy_id).await? else {
                return Ok(());
            };
            let task = StrategyTask {
                strategy_id: record.id.clone(),
                reason: "manual",
                expected_status: record.status,
                expected_version: record.version,
            };
            self.process_task_at(&task, now).await
        }
        .await;
        self.release_inflight(strategy_id);
        result
    }

    fn claim_inflight(&self, strategy_id: &str) -> bool {
        self.inflight
            .lock()
            .map(|mut set| set.insert(strategy_id.to_string()))
            .unwrap_or(false)
    }

    fn release_inflight(&self, strategy_id: &str) {
        if let Ok(mut set) = self.inflight.lock() {
            set.remove(strategy_id);
        }
    }

    async fn process_task(&self, task: &StrategyTask) -> Result<()> {
        self.process_task_at(task, Utc::now()).await
    }

    /// Lease, dispatch by status, release. Errors inside the leased run are
    /// classified: retriable ones wait for the next cycle, evaluation
    /// rejects surface as audit events, benign races are ignored.
    async fn process_task_at(&self, task: &StrategyTask, now: DateTime<Utc>) -> Result<()> {
        let ctx = &self.ctx;
        let strategy_id = task.strategy_id.as_str();
        let ttl = ctx.config.worker.strategy_lock_ttl_seconds;

        let Some(token) = ctx
            .store
            .acquire_lease(strategy_id, task.expected_status, task.expected_version, ttl)
            .await?
        else {
            debug!(strategy_id, "lease not acquired (snapshot changed or held)");
            return Ok(());
        };

        let run_result = self.run_leased(strategy_id, token, now).await;
        ctx.store.release_lease(strategy_id, token).await?;

        match run_result {
            Ok(()) => Ok(()),
            Err(SentraError::Evaluation(reason)) => {
                ctx.store
                    .append_event(strategy_id, "EVALUATION_ERROR", &reason)
                    .await?;
                Ok(())
            }
            Err(err) if err.is_retriable() => {
                warn!(strategy_id, error = %err, "retriable error; next cycle retries");
                Ok(())
            }
            Err(
                err @ (SentraError::InvalidTransition { .. } | SentraError::VersionConflict(_)),
            ) => {
                debug!(strategy_id, error = %err, "lost a benign race");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_leased(
        &self,
        strategy_id: &str,
        token: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let Some(record) = ctx.store.get_leased(strategy_id, token).await? else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        // Expiry wins over any other handling in the run.
        if ExpiryHandler::handle_expiry(ctx, &record, now).await? {
            return Ok(());
        }
        let Some(record) = ctx.store.get_leased(strategy_id, token).await? else {
            return Ok(());
        };

        match record.status {
            StrategyStatus::Verifying => ActivationHandler::handle_verifying(ctx, &record, now).await,
            StrategyStatus::Active => TriggerOrchestrator::run_active(ctx, &record, now).await,
            StrategyStatus::Triggered => OrderSubmitter::handle_triggered(ctx, &record, now).await,
            StrategyStatus::OrderSubmitted => {
                OrderSubmitter::handle_order_submitted(ctx, &record, now).await
            }
            _ => Ok(()),
        }
    }
}
