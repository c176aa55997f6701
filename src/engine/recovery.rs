//! Boot recovery (C10): clear elapsed leases, leave statuses as persisted,
//! and reconcile every in-flight order against the gateway. Nothing is
//! dropped; every prior event stays auditable.

use chrono::Utc;
use tracing::{info, warn};

use super::submitter::OrderSubmitter;
use super::EngineContext;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub cleared_leases: u64,
    pub reconciled_orders: usize,
    pub reconcile_failures: usize,
}

pub struct RecoveryLoop;

impl RecoveryLoop {
    /// Run once at process start, before the scheduler spins up.
    pub async fn run(ctx: &EngineContext) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            cleared_leases: ctx.store.clear_stale_leases().await?,
            ..Default::default()
        };

        let now = Utc::now();
        for record in ctx.store.list_order_submitted().await? {
            match OrderSubmitter::handle_order_submitted(ctx, &record, now).await {
                Ok(()) => report.reconciled_orders += 1,
                Err(err) => {
                    // Keep tracking: the scheduler re-checks on its cadence.
                    warn!(
                        strategy_id = %record.id,
                        error = %err,
                        "order reconciliation failed at boot"
                    );
                    report.reconcile_failures += 1;
                }
            }
        }

        info!(
            cleared_leases = report.cleared_leases,
            reconciled_orders = report.reconciled_orders,
            reconcile_failures = report.reconcile_failures,
            "boot recovery complete"
        );
        Ok(report)
    }
}
