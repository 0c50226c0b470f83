//! Periodic sealing of pending transactions.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::consensus::ConsensusEngine;
use crate::runtime::{Runtime, RuntimeError};
use crate::signature::Verifier;
use crate::types::Block;

/// Seal once if anything is pending. Returns `None` when the mempool is empty.
pub async fn seal_pending<V, E>(
    runtime: &Runtime<V, E>,
    timeout: Option<Duration>,
) -> Result<Option<Block>, RuntimeError>
where
    V: Verifier + 'static,
    E: ConsensusEngine + 'static,
{
    if runtime.status()?.pending == 0 {
        return Ok(None);
    }
    runtime.seal_blocking(timeout).await.map(Some)
}

/// Seal every `interval` until `shutdown` flips to `true` or its sender is dropped.
///
/// A shutdown arriving mid-seal cancels the runtime's searches, so the task
/// stops promptly even when sealing is unbounded.
pub fn spawn_auto_sealer<V, E>(
    runtime: Runtime<V, E>,
    interval: Duration,
    seal_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    V: Verifier + 'static,
    E: ConsensusEngine + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_ms = interval.as_millis() as u64, "auto-sealer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let seal = seal_pending(&runtime, seal_timeout);
            tokio::pin!(seal);
            let mut stopping = false;
            let result = tokio::select! {
                result = &mut seal => result,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // The search runs on a blocking thread; only the flag can stop it.
                        runtime.cancel_seals();
                        stopping = true;
                    }
                    seal.await
                }
            };

            match result {
                Ok(Some(block)) => info!(index = block.index, "auto-sealed block"),
                Ok(None) => {}
                Err(e) if stopping => info!(error = %e, "auto-seal interrupted by shutdown"),
                Err(e) => warn!(error = %e, "auto-seal failed"),
            }
            if stopping {
                break;
            }
        }
        info!("auto-sealer stopped");
    })
}
