//! Backend liveness checks and bounded restart.

use crate::relay::RelayInner;
use crate::state::RelayState;
use crate::RecoveryReason;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Checks the backend every `health_interval` while the relay is open.
pub(crate) async fn monitor(inner: Arc<RelayInner>) {
    let mut ticker = tokio::time::interval(inner.config.health_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if inner.lifecycle.state() >= RelayState::Closing {
            break;
        }
        if !inner.lifecycle.is_open() {
            continue;
        }
        if !inner.supervisor.is_alive().await {
            log::error!("backend failed its health check");
            inner.trigger_recovery(RecoveryReason::HealthCheckFailed);
        }
    }
}

/// Restarts the backend whenever a failure is reported. Gives up, and shuts
/// the relay down, after `max_attempts` consecutive failed restarts.
pub(crate) async fn recover(
    inner: Arc<RelayInner>,
    mut triggers: mpsc::UnboundedReceiver<RecoveryReason>,
) {
    while let Some(reason) = triggers.recv().await {
        if inner.lifecycle.is_shutting_down() {
            break;
        }
        if inner.lifecycle.state() != RelayState::Opened {
            continue;
        }
        log::warn!("recovering backend: {}", reason);
        inner.lifecycle.set_recovering(true);
        let recovered = restart_with_backoff(&inner).await;
        inner.lifecycle.set_recovering(false);

        // Failures reported while the restart was underway concern the
        // backend that was replaced.
        while triggers.try_recv().is_ok() {}

        if !recovered {
            if !inner.lifecycle.is_shutting_down() {
                log::error!(
                    "backend could not be restarted after {} attempts; shutting down",
                    inner.config.recovery.max_attempts
                );
                inner.spawn_shutdown();
            }
            break;
        }
    }
}

async fn restart_with_backoff(inner: &Arc<RelayInner>) -> bool {
    let policy = inner.config.recovery;
    loop {
        if inner.lifecycle.is_shutting_down() {
            return false;
        }
        let attempt = inner.recovery_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > policy.max_attempts {
            return false;
        }
        let delay = policy.delay(attempt);
        log::info!(
            "restarting backend in {:?} (attempt {}/{})",
            delay,
            attempt,
            policy.max_attempts
        );
        tokio::time::sleep(delay).await;
        if inner.lifecycle.is_shutting_down() {
            return false;
        }

        inner.reset_routing();
        match inner.supervisor.restart(inner.config.shutdown_grace).await {
            Ok(generation) => {
                inner.recovery_attempts.store(0, Ordering::Release);
                log::info!("backend recovered as generation {}", generation);
                return true;
            }
            Err(e) => log::warn!("restart attempt {} failed: {}", attempt, e),
        }
    }
}
