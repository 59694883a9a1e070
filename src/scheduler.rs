//! Periodic background commands
//!
//! Each command runs on its own task with its own interval, so a slow or
//! failing command delays nothing but itself.

use crate::registry::SessionRegistry;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub trait ScheduledCommand: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn execute(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Run `command` every interval until shutdown is signalled
pub fn spawn_command(
    command: Arc<dyn ScheduledCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(command.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        debug!(command = command.name(), interval_ms = command.interval().as_millis() as u64, "Scheduled command started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = command.execute().await {
                        warn!(command = command.name(), error = %e, "Scheduled command failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(command = command.name(), "Scheduled command stopped");
    })
}

/// Evicts sessions whose process died without a matching exit notification
pub struct SweepDeadSessions {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl SweepDeadSessions {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }
}

impl ScheduledCommand for SweepDeadSessions {
    fn name(&self) -> &'static str {
        "sweep-dead-sessions"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execute(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let swept = self.registry.sweep_dead();
            if swept > 0 {
                info!(swept, "Removed dead sessions");
            }
            Ok(())
        })
    }
}

/// Terminates sessions without traffic for `timeout`
pub struct ReapIdleSessions {
    registry: Arc<SessionRegistry>,
    timeout: Duration,
}

impl ReapIdleSessions {
    pub fn new(registry: Arc<SessionRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }
}

impl ScheduledCommand for ReapIdleSessions {
    fn name(&self) -> &'static str {
        "reap-idle-sessions"
    }

    fn interval(&self) -> Duration {
        idle_check_interval(self.timeout)
    }

    fn execute(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let reaped = self.registry.reap_idle(self.timeout).await;
            if reaped > 0 {
                info!(reaped, "Terminated idle sessions");
            }
            Ok(())
        })
    }
}

/// Check at a tenth of the timeout, between 1 and 10 seconds
fn idle_check_interval(timeout: Duration) -> Duration {
    (timeout / 10).clamp(Duration::from_secs(1), Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
        fail: bool,
        slow: bool,
    }

    impl ScheduledCommand for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        fn execute(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if self.slow {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                if self.fail {
                    anyhow::bail!("boom");
                }
                Ok(())
            })
        }
    }

    fn counter(fail: bool, slow: bool) -> Arc<Counter> {
        Arc::new(Counter {
            runs: AtomicUsize::new(0),
            fail,
            slow,
        })
    }

    #[tokio::test]
    async fn test_runs_repeatedly_and_stops() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let command = counter(false, false);
        let handle = spawn_command(command.clone(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(command.runs.load(Ordering::SeqCst) >= 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_command() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let command = counter(true, false);
        let _handle = spawn_command(command.clone(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(command.runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_slow_command_does_not_block_others() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let slow = counter(false, true);
        let fast = counter(false, false);
        let _a = spawn_command(slow.clone(), shutdown_rx.clone());
        let _b = spawn_command(fast.clone(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(slow.runs.load(Ordering::SeqCst), 1);
        assert!(fast.runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_stops_when_shutdown_sender_dropped() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_command(counter(false, false), shutdown_rx);

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_idle_check_interval_bounds() {
        assert_eq!(idle_check_interval(Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(idle_check_interval(Duration::from_secs(50)), Duration::from_secs(5));
        assert_eq!(idle_check_interval(Duration::from_secs(3600)), Duration::from_secs(10));
    }
}
