//! Session registry: identity to live session
//!
//! Entries live in a sharded [`DashMap`], so identities never contend on a
//! global lock. A launch is shared by every concurrent caller for the same
//! identity and runs on its own task, so it completes even when the request
//! that started it goes away.
//!
//! Process exits reach the registry as [`ExitEvent`] messages from the
//! supervisor; the registry never observes signals directly.

use crate::auth::Identity;
use crate::config::SessionConfig;
use crate::launcher::{LaunchError, Launcher};
use crate::session::{Session, SessionState};
use crate::supervisor::{ExitEvent, ProcessId, ProcessSupervisor};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Polling interval while waiting for in-flight requests to finish
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

type LaunchResult = Result<Arc<Session>, LaunchError>;
type PendingLaunch = Shared<BoxFuture<'static, LaunchResult>>;

enum Slot {
    Launching {
        generation: u64,
        pending: PendingLaunch,
    },
    Live(Arc<Session>),
}

enum Claim {
    Ready(Arc<Session>),
    Pending(PendingLaunch),
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Time between SIGTERM and SIGKILL
    pub shutdown_grace_period: Duration,
    /// Wait for in-flight requests before terminating a session
    pub drain_timeout: Duration,
}

impl From<&SessionConfig> for RegistryConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shutdown_grace_period: config.shutdown_grace_period(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

pub struct SessionRegistry {
    entries: DashMap<Identity, Slot>,
    by_process: DashMap<ProcessId, Identity>,
    launcher: Arc<dyn Launcher>,
    supervisor: Arc<ProcessSupervisor>,
    config: RegistryConfig,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        supervisor: Arc<ProcessSupervisor>,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            by_process: DashMap::new(),
            launcher,
            supervisor,
            config,
            generation: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// The caller's usable session, launching one if needed.
    ///
    /// Concurrent callers for one identity share a single launch and all see
    /// the same session or the same error.
    pub async fn get_or_create(self: &Arc<Self>, identity: &Identity) -> LaunchResult {
        match self.claim(identity)? {
            Claim::Ready(session) => Ok(session),
            Claim::Pending(pending) => pending.await,
        }
    }

    fn claim(self: &Arc<Self>, identity: &Identity) -> Result<Claim, LaunchError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(LaunchError::ShuttingDown);
        }

        match self.entries.entry(identity.clone()) {
            Entry::Occupied(mut occupied) => {
                let stale = match occupied.get() {
                    Slot::Launching { pending, .. } => return Ok(Claim::Pending(pending.clone())),
                    Slot::Live(session) if session.is_usable() => {
                        return Ok(Claim::Ready(Arc::clone(session)))
                    }
                    Slot::Live(session) if session.state() == SessionState::Draining => {
                        return Err(LaunchError::Draining)
                    }
                    Slot::Live(session) => Arc::clone(session),
                };

                let (generation, pending) = self.start_launch(identity);
                occupied.insert(Slot::Launching {
                    generation,
                    pending: pending.clone(),
                });
                drop(occupied);

                debug!(%identity, pid = stale.pid(), "Replacing dead session");
                self.retire(stale);
                Ok(Claim::Pending(pending))
            }
            Entry::Vacant(vacant) => {
                let (generation, pending) = self.start_launch(identity);
                vacant.insert(Slot::Launching {
                    generation,
                    pending: pending.clone(),
                });
                Ok(Claim::Pending(pending))
            }
        }
    }

    fn start_launch(self: &Arc<Self>, identity: &Identity) -> (u64, PendingLaunch) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let launch = self.launcher.launch(identity.clone());

        let registry = Arc::clone(self);
        let owner = identity.clone();
        let task = tokio::spawn(async move {
            let result = launch.await;
            registry.complete_launch(owner, generation, result)
        });

        let pending = async move {
            task.await
                .unwrap_or_else(|e| Err(LaunchError::Internal(e.to_string())))
        }
        .boxed()
        .shared();

        (generation, pending)
    }

    fn complete_launch(&self, identity: Identity, generation: u64, result: LaunchResult) -> LaunchResult {
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.entries.remove_if(&identity, |_, slot| {
                    matches!(slot, Slot::Launching { generation: g, .. } if *g == generation)
                });
                return Err(e);
            }
        };

        let installed = match self.entries.get_mut(&identity) {
            Some(mut slot) if matches!(&*slot, Slot::Launching { generation: g, .. } if *g == generation) => {
                if let Some(id) = session.process_id() {
                    self.by_process.insert(id, identity.clone());
                }
                *slot = Slot::Live(Arc::clone(&session));
                true
            }
            _ => false,
        };

        if !installed {
            // Removed (logout, shutdown) while launching
            info!(%identity, "Discarding session launched after termination");
            self.retire(session);
            return Err(LaunchError::Cancelled);
        }

        // The exit may have been reported before the process was indexed
        if session.process_exited() {
            self.evict(&identity, &session);
            return Err(LaunchError::ExitedDuringStartup("exited before registration".to_string()));
        }

        Ok(session)
    }

    /// Live session for `identity`, without launching
    pub fn lookup(&self, identity: &Identity) -> Option<Arc<Session>> {
        match self.entries.get(identity).as_deref() {
            Some(Slot::Live(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Remove the entry and release its process (terminating it if alive).
    /// A launch in progress is abandoned and its result discarded.
    pub fn remove(&self, identity: &Identity) -> Option<Arc<Session>> {
        match self.entries.remove(identity) {
            Some((_, Slot::Live(session))) => {
                self.retire(Arc::clone(&session));
                Some(session)
            }
            Some((_, Slot::Launching { .. })) => {
                debug!(%identity, "Abandoned launch in progress");
                None
            }
            None => None,
        }
    }

    /// Remove the entry only if it still holds `session`
    pub fn evict(&self, identity: &Identity, session: &Arc<Session>) -> bool {
        let removed = self.entries.remove_if(identity, |_, slot| {
            matches!(slot, Slot::Live(current) if Arc::ptr_eq(current, session))
        });

        if removed.is_some() {
            warn!(%identity, endpoint = %session.endpoint(), "Evicted stale session");
            self.retire(Arc::clone(session));
            true
        } else {
            false
        }
    }

    /// Drain and stop the session for `identity`, waiting for the process to exit
    pub async fn terminate(&self, identity: &Identity) -> bool {
        let Some(session) = self.lookup(identity) else {
            return self.remove(identity).is_some();
        };

        if !session.mark_draining() {
            // Already dead: just drop the entry. Draining: someone else is on it.
            return session.state() == SessionState::Terminated && self.evict(identity, &session);
        }
        info!(%identity, in_flight = session.in_flight(), "Terminating session");
        self.drain(&session).await;

        self.entries.remove_if(identity, |_, slot| {
            matches!(slot, Slot::Live(current) if Arc::ptr_eq(current, &session))
        });
        self.stop(session).await;
        true
    }

    /// Stop accepting launches and terminate every session
    pub async fn terminate_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let identities: Vec<Identity> = self.entries.iter().map(|e| e.key().clone()).collect();
        info!(count = identities.len(), "Terminating all sessions");

        let tasks = identities.iter().map(|identity| self.terminate(identity));
        futures::future::join_all(tasks).await;
    }

    /// Evict sessions whose process has exited or that were marked terminated.
    /// Covers exits whose notification raced with registration.
    pub fn sweep_dead(&self) -> usize {
        let dead: Vec<(Identity, Arc<Session>)> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(session)
                    if session.process_exited() || session.state() == SessionState::Terminated =>
                {
                    Some((entry.key().clone(), Arc::clone(session)))
                }
                _ => None,
            })
            .collect();

        dead.iter()
            .filter(|(identity, session)| self.evict(identity, session))
            .count()
    }

    /// Terminate Ready sessions idle for at least `timeout` with nothing in flight
    pub async fn reap_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<Identity> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(session)
                    if session.state() == SessionState::Ready
                        && session.in_flight() == 0
                        && session.idle_for() >= timeout =>
                {
                    Some(entry.key().clone())
                }
                _ => None,
            })
            .collect();

        let mut reaped = 0;
        for identity in idle {
            info!(%identity, idle_timeout_secs = timeout.as_secs(), "Session idle, terminating");
            if self.terminate(&identity).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Consume exit notifications from the supervisor until it goes away
    pub async fn run_exit_listener(self: Arc<Self>, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
        while let Some(event) = exits.recv().await {
            self.handle_exit(event);
        }
        debug!("Exit listener stopped");
    }

    /// Remove the session whose process exited
    pub fn handle_exit(&self, event: ExitEvent) {
        let Some((_, identity)) = self.by_process.remove(&event.id) else {
            return;
        };

        let removed = self.entries.remove_if(&identity, |_, slot| {
            matches!(slot, Slot::Live(session) if session.process_id() == Some(event.id))
        });

        if let Some((_, Slot::Live(session))) = removed {
            session.mark_terminated();
            session.take_process();
            info!(%identity, pid = event.pid, report = %event.report, "Session process exited, entry removed");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn drain(&self, session: &Session) {
        let start = Instant::now();
        while session.in_flight() > 0 {
            if start.elapsed() > self.config.drain_timeout {
                warn!(
                    identity = %session.identity(),
                    remaining = session.in_flight(),
                    "Drain timeout exceeded, proceeding with shutdown"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
    }

    /// Mark terminated and stop the process in the background
    fn retire(&self, session: Arc<Session>) {
        session.mark_terminated();
        if let Some(id) = session.process_id() {
            self.by_process.remove(&id);
        }

        let supervisor = Arc::clone(&self.supervisor);
        let grace = self.config.shutdown_grace_period;
        if let Some(handle) = session.take_process() {
            tokio::spawn(async move {
                supervisor.terminate(&handle, grace).await;
                drop(session);
            });
        }
    }

    async fn stop(&self, session: Arc<Session>) {
        session.mark_terminated();
        if let Some(id) = session.process_id() {
            self.by_process.remove(&id);
        }
        if let Some(handle) = session.take_process() {
            let report = self
                .supervisor
                .terminate(&handle, self.config.shutdown_grace_period)
                .await;
            debug!(identity = %session.identity(), ?report, "Session process stopped");
        }
    }
}
