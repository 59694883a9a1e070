//! The per-identity session record

use crate::auth::Identity;
use crate::endpoint::{Endpoint, EndpointLease};
use crate::supervisor::{ExitReport, ProcessHandle, ProcessId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process spawned, endpoint not yet accepting connections
    Launching,
    /// Accepting proxied requests
    Ready,
    /// No new requests; waiting for in-flight ones before termination
    Draining,
    /// Process gone or being stopped; never proxied to again
    Terminated,
}

/// One backend process serving one identity
///
/// Owned by the registry. The supervisor owns the OS process itself and only
/// reports exits; it never touches a `Session`.
pub struct Session {
    identity: Identity,
    endpoint: Endpoint,
    _lease: Option<EndpointLease>,
    state: RwLock<SessionState>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    process: Mutex<Option<ProcessHandle>>,
    process_id: Option<ProcessId>,
    pid: Option<u32>,
    started_at: Instant,
}

impl Session {
    /// Session for a freshly spawned process listening on `lease`
    pub fn launching(identity: Identity, lease: EndpointLease, process: ProcessHandle) -> Self {
        let endpoint = lease.endpoint().clone();
        let process_id = Some(process.id());
        let pid = process.pid();
        Self {
            identity,
            endpoint,
            _lease: Some(lease),
            state: RwLock::new(SessionState::Launching),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            process: Mutex::new(Some(process)),
            process_id,
            pid,
            started_at: Instant::now(),
        }
    }

    /// Session whose backend is not a supervised child (already Ready)
    #[cfg(test)]
    pub(crate) fn external(identity: Identity, endpoint: Endpoint) -> Self {
        Self {
            identity,
            endpoint,
            _lease: None,
            state: RwLock::new(SessionState::Ready),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            process: Mutex::new(None),
            process_id: None,
            pid: None,
            started_at: Instant::now(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Launching -> Ready. Returns false if the session moved on meanwhile.
    pub fn mark_ready(&self) -> bool {
        let mut state = self.state.write();
        if *state == SessionState::Launching {
            *state = SessionState::Ready;
            true
        } else {
            false
        }
    }

    /// Stop admitting requests. Returns false if already draining or terminated.
    pub fn mark_draining(&self) -> bool {
        let mut state = self.state.write();
        match *state {
            SessionState::Launching | SessionState::Ready => {
                *state = SessionState::Draining;
                true
            }
            SessionState::Draining | SessionState::Terminated => false,
        }
    }

    pub fn mark_terminated(&self) {
        *self.state.write() = SessionState::Terminated;
    }

    /// Ready and the process (if supervised) has not exited
    pub fn is_usable(&self) -> bool {
        self.state() == SessionState::Ready && !self.process_exited()
    }

    pub fn process_exited(&self) -> bool {
        self.exit_report().is_some()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        self.process.lock().as_ref().and_then(|p| p.exit_report())
    }

    /// Release ownership of the process handle
    pub fn take_process(&self) -> Option<ProcessHandle> {
        self.process.lock().take()
    }

    /// Record successful traffic
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Admit one request. `None` unless the session is Ready; the check and
    /// the increment happen under the state lock so draining cannot miss it.
    pub fn begin_request(self: &Arc<Self>) -> Option<InFlightGuard> {
        let state = self.state.read();
        if *state != SessionState::Ready {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        drop(state);

        Some(InFlightGuard {
            session: Arc::clone(self),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("pid", &self.pid)
            .finish()
    }
}

/// Counts one in-flight request until dropped
pub struct InFlightGuard {
    session: Arc<Session>,
}

impl InFlightGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
