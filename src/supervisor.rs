//! Child process supervision
//!
//! The supervisor is the only component that reaps child processes. SIGCHLD
//! merely wakes the reaper task, which sweeps every supervised child with a
//! non-blocking wait and turns each exit into exactly one [`ExitEvent`] on an
//! ordinary channel. Nothing else in the gateway is touched from signal
//! context.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Fallback sweep interval when no SIGCHLD arrives (coalesced signals, non-unix)
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 500;

/// How long to wait for the reaper after SIGKILL before giving up
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor-assigned identifier, never reused (unlike OS pids)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// What to run
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Label used in logs (usually the owning identity)
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Why a spawn failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    NotFound(String),
    #[error("permission denied executing {0}")]
    PermissionDenied(String),
    #[error("resource limit reached spawning {command}: {message}")]
    ResourceLimit { command: String, message: String },
    #[error("failed to spawn {command}: {message}")]
    Exec { command: String, message: String },
}

impl SpawnError {
    fn classify(command: &str, err: &std::io::Error) -> Self {
        #[cfg(unix)]
        if matches!(
            err.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM)
        ) {
            return SpawnError::ResourceLimit {
                command: command.to_string(),
                message: err.to_string(),
            };
        }

        match err.kind() {
            std::io::ErrorKind::NotFound => SpawnError::NotFound(command.to_string()),
            std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(command.to_string()),
            _ => SpawnError::Exec {
                command: command.to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code for a normal exit
    pub code: Option<i32>,
    /// Terminating signal, if killed by one
    pub signal: Option<i32>,
}

impl ExitReport {
    /// Exit status could not be collected (supervisor-internal failure)
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Delivered once per supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub id: ProcessId,
    pub pid: Option<u32>,
    pub report: ExitReport,
}

/// Ownership token for a supervised process
///
/// Not `Clone`: whoever holds the handle owns the process. Dropping a handle
/// does not stop the process; use [`ProcessSupervisor::terminate`].
#[derive(Debug)]
pub struct ProcessHandle {
    id: ProcessId,
    pid: Option<u32>,
    status_rx: watch::Receiver<Option<ExitReport>>,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking poll for the exit report
    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.status_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_report().is_some()
    }

    /// Wait for the supervisor to reap this process
    pub async fn wait(&self) -> ExitReport {
        let mut rx = self.status_rx.clone();
        // Bound first so the watch borrow ends before `rx` drops
        let report = match rx.wait_for(|status| status.is_some()).await {
            Ok(status) => status.unwrap_or_else(ExitReport::unknown),
            // Sender gone without a report: the supervisor itself was dropped
            Err(_) => ExitReport::unknown(),
        };
        report
    }
}

struct Supervised {
    child: Child,
    label: String,
    status_tx: watch::Sender<Option<ExitReport>>,
}

/// Launches, tracks and reaps child processes
pub struct ProcessSupervisor {
    children: Mutex<HashMap<ProcessId, Supervised>>,
    next_id: AtomicU64,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    sweep_interval: Duration,
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiving end of its exit notifications.
    ///
    /// [`run`](Self::run) must be spawned for exits to be collected.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ExitEvent>) {
        Self::with_sweep_interval(Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS))
    }

    pub fn with_sweep_interval(
        sweep_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            children: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            exit_tx,
            sweep_interval,
        });
        (supervisor, exit_rx)
    }

    /// Spawn a child process. Returns once fork/exec has completed.
    pub fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = spec.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::classify(&spec.command, &e))?;

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pid = child.id();
        info!(label = %spec.label, %id, pid, command = %spec.command, "Process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, spec.label.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, spec.label.clone(), "stderr");
        }

        let (status_tx, status_rx) = watch::channel(None);
        self.children.lock().insert(
            id,
            Supervised {
                child,
                label: spec.label.clone(),
                status_tx,
            },
        );

        Ok(ProcessHandle { id, pid, status_rx })
    }

    /// Number of processes not yet reaped
    pub fn supervised_count(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_supervised(&self, id: ProcessId) -> bool {
        self.children.lock().contains_key(&id)
    }

    /// Reaper loop: wakes on SIGCHLD or the fallback tick and sweeps.
    pub async fn run(self: Arc<Self>) {
        #[cfg(unix)]
        let mut sigchld = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                error!(error = %e, "Failed to install SIGCHLD handler, falling back to polling");
                None
            }
        };

        let mut tick = tokio::time::interval(self.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(sweep_interval_ms = self.sweep_interval.as_millis() as u64, "Process supervisor started");

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = recv_sigchld(&mut sigchld) => {}
                _ = tick.tick() => {}
            }

            #[cfg(not(unix))]
            tick.tick().await;

            self.reap();
        }
    }

    /// Collect every child that has exited. Returns the number reaped.
    pub fn reap(&self) -> usize {
        let exited: Vec<(ProcessId, Option<u32>, Supervised, ExitReport)> = {
            let mut children = self.children.lock();
            let mut done = Vec::new();
            for (id, supervised) in children.iter_mut() {
                let pid = supervised.child.id();
                match supervised.child.try_wait() {
                    Ok(Some(status)) => done.push((*id, pid, ExitReport::from(status))),
                    Ok(None) => {}
                    Err(e) => {
                        error!(label = %supervised.label, %id, error = %e, "Failed to collect exit status");
                        done.push((*id, pid, ExitReport::unknown()));
                    }
                }
            }
            done.into_iter()
                .filter_map(|(id, pid, report)| {
                    children.remove(&id).map(|s| (id, pid, s, report))
                })
                .collect()
        };

        let count = exited.len();
        for (id, pid, supervised, report) in exited {
            if report.success() {
                info!(label = %supervised.label, %id, pid, %report, "Process exited");
            } else {
                warn!(label = %supervised.label, %id, pid, %report, "Process exited abnormally");
            }
            supervised.status_tx.send_replace(Some(report));
            if self.exit_tx.send(ExitEvent { id, pid, report }).is_err() {
                debug!(%id, "No exit listener attached");
            }
        }
        count
    }

    /// Ask a process to stop: SIGTERM, then SIGKILL once `grace` has elapsed.
    ///
    /// Returns the exit report, or `None` if the process could not be
    /// confirmed dead.
    pub async fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> Option<ExitReport> {
        if let Some(report) = handle.exit_report() {
            return Some(report);
        }

        self.signal_terminate(handle.id);

        match tokio::time::timeout(grace, handle.wait()).await {
            Ok(report) => {
                debug!(id = %handle.id, %report, "Process exited after SIGTERM");
                return Some(report);
            }
            Err(_) => {
                warn!(
                    id = %handle.id,
                    pid = handle.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
            }
        }

        self.kill(handle.id);
        match tokio::time::timeout(KILL_REAP_TIMEOUT, handle.wait()).await {
            Ok(report) => Some(report),
            Err(_) => {
                error!(id = %handle.id, pid = handle.pid, "Process not reaped after SIGKILL");
                None
            }
        }
    }

    /// Send SIGTERM while holding the table lock so a reaped (and possibly
    /// reused) pid is never signalled.
    fn signal_terminate(&self, id: ProcessId) {
        let mut children = self.children.lock();
        let Some(supervised) = children.get_mut(&id) else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = supervised.child.id() {
            debug!(label = %supervised.label, %id, pid, "Sending SIGTERM");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = supervised.child.start_kill();
        }
    }

    fn kill(&self, id: ProcessId) {
        let mut children = self.children.lock();
        if let Some(supervised) = children.get_mut(&id) {
            if let Err(e) = supervised.child.start_kill() {
                warn!(label = %supervised.label, %id, error = %e, "Failed to send SIGKILL");
            }
        }
    }
}

#[cfg(unix)]
async fn recv_sigchld(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn forward_output<R>(stream: R, label: String, channel: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(label = %label, channel, "{}", line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleep_spec(secs: &str) -> LaunchSpec {
        LaunchSpec::new("test", "sleep").arg(secs)
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        let err = supervisor
            .launch(&LaunchSpec::new("test", "/nonexistent/definitely-not-here"))
            .unwrap_err();
        assert!(matches!(err, SpawnError::NotFound(_)));
        assert_eq!(supervisor.supervised_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_is_reported_once() {
        let (supervisor, mut rx) = ProcessSupervisor::with_sweep_interval(Duration::from_millis(20));
        tokio::spawn(Arc::clone(&supervisor).run());

        let handle = supervisor.launch(&LaunchSpec::new("test", "true")).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(report.success());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, handle.id());
        assert_eq!(event.report, report);

        // Further sweeps must not report it again
        assert_eq!(supervisor.reap(), 0);
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert!(!supervisor.is_supervised(handle.id()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let (supervisor, _rx) = ProcessSupervisor::with_sweep_interval(Duration::from_millis(20));
        tokio::spawn(Arc::clone(&supervisor).run());

        let handle = supervisor
            .launch(&LaunchSpec::new("test", "sh").arg("-c").arg("exit 3"))
            .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(report.code, Some(3));
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_wait_after_exit_returns_same_report() {
        let (supervisor, _rx) = ProcessSupervisor::with_sweep_interval(Duration::from_millis(20));
        tokio::spawn(Arc::clone(&supervisor).run());

        let handle = supervisor
            .launch(&LaunchSpec::new("test", "sh").arg("-c").arg("exit 5"))
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(handle.has_exited());

        // Already reaped: resolves immediately from the stored report
        let second = tokio::time::timeout(Duration::from_millis(100), handle.wait())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.code, Some(5));
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let (supervisor, _rx) = ProcessSupervisor::with_sweep_interval(Duration::from_millis(20));
        tokio::spawn(Arc::clone(&supervisor).run());

        let handle = supervisor.launch(&sleep_spec("60")).unwrap();
        assert!(!handle.has_exited());

        let report = supervisor
            .terminate(&handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.signal, Some(libc::SIGTERM));
        assert!(handle.has_exited());
        assert_eq!(supervisor.supervised_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let (supervisor, _rx) = ProcessSupervisor::with_sweep_interval(Duration::from_millis(20));
        tokio::spawn(Arc::clone(&supervisor).run());

        // Ignores SIGTERM
        let handle = supervisor
            .launch(
                &LaunchSpec::new("test", "sh")
                    .arg("-c")
                    .arg("trap '' TERM; while true; do sleep 1; done"),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = supervisor
            .terminate(&handle, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(report.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_external_kill_is_noticed() {
        let (supervisor, mut rx) = ProcessSupervisor::new();
        tokio::spawn(Arc::clone(&supervisor).run());

        let handle = supervisor.launch(&sleep_spec("60")).unwrap();
        let pid = handle.pid().unwrap();
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, handle.id());
        assert_eq!(event.pid, Some(pid));
        assert_eq!(event.report.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_exit_report_display() {
        let code = ExitReport { code: Some(1), signal: None };
        let signal = ExitReport { code: None, signal: Some(9) };
        assert_eq!(code.to_string(), "exit code 1");
        assert_eq!(signal.to_string(), "signal 9");
        assert_eq!(ExitReport::unknown().to_string(), "unknown status");
    }
}
