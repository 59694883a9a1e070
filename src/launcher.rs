//! Session launching: spawn a backend and wait until it accepts connections

use crate::auth::Identity;
use crate::config::SessionConfig;
use crate::endpoint::{Endpoint, EndpointAllocator};
use crate::session::Session;
use crate::supervisor::{LaunchSpec, ProcessSupervisor};
use futures::future::BoxFuture;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Upper bound for a single readiness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    #[error("launch capacity of {limit} concurrent launches reached")]
    CapacityExceeded { limit: usize },

    #[error("no endpoint available: {0}")]
    EndpointUnavailable(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("backend not ready within {timeout_ms}ms")]
    ReadinessTimeout { timeout_ms: u64 },

    #[error("backend exited during startup ({0})")]
    ExitedDuringStartup(String),

    #[error("launch superseded by termination")]
    Cancelled,

    #[error("session is draining")]
    Draining,

    #[error("registry is shutting down")]
    ShuttingDown,

    #[error("launch task failed: {0}")]
    Internal(String),
}

impl LaunchError {
    /// Failures of the process itself, worth one fresh attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LaunchError::Spawn(_) | LaunchError::ReadinessTimeout { .. } | LaunchError::ExitedDuringStartup(_)
        )
    }
}

/// Produces ready sessions
pub trait Launcher: Send + Sync {
    fn launch(&self, identity: Identity) -> BoxFuture<'static, Result<Arc<Session>, LaunchError>>;
}

/// Decides what process serves `identity` on `endpoint`
pub trait SpawnFactory: Send + Sync {
    fn command_for(&self, identity: &Identity, endpoint: &Endpoint) -> LaunchSpec;
}

/// Spawn factory driven by the `[session]` configuration
///
/// `{user}`, `{port}` and `{endpoint}` are substituted in arguments. The
/// backend also receives `SESSION_USER`, `SESSION_ENDPOINT` and either `PORT`
/// or `SESSION_SOCKET`.
#[derive(Debug, Clone)]
pub struct ConfiguredSpawn {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<String>,
}

impl ConfiguredSpawn {
    pub fn new(config: &SessionConfig) -> Self {
        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env,
            working_dir: config.working_dir.clone(),
        }
    }
}

impl SpawnFactory for ConfiguredSpawn {
    fn command_for(&self, identity: &Identity, endpoint: &Endpoint) -> LaunchSpec {
        let port = endpoint.port().map(|p| p.to_string()).unwrap_or_default();
        let address = match endpoint {
            Endpoint::Tcp(addr) => addr.to_string(),
            Endpoint::Unix(path) => path.display().to_string(),
        };

        let substitute = |arg: &String| {
            arg.replace("{user}", identity.as_str())
                .replace("{port}", &port)
                .replace("{endpoint}", &address)
        };

        let mut spec = LaunchSpec::new(identity.as_str(), &self.command);
        spec.args = self.args.iter().map(substitute).collect();
        spec.env = self.env.clone();
        spec.working_dir = self.working_dir.clone();

        spec = spec
            .env("SESSION_USER", identity.as_str())
            .env("SESSION_ENDPOINT", &address);
        spec = match endpoint {
            Endpoint::Tcp(_) => spec.env("PORT", &port),
            Endpoint::Unix(_) => spec.env("SESSION_SOCKET", &address),
        };
        spec
    }
}

/// Launches supervised backend processes
#[derive(Clone)]
pub struct ProcessLauncher {
    supervisor: Arc<ProcessSupervisor>,
    allocator: Arc<EndpointAllocator>,
    factory: Arc<dyn SpawnFactory>,
    permits: Arc<Semaphore>,
    limit: usize,
    startup_timeout: Duration,
    ready_check_interval: Duration,
    health_path: Option<String>,
    shutdown_grace_period: Duration,
}

impl ProcessLauncher {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        allocator: Arc<EndpointAllocator>,
        factory: Arc<dyn SpawnFactory>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            supervisor,
            allocator,
            factory,
            permits: Arc::new(Semaphore::new(config.max_concurrent_launches)),
            limit: config.max_concurrent_launches,
            startup_timeout: config.startup_timeout(),
            ready_check_interval: config.ready_check_interval(),
            health_path: config.health_path.clone(),
            shutdown_grace_period: config.shutdown_grace_period(),
        }
    }

    /// Launches currently in progress
    pub fn launches_in_progress(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    async fn launch_session(&self, identity: Identity) -> Result<Arc<Session>, LaunchError> {
        let lease = self.allocator.allocate(&identity).map_err(|e| {
            error!(%identity, error = %e, "Failed to assign session endpoint");
            LaunchError::EndpointUnavailable(e.to_string())
        })?;
        let endpoint = lease.endpoint().clone();

        let spec = self.factory.command_for(&identity, &endpoint);
        let handle = self.supervisor.launch(&spec).map_err(|e| {
            error!(%identity, command = %spec.command, error = %e, "Failed to spawn session");
            LaunchError::Spawn(e.to_string())
        })?;

        info!(%identity, %endpoint, pid = handle.pid(), "Session launching");
        let session = Arc::new(Session::launching(identity.clone(), lease, handle));

        let result = match tokio::time::timeout(self.startup_timeout, self.poll_ready(&session)).await {
            Ok(result) => result,
            Err(_) => Err(LaunchError::ReadinessTimeout {
                timeout_ms: self.startup_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => {
                if !session.mark_ready() {
                    self.discard(session);
                    return Err(LaunchError::Cancelled);
                }
                info!(
                    %identity,
                    %endpoint,
                    pid = session.pid(),
                    startup_ms = session.uptime().as_millis() as u64,
                    "Session ready"
                );
                Ok(session)
            }
            Err(e) => {
                warn!(%identity, %endpoint, error = %e, "Session failed to start");
                self.discard(session);
                Err(e)
            }
        }
    }

    /// Poll until the endpoint accepts connections (and the health path
    /// answers 2xx, when configured). Fails as soon as the process exits.
    async fn poll_ready(&self, session: &Session) -> Result<(), LaunchError> {
        loop {
            if let Some(report) = session.exit_report() {
                return Err(LaunchError::ExitedDuringStartup(report.to_string()));
            }

            match tokio::time::timeout(PROBE_TIMEOUT, self.probe(session.endpoint())).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {
                    debug!(identity = %session.identity(), "Health check returned unhealthy");
                }
                Ok(Err(e)) => {
                    debug!(identity = %session.identity(), error = %e, "Session not accepting connections yet");
                }
                Err(_) => {
                    debug!(identity = %session.identity(), "Readiness probe timed out");
                }
            }

            tokio::time::sleep(self.ready_check_interval).await;
        }
    }

    async fn probe(&self, endpoint: &Endpoint) -> anyhow::Result<bool> {
        let stream = endpoint.connect().await?;
        let Some(path) = &self.health_path else {
            return Ok(true);
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        let conn = tokio::spawn(conn);

        let request = Request::get(path.as_str())
            .header(hyper::header::HOST, endpoint.host_header())
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(request).await;
        conn.abort();

        Ok(response?.status().is_success())
    }

    /// Terminate a half-started session in the background. The session (and
    /// with it the endpoint lease) lives until the process is gone.
    fn discard(&self, session: Arc<Session>) {
        session.mark_terminated();
        let Some(handle) = session.take_process() else {
            return;
        };

        let supervisor = Arc::clone(&self.supervisor);
        let grace = self.shutdown_grace_period;
        tokio::spawn(async move {
            let report = supervisor.terminate(&handle, grace).await;
            debug!(identity = %session.identity(), ?report, "Orphaned session process terminated");
            drop(session);
        });
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, identity: Identity) -> BoxFuture<'static, Result<Arc<Session>, LaunchError>> {
        // Fail fast: no endpoint or process is touched without a permit
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%identity, limit = self.limit, "Launch capacity reached");
                let limit = self.limit;
                return Box::pin(async move { Err(LaunchError::CapacityExceeded { limit }) });
            }
        };

        // The permit covers the relaunch too
        let launcher = self.clone();
        Box::pin(async move {
            let result = match launcher.launch_session(identity.clone()).await {
                Err(e) if e.is_retryable() => {
                    warn!(%identity, error = %e, "Session launch failed, relaunching once");
                    launcher.launch_session(identity).await
                }
                result => result,
            };
            drop(permit);
            result
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runs `sleep` and, when `listen` is set, binds the endpoint in-process
    /// so the connect probe succeeds.
    /// `first_command` is used for the first spawn only, when set.
    struct SleepFactory {
        command: &'static str,
        first_command: Option<&'static str>,
        listen: bool,
        calls: AtomicUsize,
        listeners: Mutex<Vec<std::net::TcpListener>>,
    }

    impl SleepFactory {
        fn new(command: &'static str, listen: bool) -> Arc<Self> {
            Arc::new(Self {
                command,
                first_command: None,
                listen,
                calls: AtomicUsize::new(0),
                listeners: Mutex::new(Vec::new()),
            })
        }

        fn failing_first(first_command: &'static str) -> Arc<Self> {
            Arc::new(Self {
                command: "sleep",
                first_command: Some(first_command),
                listen: true,
                calls: AtomicUsize::new(0),
                listeners: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SpawnFactory for SleepFactory {
        fn command_for(&self, identity: &Identity, endpoint: &Endpoint) -> LaunchSpec {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let (0, Some(command)) = (call, self.first_command) {
                return LaunchSpec::new(identity.as_str(), command).arg("30");
            }
            if self.listen {
                if let Endpoint::Tcp(addr) = endpoint {
                    self.listeners
                        .lock()
                        .push(std::net::TcpListener::bind(addr).unwrap());
                }
            }
            LaunchSpec::new(identity.as_str(), self.command).arg("30")
        }
    }

    fn setup(
        factory: Arc<dyn SpawnFactory>,
        tweak: impl FnOnce(&mut SessionConfig),
    ) -> (ProcessLauncher, Arc<ProcessSupervisor>) {
        let (supervisor, _rx) = ProcessSupervisor::with_sweep_interval(Duration::from_millis(20));
        tokio::spawn(Arc::clone(&supervisor).run());

        let mut config = SessionConfig::new("unused");
        config.port_range_start = 41000;
        config.port_range_end = 41999;
        config.startup_timeout_ms = 2000;
        config.ready_check_interval_ms = 20;
        config.shutdown_grace_period_secs = 1;
        tweak(&mut config);

        let allocator = EndpointAllocator::from_config(&config);
        let launcher = ProcessLauncher::new(Arc::clone(&supervisor), allocator, factory, &config);
        (launcher, supervisor)
    }

    #[test]
    fn test_configured_spawn_substitution() {
        let mut config = SessionConfig::new("/usr/bin/backend").with_args(vec![
            "--user={user}".to_string(),
            "--port".to_string(),
            "{port}".to_string(),
        ]);
        config.env = HashMap::from([("LANG".to_string(), "C".to_string())]);

        let factory = ConfiguredSpawn::new(&config);
        let endpoint = Endpoint::Tcp("127.0.0.1:20005".parse().unwrap());
        let spec = factory.command_for(&Identity::new("alice"), &endpoint);

        assert_eq!(spec.command, "/usr/bin/backend");
        assert_eq!(spec.args, vec!["--user=alice", "--port", "20005"]);
        assert!(spec.env.contains(&("LANG".to_string(), "C".to_string())));
        assert!(spec.env.contains(&("SESSION_USER".to_string(), "alice".to_string())));
        assert!(spec.env.contains(&("PORT".to_string(), "20005".to_string())));
        assert!(spec.env.contains(&(
            "SESSION_ENDPOINT".to_string(),
            "127.0.0.1:20005".to_string()
        )));
    }

    #[test]
    fn test_configured_spawn_unix_endpoint() {
        let config = SessionConfig::new("backend").with_args(vec!["--socket={endpoint}".to_string()]);
        let factory = ConfiguredSpawn::new(&config);
        let endpoint = Endpoint::Unix("/run/s/alice-1.sock".into());
        let spec = factory.command_for(&Identity::new("alice"), &endpoint);

        assert_eq!(spec.args, vec!["--socket=/run/s/alice-1.sock"]);
        assert!(spec.env.contains(&(
            "SESSION_SOCKET".to_string(),
            "/run/s/alice-1.sock".to_string()
        )));
        assert!(!spec.env.iter().any(|(k, _)| k == "PORT"));
    }

    #[tokio::test]
    async fn test_launch_ready() {
        let (launcher, _supervisor) = setup(SleepFactory::new("sleep", true), |_| {});

        let session = launcher.launch(Identity::new("alice")).await.unwrap();
        assert!(session.is_usable());
        assert!(session.pid().is_some());
        assert_eq!(launcher.launches_in_progress(), 0);
    }

    #[tokio::test]
    async fn test_readiness_timeout_terminates_orphan() {
        let factory = SleepFactory::new("sleep", false);
        let (launcher, supervisor) = setup(factory.clone(), |c| {
            c.startup_timeout_ms = 50;
        });

        let err = launcher.launch(Identity::new("alice")).await.unwrap_err();
        assert!(matches!(err, LaunchError::ReadinessTimeout { timeout_ms: 50 }));
        assert_eq!(factory.calls(), 2);

        // The half-started process is terminated in the background
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while supervisor.supervised_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "orphan not terminated");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let factory = SleepFactory::new("false", false);
        let (launcher, _supervisor) = setup(factory.clone(), |_| {});

        let err = launcher.launch(Identity::new("alice")).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExitedDuringStartup(_)));
        // One relaunch, then the failure surfaces
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_launch_recovered_by_relaunch() {
        let factory = SleepFactory::failing_first("false");
        let (launcher, _supervisor) = setup(factory.clone(), |c| {
            c.port_range_start = 42000;
            c.port_range_end = 42099;
        });

        let session = launcher.launch(Identity::new("alice")).await.unwrap();
        assert!(session.is_usable());
        assert_eq!(factory.calls(), 2);
        assert_eq!(launcher.launches_in_progress(), 0);
    }

    #[test]
    fn test_only_process_failures_are_retried() {
        assert!(LaunchError::Spawn("exec".to_string()).is_retryable());
        assert!(LaunchError::ReadinessTimeout { timeout_ms: 50 }.is_retryable());
        assert!(LaunchError::ExitedDuringStartup("exit 1".to_string()).is_retryable());
        assert!(!LaunchError::CapacityExceeded { limit: 1 }.is_retryable());
        assert!(!LaunchError::EndpointUnavailable("full".to_string()).is_retryable());
        assert!(!LaunchError::Cancelled.is_retryable());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let factory = SleepFactory::new("/nonexistent/backend", false);
        let (launcher, _supervisor) = setup(factory.clone(), |_| {});

        let err = launcher.launch(Identity::new("alice")).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_fails_fast() {
        let (launcher, supervisor) = setup(SleepFactory::new("sleep", false), |c| {
            c.max_concurrent_launches = 1;
            c.startup_timeout_ms = 500;
        });

        let first = launcher.launch(Identity::new("alice"));
        let first = tokio::spawn(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.launches_in_progress(), 1);
        let spawned = supervisor.supervised_count();

        let err = launcher.launch(Identity::new("bob")).await.unwrap_err();
        assert!(matches!(err, LaunchError::CapacityExceeded { limit: 1 }));
        assert_eq!(supervisor.supervised_count(), spawned);

        let _ = first.await.unwrap();
        assert_eq!(launcher.launches_in_progress(), 0);
    }
}
