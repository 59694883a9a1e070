use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sessiongate::auth::SecureGate;
use sessiongate::config::{Config, EndpointType};
use sessiongate::endpoint::EndpointAllocator;
use sessiongate::handlers::build_route_table;
use sessiongate::launcher::{ConfiguredSpawn, Launcher, ProcessLauncher};
use sessiongate::proxy::SessionProxy;
use sessiongate::registry::{RegistryConfig, SessionRegistry};
use sessiongate::scheduler::{spawn_command, ReapIdleSessions, ScheduledCommand, SweepDeadSessions};
use sessiongate::server::{Gateway, GatewayServer};
use sessiongate::supervisor::ProcessSupervisor;
use sessiongate::{PKG_NAME, VERSION};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessiongate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sessiongate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.worker_threads)
        .max_blocking_threads(config.server.max_blocking_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config, config_path))
}

async fn run(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let tls_acceptor = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
            info!(cert = %cert_path, key = %key_path, "TLS enabled");
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        _ => None,
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Supervisor and its exit notifications
    let (supervisor, exits) = ProcessSupervisor::new();
    let supervisor_task = tokio::spawn(Arc::clone(&supervisor).run());

    let allocator = EndpointAllocator::from_config(&config.session);
    let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher::new(
        Arc::clone(&supervisor),
        allocator,
        Arc::new(ConfiguredSpawn::new(&config.session)),
        &config.session,
    ));

    let registry = SessionRegistry::new(
        launcher,
        Arc::clone(&supervisor),
        RegistryConfig::from(&config.session),
    );
    let exit_listener = tokio::spawn(Arc::clone(&registry).run_exit_listener(exits));

    let gate = Arc::new(SecureGate::from_config(&config.auth));
    let routes = build_route_table(&config, Arc::clone(&registry), Arc::clone(&gate))?;
    for route in routes.routes() {
        info!(prefix = %route.prefix, kind = route.handler.kind(), auth = ?route.auth, "Route registered");
    }

    let proxy = Arc::new(SessionProxy::new(
        Arc::clone(&registry),
        config.session.request_timeout(),
    ));
    let gateway = Arc::new(Gateway::new(
        routes,
        gate,
        proxy,
        config.server.max_blocking_body_bytes,
    ));

    // Scheduled commands
    let mut commands: Vec<Arc<dyn ScheduledCommand>> = vec![Arc::new(SweepDeadSessions::new(
        Arc::clone(&registry),
        config.server.scheduled_command_interval(),
    ))];
    if let Some(timeout) = config.session.idle_timeout() {
        commands.push(Arc::new(ReapIdleSessions::new(Arc::clone(&registry), timeout)));
    }
    let command_tasks: Vec<_> = commands
        .into_iter()
        .map(|command| spawn_command(command, shutdown_rx.clone()))
        .collect();

    let mut server = GatewayServer::new(bind_addr, gateway, shutdown_rx.clone())
        .with_grace_period(config.server.shutdown_grace_period());
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal(&config_path).await;

    // Stop accepting, let open connections finish
    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;

    info!(sessions = registry.len(), "Terminating all sessions...");
    registry.terminate_all().await;

    for task in command_tasks {
        task.abort();
    }
    exit_listener.abort();
    supervisor_task.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Block until SIGINT, SIGTERM or SIGQUIT. SIGHUP re-checks the
/// configuration file without applying it.
async fn wait_for_shutdown_signal(config_path: &Path) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigquit, mut sighup) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::quit()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(quit), Ok(hup)) => (term, quit, hup),
            _ => {
                error!("Failed to install signal handlers, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sigquit.recv() => {
                    info!("Received SIGQUIT, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, checking configuration...");
                    match Config::load(config_path) {
                        Ok(config) => info!(
                            routes = config.effective_routes().len(),
                            "Configuration is valid; restart to apply changes"
                        ),
                        Err(e) => warn!(error = %e, "Configuration is invalid"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = config_path;
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting session gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        worker_threads = config.server.worker_threads,
        max_blocking_threads = config.server.max_blocking_threads,
        www_root = ?config.server.www_root,
        offline = config.server.offline,
        "Server configuration"
    );
    if config.server.offline {
        warn!("Server is offline: every request gets the offline page and no sessions are launched");
    }
    info!(
        cookie_name = %config.auth.cookie_name,
        login_url = %config.auth.login_url,
        token_expiry_hours = config.auth.token_expiry_hours,
        static_tokens = config.auth.tokens.len(),
        "Authentication settings"
    );
    let endpoint = match config.session.endpoint {
        EndpointType::Tcp => format!(
            "tcp {}-{}",
            config.session.port_range_start, config.session.port_range_end
        ),
        EndpointType::Unix => format!("unix {}", config.session.socket_dir().display()),
    };
    info!(
        command = %config.session.command,
        args = ?config.session.args,
        endpoint = %endpoint,
        max_concurrent_launches = config.session.max_concurrent_launches,
        "Session settings"
    );
    info!(
        startup_timeout_ms = config.session.startup_timeout_ms,
        ready_check_interval_ms = config.session.ready_check_interval_ms,
        health_path = ?config.session.health_path,
        idle_timeout_secs = config.session.idle_timeout_secs,
        request_timeout_secs = config.session.request_timeout_secs,
        "Request handling defaults"
    );
    info!(
        server_grace_period_secs = config.server.shutdown_grace_period_secs,
        session_grace_period_secs = config.session.shutdown_grace_period_secs,
        drain_timeout_secs = config.session.drain_timeout_secs,
        "Shutdown settings"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}
