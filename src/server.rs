//! Async HTTP front end: accept loop, authentication and route dispatch

use crate::auth::SecureGate;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::proxy::{SessionProxy, X_REQUEST_ID};
use crate::router::{BlockingHandler, Handler, RequestContext, RouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Polling interval while waiting for open connections to finish
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Everything a request needs once the connection is accepted
pub struct Gateway {
    routes: Arc<RouteTable>,
    gate: Arc<SecureGate>,
    proxy: Arc<SessionProxy>,
    max_blocking_body_bytes: usize,
}

impl Gateway {
    pub fn new(
        routes: Arc<RouteTable>,
        gate: Arc<SecureGate>,
        proxy: Arc<SessionProxy>,
        max_blocking_body_bytes: usize,
    ) -> Self {
        Self {
            routes,
            gate,
            proxy,
            max_blocking_body_bytes,
        }
    }

    /// Authenticate and dispatch one request
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let started = Instant::now();
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut ctx = RequestContext {
            request_id,
            client_addr,
            is_tls,
            identity: None,
        };

        let mut response = match self.routes.lookup(&path) {
            None => self.run_blocking(None, req).await,
            Some(route) => {
                let authenticated = if route.auth.requires_auth() {
                    match self.gate.authenticate(req.headers()) {
                        Ok(identity) => {
                            ctx.identity = Some(identity);
                            true
                        }
                        Err(failure) => {
                            debug!(path = %path, request_id = %ctx.request_id, reason = %failure, "Unauthenticated request");
                            false
                        }
                    }
                } else {
                    true
                };

                if !authenticated {
                    self.gate.reject(route.auth, req.uri())
                } else {
                    match &route.handler {
                        Handler::Proxy => match ctx.identity.clone() {
                            Some(identity) => self.proxy.forward(req, &identity, &ctx).await,
                            None => json_error_response(
                                GatewayErrorCode::Unauthenticated,
                                "Authentication required",
                            ),
                        },
                        Handler::Async(handler) => handler.call(req, ctx.clone()).await,
                        Handler::Blocking(handler) => {
                            self.run_blocking(Some(Arc::clone(handler)), req).await
                        }
                    }
                }
            }
        };

        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        debug!(
            %method,
            path = %path,
            status = response.status().as_u16(),
            identity = ctx.identity.as_ref().map(|i| i.as_str()),
            request_id = %ctx.request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request dispatched"
        );
        response
    }

    /// Read the body under the size limit and run `handler` (or the
    /// not-found handler) on the blocking pool
    async fn run_blocking(
        &self,
        handler: Option<BlockingHandler>,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let (parts, body) = req.into_parts();
        let bytes = match Limited::new(body, self.max_blocking_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return json_error_response(
                    GatewayErrorCode::PayloadTooLarge,
                    "Request body too large",
                );
            }
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                return json_error_response(GatewayErrorCode::InternalError, "Failed to read request body");
            }
        };
        let req = Request::from_parts(parts, bytes);

        let routes = Arc::clone(&self.routes);
        let result = tokio::task::spawn_blocking(move || {
            handler
                .and_then(|handler| handler(&req))
                .unwrap_or_else(|| routes.not_found(&req))
        })
        .await;

        match result {
            Ok(response) => response.map(|body| body.map_err(|never| match never {}).boxed()),
            Err(e) => {
                error!(error = %e, "Blocking handler failed");
                json_error_response(GatewayErrorCode::InternalError, "Internal error")
            }
        }
    }
}

/// Accepts connections and serves them until shutdown
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    grace_period: Duration,
    active_connections: Arc<AtomicUsize>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            tls_acceptor: None,
            grace_period: Duration::from_secs(10),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Time open connections get to finish after shutdown
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let gateway = Arc::clone(&self.gateway);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let shutdown = self.shutdown_rx.clone();
                            let counter = ConnectionCounter::new(&self.active_connections);

                            tokio::spawn(async move {
                                let _counter = counter;
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_connection(tls_stream, addr, gateway, true, shutdown).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_connection(stream, addr, gateway, false, shutdown).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway no longer accepting connections");
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        let start = Instant::now();
        loop {
            let remaining = self.active_connections.load(Ordering::SeqCst);
            if remaining == 0 {
                info!(drained_in_ms = start.elapsed().as_millis() as u64, "All connections closed");
                return;
            }
            if start.elapsed() > self.grace_period {
                warn!(remaining, "Grace period exceeded, abandoning open connections");
                return;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
    }
}

struct ConnectionCounter(Arc<AtomicUsize>);

impl ConnectionCounter {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ConnectionCounter {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    is_tls: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, hyper::Error>(gateway.handle(req, addr, is_tls).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_signalled(&mut shutdown_rx) => {
            // Finish in-flight requests, then close
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

/// Resolves once shutdown is requested; never if the sender goes away first
async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
