//! Forwarding requests to the caller's session backend
//!
//! Bodies stream in both directions; nothing is buffered whole. Each request
//! gets its own backend connection, so a connection never outlives the
//! session generation it was opened for.

use crate::auth::Identity;
use crate::endpoint::{BackendIo, Endpoint};
use crate::error::GatewayError;
use crate::launcher::LaunchError;
use crate::registry::SessionRegistry;
use crate::router::RequestContext;
use crate::session::{InFlightGuard, Session};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct SessionProxy {
    registry: Arc<SessionRegistry>,
    request_timeout: Option<Duration>,
}

impl SessionProxy {
    pub fn new(registry: Arc<SessionRegistry>, request_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            request_timeout,
        }
    }

    /// Forward `req` to the session of `identity`. Failures become JSON error
    /// responses; the client connection is never just dropped.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        identity: &Identity,
        ctx: &RequestContext,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.try_forward(req, identity, ctx).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    GatewayError::Launch(LaunchError::CapacityExceeded { .. }) => {
                        warn!(%identity, request_id = %ctx.request_id, error = %e, "Session launch rejected")
                    }
                    _ => error!(%identity, request_id = %ctx.request_id, error = %e, "Failed to proxy request"),
                }
                e.to_response()
            }
        }
    }

    async fn try_forward(
        &self,
        mut req: Request<Incoming>,
        identity: &Identity,
        ctx: &RequestContext,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, GatewayError> {
        let (session, stream) = self.connect(identity, &ctx.request_id).await?;
        let guard = session
            .begin_request()
            .ok_or(GatewayError::Launch(LaunchError::Draining))?;

        let wants_upgrade = is_upgrade_request(&req);
        let client_upgrade = wants_upgrade.then(|| hyper::upgrade::on(&mut req));
        prepare_request(&mut req, session.endpoint(), ctx, wants_upgrade);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        let conn = ConnectionTask(tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "Backend connection closed with error");
            }
        }));

        debug!(
            %identity,
            method = %req.method(),
            uri = %req.uri(),
            request_id = %ctx.request_id,
            endpoint = %session.endpoint(),
            "Forwarding request"
        );

        let send = sender.send_request(req);
        let mut response = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, send)
                .await
                .map_err(|_| GatewayError::Timeout(timeout))??,
            None => send.await?,
        };
        session.touch();

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                let (mut parts, _) = response.into_parts();
                remove_hop_by_hop(&mut parts.headers, true);

                let request_id = ctx.request_id.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let _conn = conn;
                    tunnel(client_upgrade, backend_upgrade, &request_id).await;
                });

                return Ok(Response::from_parts(
                    parts,
                    Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
                ));
            }
        }

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers, false);

        let body = SessionBody {
            inner: body,
            guard,
            _conn: conn,
        };
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Connect to the identity's session. A refused connection on a session
    /// believed live evicts it and retries exactly once with a fresh launch.
    async fn connect(
        &self,
        identity: &Identity,
        request_id: &str,
    ) -> Result<(Arc<Session>, Box<dyn BackendIo>), GatewayError> {
        let session = self.registry.get_or_create(identity).await?;
        match session.endpoint().connect().await {
            Ok(stream) => return Ok((session, stream)),
            Err(e) if is_stale_endpoint(&e) => {
                warn!(
                    %identity,
                    endpoint = %session.endpoint(),
                    request_id,
                    error = %e,
                    "Session refused connection, relaunching"
                );
                self.registry.evict(identity, &session);
            }
            Err(e) => return Err(unreachable(session.endpoint(), e)),
        }

        let session = self.registry.get_or_create(identity).await?;
        let stream = session
            .endpoint()
            .connect()
            .await
            .map_err(|e| unreachable(session.endpoint(), e))?;
        info!(%identity, endpoint = %session.endpoint(), request_id, "Reconnected to relaunched session");
        Ok((session, stream))
    }
}

fn unreachable(endpoint: &Endpoint, source: std::io::Error) -> GatewayError {
    GatewayError::BackendUnreachable {
        endpoint: endpoint.to_string(),
        source,
    }
}

fn is_stale_endpoint(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

/// Check if a request is an HTTP/1.1 upgrade (e.g. WebSocket)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    req.version() == Version::HTTP_11 && has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

/// Rewrite a client request for the backend: origin-form URI, HTTP/1.1,
/// hop-by-hop headers removed, X-Forwarded-* overwritten.
fn prepare_request<B>(req: &mut Request<B>, endpoint: &Endpoint, ctx: &RequestContext, upgrade: bool) {
    let original_host = req.headers().get(HOST).cloned().or_else(|| {
        req.uri()
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    });

    let origin_form = req
        .uri()
        .path_and_query()
        .and_then(|pq| pq.as_str().parse::<Uri>().ok())
        .unwrap_or_else(|| Uri::from_static("/"));
    *req.uri_mut() = origin_form;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    remove_hop_by_hop(headers, upgrade);

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    // Overwritten, not appended: the gateway is the first trusted hop
    if let Ok(value) = HeaderValue::from_str(&ctx.client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    let proto = if ctx.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    match original_host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host.clone());
            headers.entry(HOST).or_insert(host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
            if let Ok(value) = HeaderValue::from_str(&endpoint.host_header()) {
                headers.insert(HOST, value);
            }
        }
    }
}

fn remove_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        if keep_upgrade && name == UPGRADE {
            continue;
        }
        headers.remove(&name);
    }

    for name in HOP_BY_HOP {
        if keep_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }

    if keep_upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

async fn tunnel(
    client: hyper::upgrade::OnUpgrade,
    backend: hyper::upgrade::OnUpgrade,
    request_id: &str,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(request_id, error = %e, "Upgrade failed");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(request_id, client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Aborts the backend connection task when dropped
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Response body streamed from a session backend.
///
/// Holds the session's in-flight slot until the stream finishes or the
/// client goes away; dropping it closes the backend connection.
struct SessionBody {
    inner: Incoming,
    guard: InFlightGuard,
    _conn: ConnectionTask,
}

impl Body for SessionBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.guard.session().touch();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                // Propagating the error makes the server close the client connection
                warn!(
                    identity = %this.guard.session().identity(),
                    error = %e,
                    "Backend response stream truncated"
                );
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
