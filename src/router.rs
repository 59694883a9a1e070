//! Route table: URI prefix to handler kind and authentication mode
//!
//! Routes are registered on a [`RouteTableBuilder`] during startup and frozen
//! into an immutable [`RouteTable`] before the server accepts connections.
//! Lookups take no locks.

use crate::auth::Identity;
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// What happens to requests that fail authentication
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No credential required
    Public,
    /// Answer 401
    Reject,
    /// Send the browser to the sign-in page
    Redirect,
}

impl AuthMode {
    pub fn requires_auth(&self) -> bool {
        !matches!(self, AuthMode::Public)
    }
}

/// Synchronous handler run on the blocking pool with a fully read body.
/// `None` falls through to the not-found handler.
pub type BlockingHandler =
    Arc<dyn Fn(&Request<Bytes>) -> Option<Response<Full<Bytes>>> + Send + Sync>;

/// Per-request facts established before dispatch
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_addr: SocketAddr,
    pub is_tls: bool,
    /// Set when the route requires authentication
    pub identity: Option<Identity>,
}

/// Handler that runs on the connection's task
pub trait AsyncHandler: Send + Sync {
    fn call(
        &self,
        req: Request<Incoming>,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Response<BoxBody<Bytes, hyper::Error>>>;
}

/// Handler kind, fixed at registration
#[derive(Clone)]
pub enum Handler {
    Blocking(BlockingHandler),
    Async(Arc<dyn AsyncHandler>),
    /// Forward to the caller's session backend
    Proxy,
}

impl Handler {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&Request<Bytes>) -> Option<Response<Full<Bytes>>> + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Blocking(_) => "blocking",
            Handler::Async(_) => "async",
            Handler::Proxy => "proxy",
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub handler: Handler,
    pub auth: AuthMode,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    fn specificity(&self) -> usize {
        self.prefix.trim_end_matches('/').len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route prefix '{0}' must start with '/'")]
    InvalidPrefix(String),
    #[error("route prefix '{0}' registered twice")]
    Duplicate(String),
    #[error("proxied route '{0}' cannot be public")]
    PublicProxy(String),
}

#[derive(Default)]
pub struct RouteTableBuilder {
    routes: Vec<Route>,
    default: Option<Route>,
    not_found: Option<BlockingHandler>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(
        &mut self,
        prefix: &str,
        handler: Handler,
        auth: AuthMode,
    ) -> Result<&mut Self, RouteError> {
        if !prefix.starts_with('/') {
            return Err(RouteError::InvalidPrefix(prefix.to_string()));
        }
        if matches!(handler, Handler::Proxy) && auth == AuthMode::Public {
            return Err(RouteError::PublicProxy(prefix.to_string()));
        }
        if self.routes.iter().any(|r| r.prefix == prefix) {
            return Err(RouteError::Duplicate(prefix.to_string()));
        }

        self.routes.push(Route {
            prefix: prefix.to_string(),
            handler,
            auth,
        });
        Ok(self)
    }

    /// Handler for paths no prefix matches
    pub fn set_default(&mut self, handler: Handler, auth: AuthMode) -> Result<&mut Self, RouteError> {
        if matches!(handler, Handler::Proxy) && auth == AuthMode::Public {
            return Err(RouteError::PublicProxy("<default>".to_string()));
        }
        self.default = Some(Route {
            prefix: "/".to_string(),
            handler,
            auth,
        });
        Ok(self)
    }

    pub fn set_not_found(&mut self, handler: BlockingHandler) -> &mut Self {
        self.not_found = Some(handler);
        self
    }

    pub fn freeze(self) -> Arc<RouteTable> {
        let mut routes = self.routes;
        // Longest prefix first; stable sort keeps registration order on ties
        routes.sort_by_key(|r| std::cmp::Reverse(r.specificity()));

        Arc::new(RouteTable {
            routes,
            default: self.default,
            not_found: self.not_found,
        })
    }
}

/// Frozen route table
pub struct RouteTable {
    routes: Vec<Route>,
    default: Option<Route>,
    not_found: Option<BlockingHandler>,
}

impl RouteTable {
    /// Longest prefix match on segment boundaries, else the default route
    pub fn lookup(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.matches(path))
            .or(self.default.as_ref())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Render the not-found response for `req`
    pub fn not_found(&self, req: &Request<Bytes>) -> Response<Full<Bytes>> {
        self.not_found
            .as_ref()
            .and_then(|handler| handler(req))
            .unwrap_or_else(default_not_found)
    }
}

fn default_not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from_static(b"Not Found")))
        .expect("valid response builder")
}
