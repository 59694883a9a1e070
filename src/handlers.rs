//! Built-in handlers: health, sign-out, static files and the not-found page

use crate::auth::SecureGate;
use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::router::{AsyncHandler, AuthMode, BlockingHandler, Handler, RequestContext, RouteTable, RouteTableBuilder};
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER, SET_COOKIE};
use hyper::{Method, Request, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const HEALTH_PATH: &str = "/health";
pub const SIGN_OUT_PATH: &str = "/auth-sign-out";
/// Page templates under the document root, never served directly
pub const TEMPLATES_PATH: &str = "/templates";
const OFFLINE_PAGE: &str = "offline.htm";

/// Assemble the frozen route table: proxied prefixes from the configuration
/// plus the built-in handlers
pub fn build_route_table(
    config: &Config,
    registry: Arc<SessionRegistry>,
    gate: Arc<SecureGate>,
) -> anyhow::Result<Arc<RouteTable>> {
    let mut builder = RouteTableBuilder::new();

    if config.server.offline {
        let page = offline_page(config.server.www_root.as_deref().map(Path::new));
        builder.add_handler(HEALTH_PATH, health_handler(registry, "offline"), AuthMode::Public)?;
        builder.set_default(Handler::Blocking(offline_handler(page)), AuthMode::Public)?;
        builder.set_not_found(not_found_handler());
        return Ok(builder.freeze());
    }

    for route in config.effective_routes() {
        builder.add_handler(&route.prefix, Handler::Proxy, route.auth)?;
    }

    builder.add_handler(HEALTH_PATH, health_handler(Arc::clone(&registry), "ok"), AuthMode::Public)?;
    builder.add_handler(
        SIGN_OUT_PATH,
        Handler::Async(Arc::new(SignOut::new(registry, gate))),
        AuthMode::Public,
    )?;

    builder.add_handler(TEMPLATES_PATH, Handler::Blocking(not_found_handler()), AuthMode::Public)?;

    if let Some(root) = &config.server.www_root {
        let files = StaticFiles::new(root);
        builder.set_default(Handler::Blocking(files.into_handler()), AuthMode::Public)?;
    }
    builder.set_not_found(not_found_handler());

    Ok(builder.freeze())
}

/// `{"status":<status>,"sessions":N}`
pub fn health_handler(registry: Arc<SessionRegistry>, status: &'static str) -> Handler {
    Handler::blocking(move |_req| {
        let body = serde_json::json!({
            "status": status,
            "sessions": registry.len(),
        });
        Some(json_response(StatusCode::OK, body.to_string()))
    })
}

pub fn not_found_handler() -> BlockingHandler {
    Arc::new(|req: &Request<Bytes>| {
        debug!(path = req.uri().path(), "Not found");
        Some(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(CONTENT_TYPE, "text/html; charset=utf-8")
                .body(Full::new(Bytes::from_static(NOT_FOUND_HTML.as_bytes())))
                .expect("valid response builder"),
        )
    })
}

const NOT_FOUND_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Not Found</title></head>
<body><h1>404 Not Found</h1><p>The requested page does not exist.</p></body>
</html>
"#;

const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body><h1>Temporarily offline</h1><p>The server is offline for maintenance. Please try again later.</p></body>
</html>
"#;

/// `offline.htm` from the document root, or the built-in page
pub fn offline_page(www_root: Option<&Path>) -> Bytes {
    www_root
        .map(|root| root.join(OFFLINE_PAGE))
        .and_then(|path| match std::fs::read(&path) {
            Ok(contents) => Some(Bytes::from(contents)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Offline page unreadable, using built-in page");
                None
            }
        })
        .unwrap_or_else(|| Bytes::from_static(OFFLINE_HTML.as_bytes()))
}

/// 503 with `page` for every request
pub fn offline_handler(page: Bytes) -> BlockingHandler {
    Arc::new(move |req: &Request<Bytes>| {
        debug!(path = req.uri().path(), "Offline");
        let body = if req.method() == Method::HEAD {
            Bytes::new()
        } else {
            page.clone()
        };
        Some(
            Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header(CONTENT_TYPE, "text/html; charset=utf-8")
                .header(RETRY_AFTER, "60")
                .body(Full::new(body))
                .expect("valid response builder"),
        )
    })
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response builder")
}

/// Ends the caller's session: terminates its backend, clears the cookie and
/// sends the browser to sign-in
pub struct SignOut {
    registry: Arc<SessionRegistry>,
    gate: Arc<SecureGate>,
}

impl SignOut {
    pub fn new(registry: Arc<SessionRegistry>, gate: Arc<SecureGate>) -> Self {
        Self { registry, gate }
    }
}

impl AsyncHandler for SignOut {
    fn call(
        &self,
        req: Request<Incoming>,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Response<BoxBody<Bytes, hyper::Error>>> {
        // Public route, so an expired cookie can still sign out
        let identity = self.gate.authenticate(req.headers()).ok();
        let registry = Arc::clone(&self.registry);
        let location = self.gate.login_url().to_string();
        let cookie = self.gate.create_logout_cookie();

        Box::pin(async move {
            if let Some(identity) = identity {
                info!(identity = %identity, request_id = %ctx.request_id, "Signing out");
                tokio::spawn(async move {
                    registry.terminate(&identity).await;
                });
            }

            Response::builder()
                .status(StatusCode::FOUND)
                .header(LOCATION, location)
                .header(SET_COOKIE, cookie)
                .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
                .expect("valid response builder")
        })
    }
}

/// Files under a document root, for GET and HEAD
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn into_handler(self) -> BlockingHandler {
        Arc::new(move |req: &Request<Bytes>| self.serve(req))
    }

    /// `None` for other methods, unsafe paths and missing files
    pub fn serve(&self, req: &Request<Bytes>) -> Option<Response<Full<Bytes>>> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return None;
        }

        let mut path = self.resolve(req.uri().path())?;
        if path.is_dir() {
            path.push("index.html");
        }
        let contents = std::fs::read(&path).ok()?;

        let body = if req.method() == Method::HEAD {
            Bytes::new()
        } else {
            Bytes::from(contents)
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type(&path))
            .body(Full::new(body))
            .ok()
    }

    /// Map a URI path below the root, refusing anything that could escape it
    fn resolve(&self, uri_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(uri_path).ok()?;
        if decoded.contains('\0') || decoded.contains('\\') {
            return None;
        }

        let mut path = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

fn content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime)
    } else {
        mime.to_string()
    }
}
