//! Loopback HTTP surface for agent hooks and the response viewer.
//!
//! One accept loop on a background thread. Hook POSTs are authenticated via
//! the shared-secret header, acknowledged immediately, and processed on a
//! short-lived thread afterwards so a provider's settle delay never blocks
//! the next hook delivery.

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tiny_http::{Header, Response, Server};
use tracing::{debug, info, warn};

use crate::dispatch::EventDispatcher;
use crate::responses::ResponseCache;
use crate::state::{InjectOutcome, SessionStateMachine};

/// Shared-secret header name for hook and inject endpoints.
pub const SECRET_HEADER: &str = "x-tether-secret";

const MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_AGENT: &str = "claude-code";

pub struct ServerDeps {
    pub dispatcher: Arc<EventDispatcher>,
    pub state: Arc<SessionStateMachine>,
    pub responses: Arc<ResponseCache>,
    pub secret: String,
    pub viewer_origin: String,
}

pub struct HookServer {
    server: Arc<Server>,
    port: u16,
}

impl HookServer {
    /// Bind 127.0.0.1 only; the tunnel is the single public entry point.
    pub fn bind(port: u16) -> Result<Self> {
        let server = Server::http(("127.0.0.1", port))
            .map_err(|e| anyhow::anyhow!("failed to bind hook server on port {port}: {e}"))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .context("hook server has no IP listen address")?;
        Ok(Self {
            server: Arc::new(server),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the accept loop until `stop()`.
    pub fn spawn(&self, deps: ServerDeps) -> std::thread::JoinHandle<()> {
        let server = Arc::clone(&self.server);
        let deps = Arc::new(deps);
        std::thread::spawn(move || {
            info!(port = server.server_addr().to_ip().map(|a| a.port()).unwrap_or(0), "hook server listening");
            for request in server.incoming_requests() {
                handle_request(request, &deps);
            }
            debug!("hook server accept loop ended");
        })
    }

    pub fn stop(&self) {
        self.server.unblock();
    }
}

fn handle_request(mut request: tiny_http::Request, deps: &Arc<ServerDeps>) {
    let method = request.method().to_string();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or(&url).to_string();

    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => {
            let _ = request.respond(Response::from_string("healthy"));
        }
        ("GET", p) if p.starts_with("/api/responses/") => {
            let id = p.trim_start_matches("/api/responses/").to_string();
            handle_response_fetch(request, deps, &id);
        }
        ("POST", "/hook/stop") => handle_hook(request, deps, HookKind::Stop),
        ("POST", "/hook/session-start") => handle_hook(request, deps, HookKind::SessionStart),
        ("POST", "/hook/notification") => handle_hook(request, deps, HookKind::Notification),
        ("POST", "/api/inject") => handle_inject(request, deps),
        _ => {
            let response = Response::from_string("{\"error\":\"not_found\"}")
                .with_status_code(404)
                .with_header(json_content_type());
            let _ = request.respond(response);
        }
    }
}

#[derive(Clone, Copy)]
enum HookKind {
    Stop,
    SessionStart,
    Notification,
}

fn handle_hook(mut request: tiny_http::Request, deps: &Arc<ServerDeps>, kind: HookKind) {
    if !is_authorized(&request, &deps.secret) {
        let _ = request.respond(Response::from_string("forbidden").with_status_code(403));
        return;
    }

    let body = match read_request_body(&mut request) {
        Ok(body) => body,
        Err(status) => {
            let _ = request.respond(Response::from_string("bad request").with_status_code(status));
            return;
        }
    };

    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "dropping hook with malformed JSON body");
            let _ = request.respond(
                Response::from_string("invalid payload").with_status_code(400),
            );
            return;
        }
    };

    // Ack before processing: settle delays must not block the hook script
    // or the next delivery.
    let _ = request.respond(Response::from_string("ok"));

    let deps = Arc::clone(deps);
    std::thread::spawn(move || {
        let agent = payload
            .get("agent")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_AGENT)
            .to_string();
        match kind {
            HookKind::Stop => deps.dispatcher.handle_stop(&agent, &payload),
            HookKind::SessionStart => deps.dispatcher.handle_session_start(&payload),
            HookKind::Notification => deps.dispatcher.handle_notification(&agent, &payload),
        }
    });
}

fn handle_response_fetch(request: tiny_http::Request, deps: &Arc<ServerDeps>, id: &str) {
    match deps.responses.get(id) {
        Some(stored) => {
            let body = serde_json::to_string(&stored)
                .unwrap_or_else(|_| "{\"error\":\"serialize\"}".to_string());
            let response = Response::from_string(body)
                .with_header(json_content_type())
                .with_header(cors_header(&deps.viewer_origin));
            let _ = request.respond(response);
        }
        None => {
            let response = Response::from_string("{\"error\":\"not_found\"}")
                .with_status_code(404)
                .with_header(json_content_type())
                .with_header(cors_header(&deps.viewer_origin));
            let _ = request.respond(response);
        }
    }
}

/// Stand-in for the chat client's free-text reply path: inject a message
/// into a session's pane.
fn handle_inject(mut request: tiny_http::Request, deps: &Arc<ServerDeps>) {
    if !is_authorized(&request, &deps.secret) {
        let _ = request.respond(Response::from_string("forbidden").with_status_code(403));
        return;
    }

    let body = match read_request_body(&mut request) {
        Ok(body) => body,
        Err(status) => {
            let _ = request.respond(Response::from_string("bad request").with_status_code(status));
            return;
        }
    };

    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(_) => {
            let _ = request.respond(
                Response::from_string("invalid payload").with_status_code(400),
            );
            return;
        }
    };

    let session_id = payload.get("session_id").and_then(Value::as_str).unwrap_or("");
    let text = payload.get("text").and_then(Value::as_str).unwrap_or("");
    let outcome = deps.state.inject_message(session_id, text);

    let body = format!("{{\"result\":\"{}\"}}", outcome_label(outcome));
    let _ = request.respond(Response::from_string(body).with_header(json_content_type()));
}

fn outcome_label(outcome: InjectOutcome) -> &'static str {
    match outcome {
        InjectOutcome::Sent => "sent",
        InjectOutcome::Empty => "empty",
        InjectOutcome::Busy => "busy",
        InjectOutcome::DesktopActive => "desktop_active",
        InjectOutcome::SessionNotFound => "session_not_found",
        InjectOutcome::TmuxDead => "tmux_dead",
    }
}

fn is_authorized(request: &tiny_http::Request, secret: &str) -> bool {
    if secret.is_empty() {
        // Loopback-only with auth explicitly unconfigured.
        return true;
    }
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(SECRET_HEADER))
        .map(|h| h.value.as_str() == secret)
        .unwrap_or(false)
}

fn read_request_body(request: &mut tiny_http::Request) -> std::result::Result<String, u16> {
    let mut body = String::new();
    let mut reader = request.as_reader().take((MAX_BODY_BYTES + 1) as u64);
    if reader.read_to_string(&mut body).is_err() {
        return Err(400);
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(413);
    }
    Ok(body)
}

fn json_content_type() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap()
}

fn cors_header(origin: &str) -> Header {
    Header::from_bytes(&b"Access-Control-Allow-Origin"[..], origin.as_bytes())
        .unwrap_or_else(|_| Header::from_bytes(&b"Access-Control-Allow-Origin"[..], &b"*"[..]).unwrap())
}
