//! Local dashboard server: JSON API, Server-Sent Events and a background scheduler.
//!
//! One thread per connection over a non-blocking accept loop. All push notifications go
//! through [`Dashboard::emit_event`], which keeps a bounded in-memory history for SSE
//! resume and appends every event to `events.jsonl` in the state directory.

use crate::config::{read_addon_paths, Config};
use crate::identity::{human_users, read_uid_min, SystemIdentity};
use crate::permissions::{PermissionEngine, PermissionPolicy, VerdictStatus};
use crate::resources::sample_resources;
use crate::services::{ServiceAction, ServiceController, SystemCommandRunner};
use crate::OdmonError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");
const EVENT_HISTORY: usize = 512;
const WARNING_HISTORY: usize = 128;
const MAX_HEADER_BYTES: usize = 1024 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct ServerPaths {
    pub state_dir: PathBuf,
    pub pid_path: PathBuf,
    pub events_path: PathBuf,
}

impl ServerPaths {
    pub fn under(config_dir: &Path) -> Self {
        let state_dir = config_dir.join("run");
        Self {
            pid_path: state_dir.join("server.pid"),
            events_path: state_dir.join("events.jsonl"),
            state_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeEvent {
    pub id: u64,
    pub ts: String,
    pub event_type: String,
    pub severity: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuntimeWarning {
    ts: String,
    message: String,
}

#[derive(Debug, Default)]
struct DashboardState {
    next_event_id: u64,
    events: VecDeque<RuntimeEvent>,
    warnings: VecDeque<RuntimeWarning>,
    subscribers: usize,
    shutdown: bool,
}

pub struct Dashboard {
    cfg: Config,
    policy: PermissionPolicy,
    engine: PermissionEngine,
    events_path: PathBuf,
    use_sudo: bool,
    state: Mutex<DashboardState>,
    changed: Condvar,
}

impl Dashboard {
    pub fn new(cfg: Config, engine: PermissionEngine, events_path: PathBuf) -> Result<Self, OdmonError> {
        let policy = cfg.permissions.policy()?;
        let use_sudo = cfg.elevate_with_sudo();
        Ok(Self {
            cfg,
            policy,
            engine,
            events_path,
            use_sudo,
            state: Mutex::new(DashboardState::default()),
            changed: Condvar::new(),
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, DashboardState>, OdmonError> {
        self.state
            .lock()
            .map_err(|_| OdmonError::Process("dashboard state lock poisoned".to_string()))
    }

    pub fn emit_event(
        &self,
        event_type: &str,
        severity: &str,
        payload: serde_json::Value,
    ) -> Result<RuntimeEvent, OdmonError> {
        let event = {
            let mut state = self.lock_state()?;
            state.next_event_id = state.next_event_id.saturating_add(1);
            let event = RuntimeEvent {
                id: state.next_event_id,
                ts: Utc::now().to_rfc3339(),
                event_type: event_type.to_string(),
                severity: severity.to_string(),
                payload,
            };
            state.events.push_back(event.clone());
            while state.events.len() > EVENT_HISTORY {
                let _ = state.events.pop_front();
            }
            self.changed.notify_all();
            event
        };

        if let Some(parent) = self.events_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;
        file.write_all(line.as_bytes())?;
        Ok(event)
    }

    pub fn emit_warning(&self, message: &str) -> Result<(), OdmonError> {
        tracing::warn!(message, "dashboard warning");
        {
            let mut state = self.lock_state()?;
            state.warnings.push_back(RuntimeWarning {
                ts: Utc::now().to_rfc3339(),
                message: message.to_string(),
            });
            while state.warnings.len() > WARNING_HISTORY {
                let _ = state.warnings.pop_front();
            }
        }
        self.emit_event("warning", "warn", json!({ "message": message }))?;
        Ok(())
    }

    fn request_shutdown(&self) -> Result<(), OdmonError> {
        let mut state = self.lock_state()?;
        state.shutdown = true;
        self.changed.notify_all();
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.lock_state().map(|state| state.shutdown).unwrap_or(true)
    }

    fn subscriber_count(&self) -> usize {
        self.lock_state().map(|state| state.subscribers).unwrap_or(0)
    }

    fn controller<'a>(&'a self, runner: &'a SystemCommandRunner) -> ServiceController<'a, SystemCommandRunner> {
        ServiceController::new(runner, &self.cfg.services, self.use_sudo)
    }

    fn collect_status(&self) -> serde_json::Value {
        let runner = SystemCommandRunner;
        let services = self.controller(&runner).all_statuses();
        json!({
            "services": services,
            "resources": sample_resources(),
        })
    }

    fn collect_modules(&self) -> Result<serde_json::Value, OdmonError> {
        let addons = read_addon_paths(&self.cfg)?;
        let modules = self.engine.inspect_all(&addons.paths, &self.policy);
        Ok(json!({
            "config_file": addons.config_file,
            "modules": modules,
            "warning": addons.warning,
        }))
    }

    fn collect_warnings(&self) -> Result<serde_json::Value, OdmonError> {
        let state = self.lock_state()?;
        let warnings: Vec<RuntimeWarning> = state.warnings.iter().cloned().collect();
        let errors: Vec<RuntimeEvent> = state
            .events
            .iter()
            .filter(|event| event.severity == "error")
            .cloned()
            .collect();
        Ok(json!({ "warnings": warnings, "errors": errors }))
    }
}

/// Decrements the subscriber count when an SSE stream ends for any reason.
struct SubscriberGuard<'a> {
    dashboard: &'a Dashboard,
}

impl<'a> SubscriberGuard<'a> {
    fn register(dashboard: &'a Dashboard) -> Result<Self, OdmonError> {
        dashboard.lock_state()?.subscribers += 1;
        Ok(Self { dashboard })
    }
}

impl Drop for SubscriberGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.dashboard.lock_state() {
            state.subscribers = state.subscribers.saturating_sub(1);
        }
    }
}

#[derive(Debug)]
pub struct IncomingRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(spaced)
}

fn parse_query_map(query: &str) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    for pair in query.split('&') {
        if pair.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            result.insert(decode_component(key), decode_component(value));
        } else {
            result.insert(decode_component(pair), String::new());
        }
    }
    result
}

/// Reads until the blank line that ends the head. Anything past it is the start of the body.
fn read_head(stream: &mut impl Read) -> Result<Option<(String, Vec<u8>)>, OdmonError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            buf.truncate(pos);
            return Ok(Some((String::from_utf8_lossy(&buf).into_owned(), rest)));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(OdmonError::BadRequest("request headers too large".to_string()));
        }
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(OdmonError::BadRequest(
                "connection closed inside request headers".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

fn parse_head(head: &str) -> Result<IncomingRequest, OdmonError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let (method, target) = match request_line.split_whitespace().collect::<Vec<_>>()[..] {
        [method, target, _version] => (method.to_string(), target),
        _ => {
            return Err(OdmonError::BadRequest(format!(
                "malformed request line '{request_line}'"
            )))
        }
    };
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query_map(query)),
        None => (target.to_string(), BTreeMap::new()),
    };
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Ok(IncomingRequest {
        method,
        path,
        query,
        headers,
        body: Vec::new(),
    })
}

/// One HTTP/1.1 request. `Ok(None)` when the peer closed without sending anything.
/// POST must declare its body length; chunked bodies are not accepted.
pub fn read_http_request(stream: &mut impl Read) -> Result<Option<IncomingRequest>, OdmonError> {
    let Some((head, mut body)) = read_head(stream)? else {
        return Ok(None);
    };
    let mut request = parse_head(&head)?;
    let declared = request.headers.get("content-length");
    let content_length = match (request.method.as_str(), declared) {
        (_, Some(value)) => value.parse::<usize>().map_err(|_| {
            OdmonError::BadRequest(format!("invalid Content-Length '{value}'"))
        })?,
        ("POST", None) => {
            return Err(OdmonError::BadRequest(
                "POST requires a Content-Length header".to_string(),
            ))
        }
        (_, None) => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(OdmonError::BadRequest("request body too large".to_string()));
    }
    if body.len() < content_length {
        let mut rest = vec![0u8; content_length - body.len()];
        stream.read_exact(&mut rest).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => OdmonError::BadRequest(
                "request ended before full body was received".to_string(),
            ),
            _ => OdmonError::Io(err),
        })?;
        body.extend_from_slice(&rest);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(Some(request))
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        403 => "Forbidden",
        405 => "Method Not Allowed",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

pub fn write_text_response(
    stream: &mut impl Write,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), OdmonError> {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status,
        status_text(status),
        content_type,
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

pub fn write_json_response(
    stream: &mut impl Write,
    status: u16,
    payload: &serde_json::Value,
) -> Result<(), OdmonError> {
    let body = serde_json::to_vec(payload)?;
    write_text_response(stream, status, "application/json", &body)
}

fn send_sse_event(stream: &mut impl Write, event: &RuntimeEvent) -> Result<(), OdmonError> {
    let data = serde_json::to_string(event)?;
    let frame = format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.id, event.event_type, data
    );
    stream.write_all(frame.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn error_status(err: &OdmonError) -> u16 {
    match err {
        OdmonError::NotFound(_) => 404,
        OdmonError::Config(_) | OdmonError::Json(_) | OdmonError::BadRequest(_) => 400,
        _ => 500,
    }
}

#[derive(Debug, Deserialize)]
struct FixRequest {
    path: String,
}

#[derive(Debug, Deserialize)]
struct AddToGroupRequest {
    username: String,
}

fn parse_body<T: for<'de> Deserialize<'de>>(request: &IncomingRequest) -> Result<T, OdmonError> {
    serde_json::from_slice(&request.body)
        .map_err(|err| OdmonError::BadRequest(format!("invalid request body: {err}")))
}

fn same_path(a: &Path, b: &Path) -> bool {
    let canonical = |path: &Path| fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    canonical(a) == canonical(b)
}

fn is_wildcard_host(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::" | "[::]")
}

/// `host[:port]` from a Host header or an Origin, checked against where the dashboard
/// listens. Loopback names are always accepted; a wildcard bind also accepts IP literals.
/// Domain names other than `localhost` are refused so a rebound DNS name cannot reach
/// the API.
fn authority_allowed(cfg: &Config, authority: &str) -> bool {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => (host, Some(port)),
        _ => (authority, None),
    };
    if let Some(port) = port {
        if port.parse::<u16>().ok() != Some(cfg.server.port) {
            return false;
        }
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let configured = cfg.server.host.trim_start_matches('[').trim_end_matches(']');
    if bare.eq_ignore_ascii_case("localhost") || bare == configured {
        return true;
    }
    match bare.parse::<std::net::IpAddr>() {
        Ok(ip) => ip.is_loopback() || is_wildcard_host(&cfg.server.host),
        Err(_) => false,
    }
}

/// Rejections for requests a browser could send from another site. Returns the
/// response to send instead of routing.
fn reject_foreign_request(
    cfg: &Config,
    request: &IncomingRequest,
) -> Option<(u16, serde_json::Value)> {
    if let Some(host) = request.headers.get("host") {
        if !authority_allowed(cfg, host) {
            return Some((403, json!({"error": format!("host '{host}' is not allowed")})));
        }
    }
    if request.method != "POST" {
        return None;
    }
    if let Some(origin) = request.headers.get("origin") {
        let allowed = origin
            .strip_prefix("http://")
            .is_some_and(|authority| authority_allowed(cfg, authority));
        if !allowed {
            return Some((403, json!({"error": format!("origin '{origin}' is not allowed")})));
        }
    }
    let json_body = request
        .headers
        .get("content-type")
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));
    if !json_body {
        return Some((415, json!({"error": "POST requests must be application/json"})));
    }
    None
}

/// Every non-streaming endpoint. Returns the HTTP status and JSON body.
pub fn route(
    dashboard: &Dashboard,
    request: &IncomingRequest,
) -> Result<(u16, serde_json::Value), OdmonError> {
    if let Some(rejection) = reject_foreign_request(&dashboard.cfg, request) {
        tracing::warn!(path = %request.path, status = rejection.0, "rejected request");
        return Ok(rejection);
    }
    let method = request.method.as_str();
    let path = request.path.as_str();

    if let Some(rest) = path.strip_prefix("/api/services/") {
        if method != "POST" {
            return Ok((405, json!({"error": "method not allowed"})));
        }
        let Some((key, action)) = rest.split_once('/') else {
            return Ok((404, json!({"error": "not found"})));
        };
        let Some(action) = ServiceAction::parse(action) else {
            return Ok((400, json!({"error": format!("unknown action '{action}'")})));
        };
        let runner = SystemCommandRunner;
        let result = dashboard.controller(&runner).control(key, action);
        let severity = if result.success { "info" } else { "error" };
        dashboard.emit_event(
            "service_action",
            severity,
            json!({"service": key, "action": action.as_str(), "result": result}),
        )?;
        return Ok((200, serde_json::to_value(result)?));
    }

    match (method, path) {
        ("GET", "/api/healthz") => Ok((200, json!({"ok": true, "ts": Utc::now().to_rfc3339()}))),
        ("GET", "/api/status") => Ok((200, dashboard.collect_status())),
        ("GET", "/api/modules") => Ok((200, dashboard.collect_modules()?)),
        ("GET", "/api/modules/permissions") => {
            let Some(target) = request.query.get("path").filter(|value| !value.is_empty()) else {
                return Ok((400, json!({"error": "query parameter 'path' is required"})));
            };
            let verdict = dashboard.engine.inspect(Path::new(target), &dashboard.policy);
            let status = if verdict.status == VerdictStatus::NotFound {
                404
            } else {
                200
            };
            Ok((status, json!({"path": target, "permissions": verdict})))
        }
        ("POST", "/api/modules/fix") => {
            let body: FixRequest = parse_body(request)?;
            let addons = read_addon_paths(&dashboard.cfg)?;
            let target = PathBuf::from(body.path.trim());
            if !addons.paths.iter().any(|addon| same_path(addon, &target)) {
                return Ok((
                    400,
                    json!({"error": format!("{} is not a configured addons path", target.display())}),
                ));
            }
            let result = dashboard.engine.repair(&target, &dashboard.policy);
            let severity = if result.success { "info" } else { "warn" };
            dashboard.emit_event("permissions_fixed", severity, serde_json::to_value(&result)?)?;
            match dashboard.collect_modules() {
                Ok(modules) => {
                    dashboard.emit_event("modules_update", "info", modules)?;
                }
                Err(err) => dashboard.emit_warning(&format!("module refresh failed: {err}"))?,
            }
            let status = if result.status == VerdictStatus::NotFound {
                404
            } else {
                200
            };
            Ok((status, serde_json::to_value(result)?))
        }
        ("GET", "/api/users") => {
            let identity = SystemIdentity::default();
            let users = human_users(
                &identity,
                &identity.passwd_entries(),
                read_uid_min(),
                &dashboard.policy.group,
            );
            Ok((
                200,
                json!({
                    "users": users,
                    "odoo_user": dashboard.policy.owner,
                    "odoo_group": dashboard.policy.group,
                }),
            ))
        }
        ("POST", "/api/users/add-to-odoo-group") => {
            let body: AddToGroupRequest = parse_body(request)?;
            let runner = SystemCommandRunner;
            let result = dashboard.controller(&runner).add_user_to_group(
                dashboard.engine.identity(),
                body.username.trim(),
                &dashboard.policy.group,
            );
            let severity = if result.success { "info" } else { "error" };
            dashboard.emit_event(
                "group_membership",
                severity,
                json!({"username": body.username, "result": result}),
            )?;
            Ok((200, serde_json::to_value(result)?))
        }
        ("GET", "/api/group/members") => {
            let membership = dashboard.engine.identity().members_of(&dashboard.policy.group);
            if let Some(warning) = &membership.warning {
                dashboard.emit_warning(warning)?;
            }
            Ok((200, serde_json::to_value(membership)?))
        }
        ("GET", "/api/warnings") => Ok((200, dashboard.collect_warnings()?)),
        ("POST", "/api/server/down") => {
            dashboard.request_shutdown()?;
            let _ = dashboard.emit_event(
                "server.stopped",
                "info",
                json!({"reason": "down_requested"}),
            );
            Ok((200, json!({"ok": true})))
        }
        _ => Ok((404, json!({"error": "not found"}))),
    }
}

fn stream_events(
    stream: &mut TcpStream,
    dashboard: &Dashboard,
    request: &IncomingRequest,
) -> Result<(), OdmonError> {
    let mut last_event_id = request
        .headers
        .get("last-event-id")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    if let Some(parsed) = request
        .query
        .get("last_event_id")
        .and_then(|value| value.parse::<u64>().ok())
    {
        last_event_id = parsed;
    }
    let header = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n";
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    let _subscriber = SubscriberGuard::register(dashboard)?;
    tracing::debug!(last_event_id, "sse subscriber connected");

    loop {
        let (pending, shutdown) = {
            let mut state = dashboard.lock_state()?;
            let has_new = state.events.iter().any(|event| event.id > last_event_id);
            if !has_new && !state.shutdown {
                let (guard, _) = dashboard
                    .changed
                    .wait_timeout(state, SSE_KEEPALIVE)
                    .map_err(|_| OdmonError::Process("dashboard condition wait failed".to_string()))?;
                state = guard;
            }
            let events: Vec<RuntimeEvent> = state
                .events
                .iter()
                .filter(|event| event.id > last_event_id)
                .cloned()
                .collect();
            (events, state.shutdown)
        };
        if pending.is_empty() {
            if shutdown {
                break;
            }
            stream.write_all(b": keepalive\n\n")?;
            stream.flush()?;
            continue;
        }
        for event in pending {
            last_event_id = event.id;
            send_sse_event(stream, &event)?;
        }
        if shutdown {
            break;
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, dashboard: Arc<Dashboard>) -> Result<(), OdmonError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let Some(request) = read_http_request(&mut stream)? else {
        return Ok(());
    };
    tracing::debug!(method = %request.method, path = %request.path, "request");
    let served_directly = matches!(
        (request.method.as_str(), request.path.as_str()),
        ("GET", "/") | ("GET", "/index.html") | ("GET", "/api/events")
    );
    if served_directly {
        if let Some((status, payload)) = reject_foreign_request(&dashboard.cfg, &request) {
            return write_json_response(&mut stream, status, &payload);
        }
    }
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") | ("GET", "/index.html") => write_text_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            DASHBOARD_HTML.as_bytes(),
        ),
        ("GET", "/api/events") => stream_events(&mut stream, &dashboard, &request),
        _ => {
            let (status, payload) = route(&dashboard, &request).unwrap_or_else(|err| {
                tracing::warn!(path = %request.path, error = %err, "request failed");
                (error_status(&err), json!({"error": err.to_string()}))
            });
            write_json_response(&mut stream, status, &payload)
        }
    }
}

/// Periodic pushes. Status sampling is skipped while nobody is listening; the module
/// sweep is read-only and never repairs.
fn scheduler_loop(dashboard: Arc<Dashboard>) {
    let refresh = Duration::from_secs(dashboard.cfg.monitoring.refresh_interval_sec.max(1));
    let inspect = Duration::from_secs(dashboard.cfg.monitoring.inspect_interval_sec.max(1));
    let mut last_status: Option<Instant> = None;
    let mut last_inspect = Instant::now();

    loop {
        {
            let Ok(state) = dashboard.lock_state() else {
                return;
            };
            if state.shutdown {
                return;
            }
            let _ = dashboard.changed.wait_timeout(state, Duration::from_millis(500));
        }
        if dashboard.is_shutdown() {
            return;
        }

        let status_due = last_status.map_or(true, |at| at.elapsed() >= refresh);
        if status_due && dashboard.subscriber_count() > 0 {
            last_status = Some(Instant::now());
            let status = dashboard.collect_status();
            if let Err(err) = dashboard.emit_event("status_update", "info", status) {
                tracing::warn!(error = %err, "failed to emit status update");
            }
        }

        if last_inspect.elapsed() >= inspect {
            last_inspect = Instant::now();
            let result = dashboard
                .collect_modules()
                .and_then(|modules| dashboard.emit_event("modules_update", "info", modules));
            if let Err(err) = result {
                let _ = dashboard.emit_warning(&format!("scheduled module inspection failed: {err}"));
            }
        }
    }
}

fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), OdmonError> {
    let parent = path
        .parent()
        .ok_or_else(|| OdmonError::Config(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
        std::process::id()
    ));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

fn process_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
}

fn cleanup_artifacts(paths: &ServerPaths) {
    let _ = fs::remove_file(&paths.pid_path);
}

/// Run the dashboard in the foreground until `POST /api/server/down`.
pub fn serve(cfg: Config, paths: &ServerPaths) -> Result<(), OdmonError> {
    let address = cfg.bind_address();
    fs::create_dir_all(&paths.state_dir)?;
    let listener = TcpListener::bind(&address)
        .map_err(|err| OdmonError::Process(format!("failed to bind dashboard on {address}: {err}")))?;
    listener.set_nonblocking(true)?;
    write_atomic_text_file(&paths.pid_path, &format!("{}\n", std::process::id()))?;

    let identity = SystemIdentity::default();
    for warning in cfg.policy_warnings(&identity) {
        tracing::warn!(warning = %warning, "permission policy");
    }
    let dashboard = Arc::new(Dashboard::new(
        cfg,
        PermissionEngine::system(),
        paths.events_path.clone(),
    )?);
    tracing::info!(address = %address, "dashboard listening");
    let _ = dashboard.emit_event("server.started", "info", json!({"address": address}));

    let scheduler = {
        let dashboard = Arc::clone(&dashboard);
        thread::spawn(move || scheduler_loop(dashboard))
    };

    while !dashboard.is_shutdown() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let dashboard = Arc::clone(&dashboard);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, dashboard) {
                        tracing::debug!(peer = %peer, error = %err, "connection ended with error");
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                let _ = dashboard.emit_warning(&format!("listener accept failed: {err}"));
                thread::sleep(Duration::from_millis(250));
            }
        }
    }

    let _ = dashboard.request_shutdown();
    let _ = scheduler.join();
    cleanup_artifacts(paths);
    tracing::info!("dashboard stopped");
    Ok(())
}

pub fn base_url(cfg: &Config) -> String {
    let host = match cfg.server.host.as_str() {
        "0.0.0.0" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        host if host.contains(':') && !host.starts_with('[') => format!("[{host}]"),
        host => host.to_string(),
    };
    format!("http://{}:{}", host, cfg.server.port)
}

fn http_client() -> Result<reqwest::blocking::Client, OdmonError> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?)
}

pub fn ping(cfg: &Config) -> Result<(), OdmonError> {
    let response = http_client()?
        .get(format!("{}/api/healthz", base_url(cfg)))
        .send()?;
    if !response.status().is_success() {
        return Err(OdmonError::Process(format!(
            "dashboard ping failed with status {}",
            response.status()
        )));
    }
    Ok(())
}

pub fn status_payload(cfg: &Config, paths: &ServerPaths) -> serde_json::Value {
    json!({
        "running": ping(cfg).is_ok(),
        "url": base_url(cfg),
        "pid": read_pid_file(&paths.pid_path),
        "pid_path": paths.pid_path,
        "events_path": paths.events_path,
    })
}

/// Start `serve` as a detached child and wait until it answers.
pub fn up(config_path: &Path, cfg: &Config, paths: &ServerPaths) -> Result<serde_json::Value, OdmonError> {
    let url = base_url(cfg);
    if ping(cfg).is_ok() {
        return Ok(json!({"running": true, "already_running": true, "url": url}));
    }
    if let Some(pid) = read_pid_file(&paths.pid_path) {
        if process_is_alive(pid) {
            return Err(OdmonError::Process(format!(
                "dashboard pid {pid} is alive but {url} is not answering; run `odmon server down` and retry"
            )));
        }
    }
    cleanup_artifacts(paths);
    fs::create_dir_all(&paths.state_dir)?;

    let exe = env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("--config").arg(config_path);
    cmd.arg("server").arg("serve");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    let mut child = cmd
        .spawn()
        .map_err(|err| OdmonError::Process(format!("failed to start dashboard: {err}")))?;

    for _ in 0..300 {
        thread::sleep(Duration::from_millis(100));
        if ping(cfg).is_ok() {
            tracing::info!(url = %url, pid = child.id(), "dashboard started");
            return Ok(json!({
                "running": true,
                "already_running": false,
                "url": url,
                "pid": child.id(),
            }));
        }
        if let Some(status) = child.try_wait()? {
            return Err(OdmonError::Process(format!(
                "dashboard exited before ready (status: {status}); try `odmon server serve` for direct diagnostics"
            )));
        }
    }
    Err(OdmonError::Process(format!(
        "dashboard did not become ready at {url}"
    )))
}

pub fn down(cfg: &Config, paths: &ServerPaths) -> Result<serde_json::Value, OdmonError> {
    if ping(cfg).is_ok() {
        let response = http_client()?
            .post(format!("{}/api/server/down", base_url(cfg)))
            .json(&json!({}))
            .send()?;
        if !response.status().is_success() {
            return Err(OdmonError::Process(format!(
                "dashboard down failed with status {}",
                response.status()
            )));
        }
        for _ in 0..30 {
            thread::sleep(Duration::from_millis(100));
            if ping(cfg).is_err() {
                break;
            }
        }
    }
    cleanup_artifacts(paths);
    Ok(json!({"running": false, "url": base_url(cfg)}))
}
