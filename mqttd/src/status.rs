//! HTTP status endpoints.
//!
//! - `GET /info`    - broker system snapshot as JSON
//! - `GET /clients` - HTML table of connected clients
//! - `GET /raw`     - one JSON document per connected client, newline separated
//!
//! Every request needs HTTP basic auth against [`Credentials`]. Handlers
//! only read broker snapshots; nothing here mutates broker state.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Local;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::Ledger;
use crate::broker::{Broker, ClientInfo};

/// Account accepted when there is no ledger to take accounts from.
pub const FALLBACK_USERNAME: &str = "whoareyou?";
pub const FALLBACK_PASSWORD: &str = "callmeroot.";

const REALM: &str = "Basic realm=\"mqttd\"";

/// Username to password map accepted by the status endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    accounts: HashMap<String, String>,
}

impl Credentials {
    /// Accounts taken from `ledger`: allow rules naming a literal username
    /// and password, then every user that may log in. Without a ledger, or
    /// when it yields nothing, only the fallback account is accepted.
    pub fn from_ledger(ledger: Option<&Ledger>) -> Self {
        let mut accounts = HashMap::new();
        if let Some(ledger) = ledger {
            for rule in ledger.auth.iter().filter(|r| r.allow) {
                if is_literal(&rule.username) && is_literal(&rule.password) {
                    accounts.insert(rule.username.clone(), rule.password.clone());
                }
            }
            for user in ledger.users.values() {
                if !user.disallow && !user.password.is_empty() {
                    accounts.insert(user.username.clone(), user.password.clone());
                }
            }
        }
        if accounts.is_empty() {
            accounts.insert(FALLBACK_USERNAME.to_string(), FALLBACK_PASSWORD.to_string());
        }
        Self { accounts }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn check(&self, username: &str, password: &str) -> bool {
        self.accounts.get(username).is_some_and(|p| p == password)
    }

    /// Check an `Authorization: Basic ...` header value.
    fn check_header(&self, value: &HeaderValue) -> bool {
        basic_auth(value).is_some_and(|(user, pass)| self.check(&user, &pass))
    }
}

fn is_literal(field: &str) -> bool {
    !field.is_empty() && !field.ends_with('*')
}

fn basic_auth(value: &HeaderValue) -> Option<(String, String)> {
    let (scheme, token) = value.to_str().ok()?.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(BASE64.decode(token.trim()).ok()?).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Build the status router over `broker`, guarded by `credentials`.
pub fn router(broker: Broker, credentials: Arc<Credentials>) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/clients", get(clients))
        .route("/raw", get(raw))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(credentials, require_auth))
        .with_state(broker)
}

async fn require_auth(
    State(credentials): State<Arc<Credentials>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .is_some_and(|value| credentials.check_header(value));
    if !authorized {
        debug!(path = %request.uri().path(), "status request without valid credentials");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, REALM)],
            "401 unauthorized",
        )
            .into_response();
    }
    next.run(request).await
}

async fn info(State(broker): State<Broker>) -> Response {
    match serde_json::to_string_pretty(&broker.info()) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn clients(State(broker): State<Broker>) -> Response {
    match render_clients(&broker.clients()) {
        Ok(html) => Html(html).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn raw(State(broker): State<Broker>) -> Response {
    let mut body = String::new();
    for client in broker.clients() {
        match serde_json::to_string_pretty(&client) {
            Ok(json) => {
                body.push_str(&json);
                body.push('\n');
            }
            Err(e) => warn!(client = %client.id, error = %e, "skipping client in raw dump"),
        }
    }
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404 page not found")
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    warn!(error = %e, "status request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// One row of the client table.
#[derive(Debug, Serialize)]
struct ClientRow {
    id: String,
    remote: String,
    protocol_version: u8,
    listener: String,
    subscriptions: String,
}

impl From<&ClientInfo> for ClientRow {
    fn from(c: &ClientInfo) -> Self {
        let subscriptions = c
            .subscriptions
            .iter()
            .map(|s| format!("{}:{}", s.filter, s.qos))
            .collect::<Vec<_>>()
            .join(";");
        Self {
            id: c.id.clone(),
            remote: c.remote.clone(),
            protocol_version: c.protocol_version,
            listener: c.listener.clone(),
            subscriptions,
        }
    }
}

fn render_clients(clients: &[ClientInfo]) -> Result<String, minijinja::Error> {
    let mut rows: Vec<ClientRow> = clients.iter().map(ClientRow::from).collect();
    rows.sort_by(|a, b| a.id.cmp(&b.id));

    let mut env = Environment::new();
    env.add_template("clients.html", CLIENTS_TEMPLATE)?;
    env.get_template("clients.html")?.render(context! {
        time => Local::now().to_rfc3339(),
        clients => rows,
    })
}

const CLIENTS_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="180">
  <title>mqttd clients</title>
  <style>
    body { font-family: -apple-system, sans-serif; margin: 2rem; }
    h3 { margin: 20px 0 10px; }
    table { border-collapse: collapse; }
    tr:nth-child(2n) { background-color: #f8f8f8; }
    th, td { border: 1px solid #cccccc; text-align: center; padding: 6px 13px; }
    th { font-weight: bold; }
  </style>
</head>
<body>
  <h3>Server time</h3><a>{{ time }}</a>
  <h3>Connected clients ({{ clients|length }})</h3>
  <table>
    <thead>
      <tr>
        <th>Client ID</th>
        <th>Remote</th>
        <th>Protocol</th>
        <th>Listener</th>
        <th>Subscriptions</th>
      </tr>
    </thead>
    <tbody>
    {%- for c in clients %}
      <tr>
        <td>{{ c.id }}</td>
        <td>{{ c.remote }}</td>
        <td>{{ c.protocol_version }}</td>
        <td>{{ c.listener }}</td>
        <td>{{ c.subscriptions }}</td>
      </tr>
    {%- endfor %}
    </tbody>
  </table>
</body>
</html>
"#;
