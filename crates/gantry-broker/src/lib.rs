//! HTTP pub/sub broker backing gantry's `http` messaging transport.
//!
//! Every route is a `POST` taking a JSON body:
//! `/connect`, `/disconnect`, `/subscribe`, `/unsubscribe`, `/publish`,
//! `/poll` (long-poll, 404 for unknown clients) and `/purge`. `GET /health`
//! reports hub statistics.
//!
//! Requests are served thread-per-request so long-polls do not block
//! publishers. The [`TestBroker`] helper starts a broker on a random port for
//! integration testing.

pub mod hub;

pub use hub::{Hub, HubStats, DEFAULT_IDLE_TIMEOUT};

use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

/// Upper bound on how long a single poll may hold a connection.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("broker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct ClientBody {
    client: String,
}

#[derive(Deserialize)]
struct SubscriptionBody {
    client: String,
    topic: String,
}

#[derive(Deserialize)]
struct PublishBody {
    topic: String,
    message: Value,
}

#[derive(Deserialize)]
struct PollBody {
    client: String,
    #[serde(default)]
    wait_ms: u64,
}

#[derive(Deserialize)]
struct PurgeBody {
    prefix: String,
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_json(req: tiny_http::Request, json: &Value) {
    let mut response = Response::from_data(json.to_string().into_bytes());
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    let _ = req.respond(response);
}

fn respond_ok(req: tiny_http::Request) {
    respond_json(req, &serde_json::json!({}));
}

fn read_json<T: for<'de> Deserialize<'de>>(req: &mut tiny_http::Request) -> Result<T, String> {
    let mut body = Vec::new();
    req.as_reader()
        .read_to_end(&mut body)
        .map_err(|e| format!("read error: {e}"))?;
    serde_json::from_slice(&body).map_err(|e| format!("invalid body: {e}"))
}

/// Parse the body as `T` or answer 400 and return `None`.
fn parse_or_reject<T: for<'de> Deserialize<'de>>(
    mut req: tiny_http::Request,
) -> Option<(tiny_http::Request, T)> {
    match read_json(&mut req) {
        Ok(body) => Some((req, body)),
        Err(msg) => {
            warn!("rejecting {}: {msg}", req.url());
            respond_err(req, 400, &msg);
            None
        }
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(hub: &Hub, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    match (&method, url.as_str()) {
        (Method::Get, "/health") => {
            let stats = hub.stats();
            respond_json(req, &serde_json::json!({ "status": "ok", "stats": stats }));
        }
        (Method::Post, "/connect") => {
            if let Some((req, body)) = parse_or_reject::<ClientBody>(req) {
                hub.connect(&body.client);
                respond_ok(req);
            }
        }
        (Method::Post, "/disconnect") => {
            if let Some((req, body)) = parse_or_reject::<ClientBody>(req) {
                hub.disconnect(&body.client);
                respond_ok(req);
            }
        }
        (Method::Post, "/subscribe") => {
            if let Some((req, body)) = parse_or_reject::<SubscriptionBody>(req) {
                if hub.subscribe(&body.client, &body.topic) {
                    respond_ok(req);
                } else {
                    respond_err(req, 404, "unknown client");
                }
            }
        }
        (Method::Post, "/unsubscribe") => {
            if let Some((req, body)) = parse_or_reject::<SubscriptionBody>(req) {
                hub.unsubscribe(&body.client, &body.topic);
                respond_ok(req);
            }
        }
        (Method::Post, "/publish") => {
            if let Some((req, body)) = parse_or_reject::<PublishBody>(req) {
                let delivered = hub.publish(&body.topic, &body.message);
                debug!("publish {}: {delivered} subscriber(s)", body.topic);
                respond_json(req, &serde_json::json!({ "delivered": delivered }));
            }
        }
        (Method::Post, "/poll") => {
            if let Some((req, body)) = parse_or_reject::<PollBody>(req) {
                let wait = Duration::from_millis(body.wait_ms).min(MAX_POLL_WAIT);
                match hub.poll(&body.client, wait) {
                    Some(messages) => respond_json(req, &serde_json::json!({ "messages": messages })),
                    None => respond_err(req, 404, "unknown client"),
                }
            }
        }
        (Method::Post, "/purge") => {
            if let Some((req, body)) = parse_or_reject::<PurgeBody>(req) {
                let removed = hub.purge(&body.prefix);
                info!("purged {removed} topic(s) under '{}'", body.prefix);
                respond_json(req, &serde_json::json!({ "removed": removed }));
            }
        }
        (_, "/health" | "/connect" | "/disconnect" | "/subscribe" | "/unsubscribe" | "/publish"
        | "/poll" | "/purge") => respond_err(req, 405, "method not allowed"),
        _ => respond_err(req, 404, "not found"),
    }
}

/// Serve requests from `server` until it is unblocked.
pub fn serve(server: &Server, hub: &Arc<Hub>) {
    for request in server.incoming_requests() {
        let hub = Arc::clone(hub);
        let spawned = std::thread::Builder::new()
            .name("gantry-broker-request".to_owned())
            .spawn(move || handle_request(&hub, request));
        if let Err(e) = spawned {
            warn!("failed to spawn request thread: {e}");
        }
    }
}

pub fn bind(addr: &str) -> Result<Server, BrokerError> {
    Server::http(addr).map_err(|e| BrokerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Start the broker loop, blocking the current thread.
pub fn run_broker(hub: &Arc<Hub>, addr: &str) -> Result<(), BrokerError> {
    let server = bind(addr)?;
    serve(&server, hub);
    Ok(())
}

/// A test helper that starts a broker on a random port in a background thread.
///
/// Drop the `TestBroker` to stop it (via `Server::unblock`).
pub struct TestBroker {
    pub url: String,
    pub port: u16,
    hub: Arc<Hub>,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestBroker {
    /// Binds to `127.0.0.1:0` (random port).
    pub fn start() -> Result<Self, BrokerError> {
        let server = Arc::new(bind("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| BrokerError::Bind {
                addr: "127.0.0.1:0".to_owned(),
                reason: "not an IP listener".to_owned(),
            })?;
        let url = format!("http://127.0.0.1:{port}");

        let hub = Arc::new(Hub::new());
        let srv = Arc::clone(&server);
        let h = Arc::clone(&hub);
        let handle = std::thread::spawn(move || serve(&srv, &h));

        Ok(Self {
            url,
            port,
            hub,
            server,
            handle: Some(handle),
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn post(url: &str, body: &str) -> Result<(u16, String), u16> {
        let agent = ureq::Agent::new_with_defaults();
        match agent
            .post(url)
            .header("Content-Type", "application/json")
            .send(body.as_bytes())
        {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let mut text = String::new();
                resp.into_body()
                    .into_reader()
                    .read_to_string(&mut text)
                    .unwrap();
                Ok((code, text))
            }
            Err(ureq::Error::StatusCode(code)) => Err(code),
            Err(e) => panic!("transport error: {e}"),
        }
    }

    #[test]
    fn health_reports_stats() {
        let broker = TestBroker::start().unwrap();
        let agent = ureq::Agent::new_with_defaults();
        let resp = agent.get(&format!("{}/health", broker.url)).call().unwrap();
        let mut text = String::new();
        resp.into_body().into_reader().read_to_string(&mut text).unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["stats"]["clients"], 0);
    }

    #[test]
    fn publish_then_poll_over_http() {
        let broker = TestBroker::start().unwrap();
        let u = &broker.url;
        post(&format!("{u}/connect"), r#"{"client":"c1"}"#).unwrap();
        post(&format!("{u}/subscribe"), r#"{"client":"c1","topic":"shop/dm"}"#).unwrap();
        let (_, delivered) = post(
            &format!("{u}/publish"),
            r#"{"topic":"shop/dm","message":{"type":"x"}}"#,
        )
        .unwrap();
        assert!(delivered.contains("\"delivered\":1"));
        let (code, body) = post(&format!("{u}/poll"), r#"{"client":"c1","wait_ms":0}"#).unwrap();
        assert_eq!(code, 200);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["messages"][0]["type"], "x");
    }

    #[test]
    fn unknown_client_poll_is_404() {
        let broker = TestBroker::start().unwrap();
        let result = post(
            &format!("{}/poll", broker.url),
            r#"{"client":"ghost","wait_ms":0}"#,
        );
        assert_eq!(result, Err(404));
    }

    #[test]
    fn malformed_body_is_400() {
        let broker = TestBroker::start().unwrap();
        assert_eq!(post(&format!("{}/connect", broker.url), "not json"), Err(400));
    }

    #[test]
    fn unknown_route_is_404() {
        let broker = TestBroker::start().unwrap();
        assert_eq!(post(&format!("{}/nope", broker.url), "{}"), Err(404));
    }
}
