//! Remote inference client for the conversation gateway.
//!
//! The client turns an ordered list of role-tagged messages into the
//! gateway's request schema, attaches the process-wide credential, and
//! returns an [`InferenceResult`]. Failures never cross this boundary as
//! errors: every network, auth, redirect or parsing problem comes back as a
//! typed failure value.
//!
//! Retry policy:
//! - 5xx responses and transport faults (timeout, connect, TLS) are retried
//!   with exponential backoff: 2s, doubling, capped at 32s.
//! - 401/403, 3xx and HTML bodies are never retried. They mean the request
//!   was intercepted by an interactive login, not that the backend is flaky.
//! - The cooperative stop flag is checked before every attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable holding the Base64 personal access token.
pub const DEFAULT_CREDENTIAL_ENV: &str = "PROMPTOPT_PAT_B64";

/// Attempts per `send` when the caller does not choose.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 32;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Author of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One typed segment of structured message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// Message content: plain text or an ordered list of typed segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Segments(Vec<Segment>),
}

/// A single role-tagged message. Built per call, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: Content::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }

    /// Wire form. Plain text is always sent as a single typed text segment.
    pub fn to_wire(&self) -> Value {
        let content = match &self.content {
            Content::Text(text) => json!([{ "type": "text", "text": text }]),
            Content::Segments(segments) => json!(segments),
        };
        json!({ "role": self.role, "content": content })
    }

    /// The visible text of this message (text segments concatenated).
    pub fn text(&self) -> String {
        match &self.content {
            Content::Text(text) => text.clone(),
            Content::Segments(segments) => segments
                .iter()
                .filter(|s| s.kind == "text")
                .filter_map(|s| s.text.as_deref())
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing credential or unusable configuration.
    Setup,
    /// Timeout, connection, TLS or 5xx after retries were exhausted.
    Transient,
    /// 401 / 403.
    Auth,
    /// 3xx or an HTML body: an interactive login intercepted the call.
    Redirect,
    /// Any other non-success status.
    Http,
    /// The response was not in the expected shape.
    Parse,
    /// The stop flag was set before the call went out.
    Cancelled,
}

impl ErrorKind {
    /// Human-actionable guidance for this failure.
    pub fn user_hint(self) -> &'static str {
        match self {
            ErrorKind::Setup | ErrorKind::Auth => "check credentials",
            ErrorKind::Redirect => "check network/VPN",
            ErrorKind::Transient | ErrorKind::Http => "retry later",
            ErrorKind::Parse => "internal parsing fallback used",
            ErrorKind::Cancelled => "cancelled by user",
        }
    }

    pub fn is_auth_or_redirect(self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::Redirect)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Setup => "setup",
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::Redirect => "redirect",
            ErrorKind::Http => "http",
            ErrorKind::Parse => "parse",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one `send`. Produced once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub success: bool,
    pub content: String,
    pub error: Option<InferenceError>,
    /// Decoded response payload, when one was received.
    pub raw: Option<Value>,
}

impl InferenceResult {
    pub fn ok(content: impl Into<String>, raw: Option<Value>) -> Self {
        InferenceResult {
            success: true,
            content: content.into(),
            error: None,
            raw,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        InferenceResult {
            success: false,
            content: String::new(),
            error: Some(InferenceError {
                kind,
                message: message.into(),
            }),
            raw: None,
        }
    }

    fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn error_message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }

    /// The content, or the failure as an [`ExecutionError`].
    pub fn into_content(self) -> Result<String, ExecutionError> {
        match self.error {
            None if self.success => Ok(self.content),
            Some(err) => Err(ExecutionError {
                kind: err.kind,
                message: err.message,
            }),
            None => Err(ExecutionError {
                kind: ErrorKind::Parse,
                message: "unsuccessful result without an error".to_string(),
            }),
        }
    }
}

/// A prompt could not be executed against a test input.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("prompt execution failed ({kind}): {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative stop signal, set on one thread and read on another.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Anything that can answer a conversation. The optimization engines and the
/// judge only talk to this trait.
pub trait InferenceBackend: Send + Sync {
    fn send(
        &self,
        conversation: &[Message],
        temperature: Option<f64>,
        max_attempts: u32,
    ) -> InferenceResult;

    /// Cancel in-flight and future calls until [`reset_stop`](Self::reset_stop).
    fn request_stop(&self);

    fn reset_stop(&self);

    /// `send` with the default attempt budget.
    fn complete(&self, conversation: &[Message], temperature: Option<f64>) -> InferenceResult {
        self.send(conversation, temperature, DEFAULT_MAX_ATTEMPTS)
    }
}

/// Run `send` on a dedicated thread and hand the result to `callback`.
///
/// The join handle yields the same result, so callers can either react in
/// the callback or join later.
pub fn send_async<B, F>(
    backend: Arc<B>,
    conversation: Vec<Message>,
    temperature: Option<f64>,
    callback: F,
) -> JoinHandle<InferenceResult>
where
    B: InferenceBackend + ?Sized + 'static,
    F: FnOnce(&InferenceResult) + Send + 'static,
{
    thread::spawn(move || {
        let result = backend.complete(&conversation, temperature);
        callback(&result);
        result
    })
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A fully built POST request.
#[derive(Debug)]
pub struct HttpRequest<'a> {
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub body: &'a Value,
}

/// The parts of an HTTP response the client classifies on.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl HttpReply {
    pub fn json(status: u16, body: &Value) -> Self {
        HttpReply {
            status,
            content_type: "application/json".to_string(),
            body: body.to_string(),
        }
    }

    fn looks_like_html(&self) -> bool {
        if self.content_type.to_ascii_lowercase().contains("text/html") {
            return true;
        }
        let head: String = self.body.trim_start().chars().take(15).collect();
        let head = head.to_ascii_lowercase();
        head.starts_with("<!doctype html") || head.starts_with("<html")
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("TLS error, check the CA bundle path: {0}")]
    Tls(String),
    #[error("connection failed, check network/VPN: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// Blocking HTTP POST. Implemented over reqwest for production and by
/// scripted fakes in tests.
pub trait Transport: Send + Sync {
    fn post(&self, request: &HttpRequest<'_>) -> Result<HttpReply, TransportError>;
}

/// Production transport: reqwest's blocking client, redirects disabled so
/// login interceptions surface as 3xx instead of being followed.
pub struct ReqwestTransport {
    http: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none());

        if let Some(ref path) = config.ca_bundle_path {
            let pem = std::fs::read(path).map_err(|source| ClientError::CaBundle {
                path: path.clone(),
                source,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(ReqwestTransport {
            http: builder.build()?,
        })
    }
}

impl Transport for ReqwestTransport {
    fn post(&self, request: &HttpRequest<'_>) -> Result<HttpReply, TransportError> {
        let mut builder = self.http.post(request.url).json(request.body);
        for (name, value) in request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().map_err(classify_reqwest_error)?;

        Ok(HttpReply {
            status,
            content_type,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    let detail = format!("{:?}", err);
    if err.is_timeout() {
        return TransportError::Timeout(err.to_string());
    }
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
        return TransportError::Tls(err.to_string());
    }
    if err.is_connect() {
        return TransportError::Connect(err.to_string());
    }
    TransportError::Other(err.to_string())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Setup-time failures. These are fatal and never retried.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("credential not set: export {0} with the Base64 access token")]
    MissingCredential(String),
    #[error("failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Connection settings for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Used when a call does not pass its own temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// PEM bundle for an internal certificate authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_path: Option<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Name of the environment variable holding the credential.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_endpoint() -> String {
    "/api/conversation".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_credential_env() -> String {
    DEFAULT_CREDENTIAL_ENV.to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            ca_bundle_path: None,
            max_attempts: default_max_attempts(),
            credential_env: default_credential_env(),
        }
    }
}

impl ClientConfig {
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.endpoint)
    }

    /// Read the credential once from the configured environment variable.
    pub fn credential_from_env(&self) -> Result<String, ClientError> {
        let token = std::env::var(&self.credential_env).unwrap_or_default();
        let token = token.trim();
        if token.is_empty() {
            return Err(ClientError::MissingCredential(self.credential_env.clone()));
        }
        Ok(token.to_string())
    }
}

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

/// What to do with one HTTP reply.
enum Disposition {
    Accept,
    Retry(String),
    Fail(ErrorKind, String),
}

fn classify_reply(reply: &HttpReply) -> Disposition {
    match reply.status {
        401 => Disposition::Fail(
            ErrorKind::Auth,
            "Unauthorized - check the access token (Base64 encoded, no whitespace)".to_string(),
        ),
        403 => Disposition::Fail(
            ErrorKind::Auth,
            "Access denied - check network access/VPN connection".to_string(),
        ),
        300..=399 => Disposition::Fail(
            ErrorKind::Redirect,
            "Redirect detected - likely SSO interception. Authenticate via browser or check VPN."
                .to_string(),
        ),
        500..=599 => Disposition::Retry(format!("Server error ({})", reply.status)),
        200..=299 if reply.looks_like_html() => Disposition::Fail(
            ErrorKind::Redirect,
            "Received HTML response - likely firewall or SSO redirect. Check VPN/authentication."
                .to_string(),
        ),
        200..=299 => Disposition::Accept,
        other => Disposition::Fail(ErrorKind::Http, format!("HTTP error: {}", other)),
    }
}

/// Extract the assistant text from a successful gateway reply.
pub fn parse_reply(reply: &HttpReply) -> InferenceResult {
    let data: Value = match serde_json::from_str(&reply.body) {
        Ok(v) => v,
        Err(_) => {
            return InferenceResult::failure(ErrorKind::Parse, "Invalid JSON response from API");
        }
    };

    let Some(choice) = data
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return InferenceResult::failure(ErrorKind::Parse, "No choices in response").with_raw(data);
    };

    let message = match choice.get("messages") {
        Some(Value::Array(list)) => list.first(),
        Some(obj @ Value::Object(_)) => Some(obj),
        _ => choice.get("message"),
    };
    let Some(message) = message else {
        return InferenceResult::failure(ErrorKind::Parse, "No messages in response").with_raw(data);
    };

    let content = match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(segments)) => segments
            .iter()
            .filter(|s| s.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|s| s.get("text").and_then(Value::as_str))
            .collect(),
        Some(_) => {
            return InferenceResult::failure(ErrorKind::Parse, "Unsupported content type in response")
                .with_raw(data);
        }
        None => {
            return InferenceResult::failure(ErrorKind::Parse, "No content in response message")
                .with_raw(data);
        }
    };

    InferenceResult::ok(content, Some(data))
}

/// Gateway client with retry, backoff and cooperative cancellation.
pub struct RemoteClient<T: Transport = ReqwestTransport> {
    config: ClientConfig,
    transport: T,
    headers: Vec<(String, String)>,
    conversation_guid: RwLock<String>,
    stop: StopFlag,
    sleep: Sleeper,
}

impl RemoteClient<ReqwestTransport> {
    /// Build the production client. Reads the credential from the
    /// environment exactly once.
    pub fn from_config(config: ClientConfig) -> Result<Self, ClientError> {
        let credential = config.credential_from_env()?;
        let transport = ReqwestTransport::new(&config)?;
        RemoteClient::with_transport(config, &credential, transport)
    }
}

impl<T: Transport> RemoteClient<T> {
    pub fn with_transport(
        config: ClientConfig,
        credential: &str,
        transport: T,
    ) -> Result<Self, ClientError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(ClientError::MissingCredential(config.credential_env.clone()));
        }

        let headers = vec![
            ("Authorization".to_string(), format!("Basic {}", credential)),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ];

        Ok(RemoteClient {
            config,
            transport,
            headers,
            conversation_guid: RwLock::new(Uuid::new_v4().to_string()),
            stop: StopFlag::new(),
            sleep: Box::new(thread::sleep),
        })
    }

    /// Replace the backoff sleep (tests record instead of sleeping).
    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Start a new conversation id for subsequent requests.
    pub fn new_conversation(&self) {
        *self.conversation_guid.write() = Uuid::new_v4().to_string();
    }

    pub fn conversation_guid(&self) -> String {
        self.conversation_guid.read().clone()
    }

    /// The request body. Every field is mandatory on the gateway side.
    pub fn build_request_body(&self, conversation: &[Message], temperature: Option<f64>) -> Value {
        let messages: Vec<Value> = conversation.iter().map(Message::to_wire).collect();
        json!({
            "model": self.config.model,
            "conversation_guid": self.conversation_guid(),
            "stream": false,
            "skip_db_save": true,
            "conversation_mode": ["non-rag"],
            "temperature": temperature.unwrap_or(self.config.temperature),
            "messages": messages,
        })
    }

    /// Ping the gateway. Returns "OK" or "ERROR: <message>".
    pub fn health_check(&self) -> String {
        let result = self.send(&[Message::user("ping")], None, 1);
        if result.success {
            "OK".to_string()
        } else {
            format!("ERROR: {}", result.error_message())
        }
    }
}

impl<T: Transport> InferenceBackend for RemoteClient<T> {
    fn send(
        &self,
        conversation: &[Message],
        temperature: Option<f64>,
        max_attempts: u32,
    ) -> InferenceResult {
        let url = self.config.url();
        let body = self.build_request_body(conversation, temperature);
        let max_attempts = max_attempts.max(1);
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.stop.is_set() {
                debug!(attempt, "stop requested, not sending");
                return InferenceResult::failure(ErrorKind::Cancelled, "Request cancelled by user");
            }

            let request = HttpRequest {
                url: &url,
                headers: &self.headers,
                body: &body,
            };

            let reason = match self.transport.post(&request) {
                Ok(reply) => match classify_reply(&reply) {
                    Disposition::Accept => return parse_reply(&reply),
                    Disposition::Fail(kind, message) => {
                        warn!(status = reply.status, kind = %kind, "request rejected: {}", message);
                        return InferenceResult::failure(kind, message);
                    }
                    Disposition::Retry(message) => message,
                },
                Err(err) => err.to_string(),
            };

            if attempt >= max_attempts {
                warn!(attempts = attempt, "giving up: {}", reason);
                return InferenceResult::failure(
                    ErrorKind::Transient,
                    format!("{} (after {} attempts)", reason, attempt),
                );
            }

            warn!(
                attempt,
                max_attempts,
                backoff_secs = backoff,
                "transient failure, retrying: {}",
                reason
            );
            (self.sleep)(Duration::from_secs(backoff));
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }

    fn complete(&self, conversation: &[Message], temperature: Option<f64>) -> InferenceResult {
        self.send(conversation, temperature, self.config.max_attempts)
    }

    fn request_stop(&self) {
        self.stop.request();
    }

    fn reset_stop(&self) {
        self.stop.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{chat_reply, RecordingTransport};
    use parking_lot::Mutex;

    fn client(transport: RecordingTransport) -> (RemoteClient<RecordingTransport>, Arc<Mutex<Vec<Duration>>>) {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let recorded = sleeps.clone();
        let client = RemoteClient::with_transport(ClientConfig::default(), "dG9rZW4=", transport)
            .unwrap()
            .with_sleeper(move |d| recorded.lock().push(d));
        (client, sleeps)
    }

    fn server_error() -> Result<HttpReply, TransportError> {
        Ok(HttpReply {
            status: 503,
            content_type: "text/plain".to_string(),
            body: "unavailable".to_string(),
        })
    }

    #[test]
    fn message_text_is_sent_as_typed_segment() {
        let wire = Message::user("Hello").to_wire();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], json!([{ "type": "text", "text": "Hello" }]));
    }

    #[test]
    fn structured_content_is_sent_as_is() {
        let msg = Message {
            role: Role::Assistant,
            content: Content::Segments(vec![Segment::text("Hi")]),
        };
        assert_eq!(msg.to_wire()["content"], json!([{ "type": "text", "text": "Hi" }]));
        assert_eq!(msg.text(), "Hi");
    }

    #[test]
    fn request_body_has_all_mandatory_fields() {
        let (client, _) = client(RecordingTransport::new(vec![]));
        let body = client.build_request_body(&[Message::system("s"), Message::user("u")], Some(0.2));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], false);
        assert_eq!(body["skip_db_save"], true);
        assert_eq!(body["conversation_mode"], json!(["non-rag"]));
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert!(Uuid::parse_str(body["conversation_guid"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn default_temperature_comes_from_config() {
        let (client, _) = client(RecordingTransport::new(vec![]));
        let body = client.build_request_body(&[Message::user("u")], None);
        assert_eq!(body["temperature"], 0.7);
    }

    #[test]
    fn new_conversation_changes_guid() {
        let (client, _) = client(RecordingTransport::new(vec![]));
        let before = client.conversation_guid();
        client.new_conversation();
        assert_ne!(before, client.conversation_guid());
    }

    #[test]
    fn authorization_header_uses_trimmed_credential() {
        let transport = RecordingTransport::new(vec![Ok(chat_reply("hi"))]);
        let client = RemoteClient::with_transport(ClientConfig::default(), "  abc \n", transport).unwrap();
        client.send(&[Message::user("x")], None, 1);
        let headers = client.transport().last_headers();
        assert!(headers.contains(&("Authorization".to_string(), "Basic abc".to_string())));
    }

    #[test]
    fn empty_credential_is_a_setup_error() {
        let result = RemoteClient::with_transport(
            ClientConfig::default(),
            "   ",
            RecordingTransport::new(vec![]),
        );
        assert!(matches!(result, Err(ClientError::MissingCredential(_))));
    }

    #[test]
    fn string_content_is_returned() {
        let (client, _) = client(RecordingTransport::new(vec![Ok(chat_reply("the answer"))]));
        let result = client.send(&[Message::user("q")], None, 3);
        assert!(result.success);
        assert_eq!(result.content, "the answer");
        assert!(result.raw.is_some());
    }

    #[test]
    fn segment_content_concatenates_text_and_skips_unknown() {
        let body = json!({"choices": [{"messages": [{"content": [
            {"type": "text", "text": "Hello, "},
            {"type": "image", "url": "x"},
            {"type": "text", "text": "world"}
        ]}]}]});
        let (client, _) = client(RecordingTransport::new(vec![Ok(HttpReply::json(200, &body))]));
        let result = client.send(&[Message::user("q")], None, 1);
        assert!(result.success);
        assert_eq!(result.content, "Hello, world");
    }

    #[test]
    fn single_message_object_is_accepted() {
        let body = json!({"choices": [{"message": {"content": "ok"}}]});
        let (client, _) = client(RecordingTransport::new(vec![Ok(HttpReply::json(200, &body))]));
        assert_eq!(client.send(&[Message::user("q")], None, 1).content, "ok");
    }

    #[test]
    fn missing_choices_is_a_parse_failure_with_raw_payload() {
        let body = json!({"unexpected": true});
        let (client, _) = client(RecordingTransport::new(vec![Ok(HttpReply::json(200, &body))]));
        let result = client.send(&[Message::user("q")], None, 1);
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Parse));
        assert_eq!(result.raw, Some(body));
    }

    #[test]
    fn invalid_json_is_a_parse_failure() {
        let reply = HttpReply {
            status: 200,
            content_type: "application/json".to_string(),
            body: "{not json".to_string(),
        };
        let (client, _) = client(RecordingTransport::new(vec![Ok(reply)]));
        let result = client.send(&[Message::user("q")], None, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::Parse));
    }

    #[test]
    fn server_errors_retry_with_doubling_backoff() {
        let transport = RecordingTransport::new(vec![server_error(), server_error(), Ok(chat_reply("done"))]);
        let (client, sleeps) = client(transport);
        let result = client.send(&[Message::user("q")], None, 5);
        assert!(result.success);
        assert_eq!(client.transport().calls(), 3);
        assert_eq!(*sleeps.lock(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[test]
    fn never_exceeds_max_attempts_and_never_sleeps_after_last() {
        let transport = RecordingTransport::new((0..10).map(|_| server_error()).collect());
        let (client, sleeps) = client(transport);
        let result = client.send(&[Message::user("q")], None, 3);
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Transient));
        assert_eq!(client.transport().calls(), 3);
        assert_eq!(sleeps.lock().len(), 2);
    }

    #[test]
    fn backoff_is_capped_at_32_seconds() {
        let transport = RecordingTransport::new((0..10).map(|_| server_error()).collect());
        let (client, sleeps) = client(transport);
        client.send(&[Message::user("q")], None, 7);
        let secs: Vec<u64> = sleeps.lock().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32, 32]);
    }

    #[test]
    fn transport_faults_are_retried() {
        let transport = RecordingTransport::new(vec![
            Err(TransportError::Timeout("60s".to_string())),
            Ok(chat_reply("recovered")),
        ]);
        let (client, sleeps) = client(transport);
        let result = client.send(&[Message::user("q")], None, 2);
        assert!(result.success);
        assert_eq!(sleeps.lock().len(), 1);
    }

    #[test]
    fn unauthorized_is_not_retried() {
        let reply = HttpReply {
            status: 401,
            content_type: "application/json".to_string(),
            body: "{}".to_string(),
        };
        let (client, sleeps) = client(RecordingTransport::new(vec![Ok(reply.clone()), Ok(reply)]));
        let result = client.send(&[Message::user("q")], None, 5);
        assert_eq!(result.error_kind(), Some(ErrorKind::Auth));
        assert_eq!(result.error_kind().map(ErrorKind::user_hint), Some("check credentials"));
        assert_eq!(client.transport().calls(), 1);
        assert!(sleeps.lock().is_empty());
    }

    #[test]
    fn redirect_status_is_not_retried() {
        let reply = HttpReply {
            status: 302,
            content_type: String::new(),
            body: String::new(),
        };
        let (client, _) = client(RecordingTransport::new(vec![Ok(reply)]));
        let result = client.send(&[Message::user("q")], None, 5);
        assert_eq!(result.error_kind(), Some(ErrorKind::Redirect));
        assert_eq!(client.transport().calls(), 1);
    }

    #[test]
    fn html_body_without_content_type_is_a_redirect() {
        let reply = HttpReply {
            status: 200,
            content_type: String::new(),
            body: "<!DOCTYPE html><html><body>Sign in</body></html>".to_string(),
        };
        let (client, _) = client(RecordingTransport::new(vec![Ok(reply)]));
        let result = client.send(&[Message::user("q")], None, 5);
        assert_eq!(result.error_kind(), Some(ErrorKind::Redirect));
    }

    #[test]
    fn stop_flag_cancels_before_sending() {
        let (client, _) = client(RecordingTransport::new(vec![Ok(chat_reply("x"))]));
        client.request_stop();
        let result = client.send(&[Message::user("q")], None, 5);
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(client.transport().calls(), 0);

        client.reset_stop();
        assert!(client.send(&[Message::user("q")], None, 5).success);
    }

    #[test]
    fn stop_during_backoff_cancels_next_attempt() {
        let transport = RecordingTransport::new(vec![server_error(), Ok(chat_reply("late"))]);
        let client = RemoteClient::with_transport(ClientConfig::default(), "t", transport).unwrap();
        let flag = client.stop_flag();
        let client = client.with_sleeper(move |_| flag.request());
        let result = client.send(&[Message::user("q")], None, 5);
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(client.transport().calls(), 1);
    }

    #[test]
    fn send_async_delivers_result_to_callback() {
        let (client, _) = client(RecordingTransport::new(vec![Ok(chat_reply("async"))]));
        let client = Arc::new(client);
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let handle = send_async(client, vec![Message::user("q")], None, move |r| {
            *sink.lock() = Some(r.content.clone());
        });
        let result = handle.join().unwrap();
        assert_eq!(result.content, "async");
        assert_eq!(seen.lock().as_deref(), Some("async"));
    }

    #[test]
    fn health_check_reports_errors() {
        let (client, _) = client(RecordingTransport::new(vec![server_error()]));
        assert!(client.health_check().starts_with("ERROR:"));
        let (client, _) = client_ok();
        assert_eq!(client.health_check(), "OK");
    }

    fn client_ok() -> (RemoteClient<RecordingTransport>, Arc<Mutex<Vec<Duration>>>) {
        client(RecordingTransport::new(vec![Ok(chat_reply("pong"))]))
    }
}
