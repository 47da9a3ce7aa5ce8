//! Integration tests for the gateway client: reply classification, retry
//! budget, request schema, credential handling and the async variant.
//!
//! No network: every test drives `RemoteClient` through a scripted transport.

use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

use promptopt::client::{
    ClientConfig, ClientError, ErrorKind, HttpReply, InferenceBackend, Message, RemoteClient,
    TransportError, send_async,
};
use promptopt::test_helpers::{RecordingTransport, chat_reply};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn client_with(
    config: ClientConfig,
    replies: Vec<Result<HttpReply, TransportError>>,
) -> (RemoteClient<RecordingTransport>, Arc<Mutex<Vec<Duration>>>) {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let sink = sleeps.clone();
    let client = RemoteClient::with_transport(config, "dXNlcjpwYXNz", RecordingTransport::new(replies))
        .unwrap()
        .with_sleeper(move |d| sink.lock().push(d));
    (client, sleeps)
}

fn html(status: u16) -> Result<HttpReply, TransportError> {
    Ok(HttpReply {
        status,
        content_type: "text/html; charset=utf-8".to_string(),
        body: "<html><body>Sign in to continue</body></html>".to_string(),
    })
}

fn status(code: u16) -> Result<HttpReply, TransportError> {
    Ok(HttpReply {
        status: code,
        content_type: "application/json".to_string(),
        body: "{}".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn html_200_is_a_redirect_failure_without_retry() {
    let (client, sleeps) = client_with(ClientConfig::default(), vec![html(200), Ok(chat_reply("never"))]);
    let result = client.send(&[Message::user("hello")], None, 5);

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Redirect));
    assert!(result.error_kind().unwrap().is_auth_or_redirect());
    assert_eq!(client.transport().calls(), 1);
    assert!(sleeps.lock().is_empty());
}

#[test]
fn html_body_wins_even_when_it_looks_like_json() {
    let reply = Ok(HttpReply {
        status: 200,
        content_type: "text/html".to_string(),
        body: r#"{"choices":[{"message":{"content":"hi"}}]}"#.to_string(),
    });
    let (client, _) = client_with(ClientConfig::default(), vec![reply]);
    let result = client.send(&[Message::user("hello")], None, 3);
    assert_eq!(result.error_kind(), Some(ErrorKind::Redirect));
}

#[test]
fn auth_failures_are_not_retried() {
    for code in [401, 403] {
        let (client, sleeps) = client_with(ClientConfig::default(), vec![status(code), Ok(chat_reply("x"))]);
        let result = client.send(&[Message::user("hello")], None, 5);
        assert_eq!(result.error_kind(), Some(ErrorKind::Auth), "status {}", code);
        assert_eq!(ErrorKind::Auth.user_hint(), "check credentials");
        assert_eq!(client.transport().calls(), 1);
        assert!(sleeps.lock().is_empty());
    }
}

#[test]
fn redirect_status_is_not_retried() {
    let (client, _) = client_with(ClientConfig::default(), vec![status(302)]);
    let result = client.send(&[Message::user("hello")], None, 5);
    assert_eq!(result.error_kind(), Some(ErrorKind::Redirect));
    assert_eq!(ErrorKind::Redirect.user_hint(), "check network/VPN");
}

// ---------------------------------------------------------------------------
// Retry budget
// ---------------------------------------------------------------------------

#[test]
fn complete_uses_configured_attempt_budget() {
    let config = ClientConfig {
        max_attempts: 3,
        ..ClientConfig::default()
    };
    let replies = (0..10).map(|_| status(502)).collect();
    let (client, sleeps) = client_with(config, replies);

    let result = client.complete(&[Message::user("hello")], None);
    assert_eq!(result.error_kind(), Some(ErrorKind::Transient));
    assert_eq!(client.transport().calls(), 3);
    // Two sleeps between three attempts, none after the last.
    assert_eq!(
        *sleeps.lock(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
}

#[test]
fn transport_errors_are_retried_then_surface_as_transient() {
    let replies = vec![
        Err(TransportError::Timeout("30s".to_string())),
        Err(TransportError::Connect("refused".to_string())),
        Ok(chat_reply("finally")),
    ];
    let (client, sleeps) = client_with(ClientConfig::default(), replies);
    let result = client.send(&[Message::user("hello")], None, 5);
    assert!(result.success);
    assert_eq!(result.content, "finally");
    assert_eq!(sleeps.lock().len(), 2);
}

#[test]
fn stop_before_send_returns_cancelled_without_io() {
    let (client, _) = client_with(ClientConfig::default(), vec![Ok(chat_reply("x"))]);
    client.request_stop();
    let result = client.send(&[Message::user("hello")], None, 5);
    assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(client.transport().calls(), 0);

    client.reset_stop();
    assert!(client.send(&[Message::user("hello")], None, 5).success);
}

// ---------------------------------------------------------------------------
// Request schema
// ---------------------------------------------------------------------------

#[test]
fn request_body_carries_every_mandatory_field() {
    let (client, _) = client_with(ClientConfig::default(), vec![Ok(chat_reply("ok"))]);
    let conversation = [Message::system("Be brief."), Message::user("hello")];
    client.send(&conversation, Some(0.25), 1);

    let body = client.transport().last_body().unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["stream"], false);
    assert_eq!(body["skip_db_save"], true);
    assert_eq!(body["conversation_mode"][0], "non-rag");
    assert_eq!(body["temperature"], 0.25);
    assert_eq!(body["conversation_guid"], client.conversation_guid().as_str());
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"][0]["type"], "text");
    assert_eq!(body["messages"][1]["content"][0]["text"], "hello");

    let headers = client.transport().last_headers();
    assert!(headers.contains(&("Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string())));
}

#[test]
fn new_conversation_changes_the_guid() {
    let (client, _) = client_with(ClientConfig::default(), vec![]);
    let before = client.conversation_guid();
    client.new_conversation();
    assert_ne!(before, client.conversation_guid());
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

const TEST_CREDENTIAL_ENV: &str = "PROMPTOPT_TEST_CREDENTIAL";

fn env_config() -> ClientConfig {
    ClientConfig {
        credential_env: TEST_CREDENTIAL_ENV.to_string(),
        ..ClientConfig::default()
    }
}

#[test]
#[serial]
fn missing_credential_is_a_setup_error() {
    unsafe { std::env::remove_var(TEST_CREDENTIAL_ENV) };
    match RemoteClient::from_config(env_config()) {
        Err(ClientError::MissingCredential(name)) => assert_eq!(name, TEST_CREDENTIAL_ENV),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("client built without a credential"),
    }
}

#[test]
#[serial]
fn blank_credential_is_rejected() {
    unsafe { std::env::set_var(TEST_CREDENTIAL_ENV, "   ") };
    let result = RemoteClient::from_config(env_config());
    unsafe { std::env::remove_var(TEST_CREDENTIAL_ENV) };
    assert!(matches!(result, Err(ClientError::MissingCredential(_))));
}

#[test]
#[serial]
fn credential_is_read_and_trimmed() {
    unsafe { std::env::set_var(TEST_CREDENTIAL_ENV, "  dG9rZW4=\n") };
    let result = RemoteClient::from_config(env_config());
    unsafe { std::env::remove_var(TEST_CREDENTIAL_ENV) };
    assert!(result.is_ok());
}

#[test]
fn missing_ca_bundle_is_a_setup_error() {
    let config = ClientConfig {
        ca_bundle_path: Some("/nonexistent/ca-bundle.pem".to_string()),
        ..ClientConfig::default()
    };
    assert!(matches!(
        promptopt::client::ReqwestTransport::new(&config),
        Err(ClientError::CaBundle { .. })
    ));
}

// ---------------------------------------------------------------------------
// Async variant
// ---------------------------------------------------------------------------

#[test]
fn send_async_hands_result_to_callback_and_join() {
    let (client, _) = client_with(ClientConfig::default(), vec![Ok(chat_reply("from thread"))]);
    let client = Arc::new(client);
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();

    let handle = send_async(client.clone(), vec![Message::user("hello")], None, move |r| {
        *sink.lock() = Some(r.content.clone());
    });
    let result = handle.join().unwrap();

    assert_eq!(result.content, "from thread");
    assert_eq!(seen.lock().as_deref(), Some("from thread"));
}
