use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};
use flate2::{write::GzEncoder, Compression};
use once_cell::sync::OnceCell;
use reqwest::{
    blocking::{Client, RequestBuilder, Response},
    header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT},
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error};

use super::{
    queue::{BatchSender, SendCallback},
    record::EventRecord,
};
use crate::core::settings::SessionHandle;

pub const HEADER_APP_TOKEN: &str = "X-Fritz-Token";
pub const HEADER_INSTANCE_ID: &str = "X-Fritz-Instance-Id";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("backend requests are disabled for this session")]
    Disabled,
    #[error("backend rejected the app credentials: {0}")]
    Fatal(String),
    #[error("backend answered with status {0}")]
    Status(u16),
}

/// Backend queries the model lifecycle depends on.
pub trait ModelApi: Send + Sync {
    fn fetch_active_version(&self, model_id: &str, pinned_version: Option<i32>) -> Result<Value>;
}

/// Backend calls made on behalf of the session.
pub trait SessionApi: Send + Sync {
    fn fetch_settings(&self) -> Result<Value>;

    fn record_annotation(&self, event: &EventRecord) -> Result<()>;
}

pub struct ApiClient {
    api_base: String,
    session: SessionHandle,
    client: OnceCell<Client>,
}

impl ApiClient {
    pub fn new(api_base: impl Into<String>, session: SessionHandle) -> Self {
        Self {
            api_base: api_base.into(),
            session,
            client: OnceCell::new(),
        }
    }

    pub fn batch_track(&self, events: &[EventRecord]) -> Result<()> {
        self.ensure_enabled()?;
        let payload = json!({ "data": events });
        self.post_json("model/event/batch", &payload)?;
        Ok(())
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| Client::builder().build().context("create http client"))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.session.is_api_enabled() {
            Ok(())
        } else {
            debug!("backend disabled; skipping request");
            Err(ApiError::Disabled.into())
        }
    }

    fn with_headers(&self, request: RequestBuilder) -> RequestBuilder {
        self.session.read(|session| {
            request
                .header(USER_AGENT, session.user_agent.as_str())
                .header(HEADER_APP_TOKEN, session.app_token.as_str())
                .header(HEADER_INSTANCE_ID, session.instance_id.as_str())
        })
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        debug!(%url, "api request");
        let response = self
            .with_headers(self.client()?.get(&url))
            .send()
            .with_context(|| format!("GET {url}"))?;
        read_response(response)
    }

    fn post_json(&self, path: &str, payload: &Value) -> Result<Value> {
        let url = self.url(path);
        debug!(%url, "api request");
        let body = serde_json::to_vec(payload).context("serialize request payload")?;
        let mut request = self
            .with_headers(self.client()?.post(&url))
            .header(CONTENT_TYPE, "application/json");
        let body = if self.session.settings().gzip_events {
            request = request.header(CONTENT_ENCODING, "gzip");
            gzip(&body)?
        } else {
            body
        };
        let response = request
            .body(body)
            .send()
            .with_context(|| format!("POST {url}"))?;
        read_response(response)
    }
}

impl ModelApi for ApiClient {
    fn fetch_active_version(&self, model_id: &str, pinned_version: Option<i32>) -> Result<Value> {
        self.ensure_enabled()?;
        let path = match pinned_version {
            Some(version) => format!("model/{model_id}/active?pinned_version={version}"),
            None => format!("model/{model_id}/active"),
        };
        self.get_json(&path)
    }
}

impl SessionApi for ApiClient {
    /// Sent even while `api_enabled` is off.
    fn fetch_settings(&self) -> Result<Value> {
        self.get_json("session/settings")
    }

    fn record_annotation(&self, event: &EventRecord) -> Result<()> {
        self.ensure_enabled()?;
        let payload = json!({ "data": [event] });
        self.post_json("model/annotation", &payload)?;
        Ok(())
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).context("gzip request body")?;
    encoder.finish().context("finish gzip stream")
}

fn read_response(response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().context("read response body")?;
    let body: Value = if text.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&text).unwrap_or(Value::Null)
    };

    if status.is_success() {
        return Ok(body);
    }

    let is_fatal = body.get("is_fatal").and_then(Value::as_bool).unwrap_or(false);
    if is_fatal {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        error!(
            status = status.as_u16(),
            "{message}; check that the app token and package name are registered"
        );
        return Err(ApiError::Fatal(message).into());
    }
    Err(ApiError::Status(status.as_u16()).into())
}

/// Sends telemetry batches through [`ApiClient`] on the blocking pool.
pub struct HttpBatchSender {
    client: Arc<ApiClient>,
    runtime: Handle,
}

impl HttpBatchSender {
    pub fn new(client: Arc<ApiClient>, runtime: Handle) -> Self {
        Self { client, runtime }
    }
}

impl BatchSender for HttpBatchSender {
    fn send_batch(&self, events: Vec<EventRecord>, done: SendCallback) {
        let client = self.client.clone();
        self.runtime.spawn_blocking(move || {
            done(client.batch_track(&events));
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read},
        net::TcpListener,
        sync::mpsc,
        thread,
    };

    use flate2::read::GzDecoder;

    use super::*;
    use crate::{
        core::settings::{Session, SessionSettings},
        telemetry::record::EventPayload,
    };

    struct CapturedRequest {
        request_line: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl CapturedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    fn serve_once(status: &'static str, body: &'static str) -> (String, mpsc::Receiver<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                if let Some((key, value)) = line.split_once(':') {
                    headers.push((key.trim().to_string(), value.trim().to_string()));
                }
            }
            let length = headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.parse::<usize>().ok())
                .unwrap_or(0);
            let mut request_body = vec![0u8; length];
            reader.read_exact(&mut request_body).unwrap();

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let mut stream = reader.into_inner();
            let _ = stream.write_all(response.as_bytes());
            let _ = tx.send(CapturedRequest {
                request_line: request_line.trim_end().to_string(),
                headers,
                body: request_body,
            });
        });
        (format!("http://{addr}/api/v1"), rx)
    }

    fn session(api_enabled: bool, gzip_events: bool) -> SessionHandle {
        let mut session = Session::new("instance-1", "token-1", "host/1.0");
        session.settings = SessionSettings {
            api_enabled,
            gzip_events,
            ..SessionSettings::default()
        };
        SessionHandle::new(session)
    }

    fn event() -> EventRecord {
        EventRecord::new(
            "prediction",
            100,
            EventPayload::Timing {
                model_uid: "m1".into(),
                model_version: 2,
                elapsed_nano_seconds: 5,
            },
        )
    }

    #[test]
    fn disabled_backend_fails_without_io() {
        let client = ApiClient::new("http://127.0.0.1:9", session(false, false));
        let error = client.fetch_active_version("m1", None).unwrap_err();
        assert!(matches!(error.downcast_ref::<ApiError>(), Some(ApiError::Disabled)));
        assert!(client.batch_track(&[event()]).is_err());
    }

    #[test]
    fn settings_are_fetched_while_disabled() {
        let (base, requests) = serve_once("200 OK", r#"{"api_requests_enabled": true}"#);
        let client = ApiClient::new(base, session(false, false));

        let body = client.fetch_settings().unwrap();
        assert_eq!(body["api_requests_enabled"], true);
        assert_eq!(
            requests.recv().unwrap().request_line,
            "GET /api/v1/session/settings HTTP/1.1"
        );
    }

    #[test]
    fn active_version_request_carries_session_headers() {
        let (base, requests) = serve_once("200 OK", r#"{"version": 4, "src": "https://cdn/m1"}"#);
        let client = ApiClient::new(base, session(true, false));

        let body = client.fetch_active_version("m1", Some(3)).unwrap();
        assert_eq!(body["version"], 4);

        let request = requests.recv().unwrap();
        assert_eq!(
            request.request_line,
            "GET /api/v1/model/m1/active?pinned_version=3 HTTP/1.1"
        );
        assert_eq!(request.header(HEADER_APP_TOKEN), Some("token-1"));
        assert_eq!(request.header(HEADER_INSTANCE_ID), Some("instance-1"));
        assert_eq!(request.header("user-agent"), Some("host/1.0"));
    }

    #[test]
    fn batch_is_gzipped_when_enabled() {
        let (base, requests) = serve_once("200 OK", "{}");
        let client = ApiClient::new(base, session(true, true));

        client.batch_track(&[event()]).unwrap();

        let request = requests.recv().unwrap();
        assert_eq!(request.request_line, "POST /api/v1/model/event/batch HTTP/1.1");
        assert_eq!(request.header("content-encoding"), Some("gzip"));
        let mut decoded = String::new();
        GzDecoder::new(request.body.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        let payload: Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(payload["data"][0]["type"], "prediction");
        assert_eq!(payload["data"][0]["data"]["model_version"], 2);
    }

    #[test]
    fn fatal_error_body_is_surfaced() {
        let (base, _requests) = serve_once(
            "401 Unauthorized",
            r#"{"is_fatal": true, "message": "unknown app token"}"#,
        );
        let client = ApiClient::new(base, session(true, false));
        let error = client.fetch_settings().unwrap_err();
        match error.downcast_ref::<ApiError>() {
            Some(ApiError::Fatal(message)) => assert_eq!(message, "unknown app token"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_fatal_error_reports_status() {
        let (base, _requests) = serve_once("503 Service Unavailable", "");
        let client = ApiClient::new(base, session(true, false));
        let error = client.record_annotation(&event()).unwrap_err();
        assert!(matches!(error.downcast_ref::<ApiError>(), Some(ApiError::Status(503))));
    }
}
