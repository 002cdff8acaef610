//! Upload pipeline: one registration request per finalized artifact.
//!
//! Single attempt, no automatic retry. Network errors, non-success status
//! codes, malformed bodies and server-side rejections all come back as
//! [`UploadFailed`].

use async_trait::async_trait;
use facecap_core::{CaptureArtifact, ServerReply};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::multipart::{Form, Part};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Multipart part name carrying the video.
pub const FILE_PART: &str = "file";

/// Everything outside the RFC 3986 unreserved set is escaped.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Where the registration call went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// The request could not be built.
    Request,
    /// Connection, TLS, or transport timeout.
    Network,
    /// Non-success HTTP status.
    Status(u16),
    /// Response was not valid JSON.
    Body,
    /// JSON response carried an `error` field.
    Rejected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{cause}")]
pub struct UploadFailed {
    pub stage: FailureStage,
    /// Human-readable cause.
    pub cause: String,
}

impl UploadFailed {
    pub fn new(stage: FailureStage, cause: impl Into<String>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }
}

pub type UploadResult = Result<ServerReply, UploadFailed>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("an upload is already in flight for this session")]
    InFlight,
    #[error(transparent)]
    Failed(#[from] UploadFailed),
}

/// Sends an artifact to the face-registration backend.
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    async fn register(&self, subject_id: &str, artifact: &CaptureArtifact) -> UploadResult;
}

/// Map a raw HTTP response onto the upload outcome.
pub fn interpret_response(status: u16, body: &str) -> UploadResult {
    if !(200..300).contains(&status) {
        let snippet: String = body.chars().take(200).collect();
        return Err(UploadFailed::new(
            FailureStage::Status(status),
            format!("server returned HTTP {status}: {}", snippet.trim()),
        ));
    }

    let json: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        UploadFailed::new(FailureStage::Body, format!("malformed response body: {e}"))
    })?;

    if let Some(err) = json.get("error").filter(|v| !v.is_null()) {
        let cause = err
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(UploadFailed::new(
            FailureStage::Rejected,
            format!("server rejected registration: {cause}"),
        ));
    }

    Ok(ServerReply::from_json(json))
}

/// reqwest-backed client posting `multipart/form-data`.
pub struct HttpRegistrationClient {
    client: reqwest::Client,
    base_url: String,
    path_template: String,
}

impl HttpRegistrationClient {
    /// `path_template` must contain `{subject}`, e.g. `/faces/register_video/{subject}`.
    /// `timeout` of `None` leaves reqwest's default (no overall timeout).
    pub fn new(
        base_url: impl Into<String>,
        path_template: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into(),
            path_template: path_template.into(),
        })
    }

    pub fn endpoint(&self, subject_id: &str) -> String {
        let subject = utf8_percent_encode(subject_id, PATH_SEGMENT).to_string();
        let path = self.path_template.replace("{subject}", &subject);
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl RegistrationClient for HttpRegistrationClient {
    async fn register(&self, subject_id: &str, artifact: &CaptureArtifact) -> UploadResult {
        let url = self.endpoint(subject_id);

        let part = Part::stream_with_length(artifact.data().clone(), artifact.len() as u64)
            .file_name(artifact.file_name())
            .mime_str(artifact.media_type())
            .map_err(|e| {
                UploadFailed::new(
                    FailureStage::Request,
                    format!("invalid media type {:?}: {e}", artifact.media_type()),
                )
            })?;
        let form = Form::new().part(FILE_PART, part);

        tracing::debug!(%url, bytes = artifact.len(), "posting registration video");
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadFailed::new(FailureStage::Network, format!("request failed: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            UploadFailed::new(FailureStage::Body, format!("failed to read response: {e}"))
        })?;

        interpret_response(status.as_u16(), &body)
    }
}

/// Consumes artifacts, one registration call each, never two at once.
pub struct UploadPipeline {
    client: Arc<dyn RegistrationClient>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however the upload future ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UploadPipeline {
    pub fn new(client: Arc<dyn RegistrationClient>) -> Self {
        Self {
            client,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Upload `artifact` for `subject_id`. The artifact is dropped once the
    /// outcome is known.
    pub async fn send(
        &self,
        artifact: CaptureArtifact,
        subject_id: &str,
    ) -> Result<ServerReply, UploadError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(subject = subject_id, "upload rejected: another is in flight");
            return Err(UploadError::InFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        tracing::info!(
            subject = subject_id,
            bytes = artifact.len(),
            media_type = artifact.media_type(),
            "uploading capture"
        );
        let result = self.client.register(subject_id, &artifact).await;
        drop(artifact);

        match &result {
            Ok(reply) => tracing::info!(subject = subject_id, message = %reply.message, "upload accepted"),
            Err(e) => tracing::warn!(subject = subject_id, stage = ?e.stage, error = %e, "upload failed"),
        }
        result.map_err(UploadError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    #[test]
    fn test_interpret_success() {
        let reply = interpret_response(200, r#"{"status":"ok"}"#).unwrap();
        assert_eq!(reply.message, "ok");
    }

    #[test]
    fn test_interpret_server_error() {
        let err = interpret_response(500, "Internal Server Error").unwrap_err();
        assert_eq!(err.stage, FailureStage::Status(500));
        assert!(err.cause.contains("500"));
    }

    #[test]
    fn test_interpret_malformed_body() {
        let err = interpret_response(200, "<html>oops</html>").unwrap_err();
        assert_eq!(err.stage, FailureStage::Body);
    }

    #[test]
    fn test_interpret_rejection_with_ok_status() {
        let err = interpret_response(200, r#"{"error":"no face found","skipped_files":[]}"#)
            .unwrap_err();
        assert_eq!(err.stage, FailureStage::Rejected);
        assert!(err.cause.contains("no face found"));
    }

    #[test]
    fn test_interpret_null_error_is_success() {
        assert!(interpret_response(201, r#"{"error":null,"message":"saved"}"#).is_ok());
    }

    #[test]
    fn test_endpoint_encodes_subject() {
        let client =
            HttpRegistrationClient::new("http://localhost:8000/", "/faces/register_video/{subject}", None)
                .unwrap();
        assert_eq!(
            client.endpoint("1"),
            "http://localhost:8000/faces/register_video/1"
        );
        assert_eq!(
            client.endpoint("a b/c"),
            "http://localhost:8000/faces/register_video/a%20b%2Fc"
        );
    }

    /// Accept one request, answer it with `status` and a JSON `body`, and
    /// return the raw request text from the join handle.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&request) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (base, server)
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
        let body = &request[end + 4..];
        match head.lines().find_map(|l| l.strip_prefix("content-length:")) {
            Some(len) => body.len() >= len.trim().parse::<usize>().unwrap(),
            None => body.ends_with(b"0\r\n\r\n"),
        }
    }

    fn http_client(base: String) -> HttpRegistrationClient {
        HttpRegistrationClient::new(
            base,
            "/faces/register_video/{subject}",
            Some(Duration::from_secs(5)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_client_posts_multipart_file() {
        let (base, server) = serve_once("200 OK", r#"{"status":"ok"}"#).await;
        let reply = http_client(base)
            .register("1", &artifact(b"webm-payload"))
            .await
            .unwrap();
        assert_eq!(reply.message, "ok");

        let request = server.await.unwrap();
        assert!(
            request.starts_with("POST /faces/register_video/1 HTTP/1.1\r\n"),
            "unexpected request line: {request}"
        );
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("content-type: multipart/form-data; boundary="));
        assert!(lower.contains(
            r#"content-disposition: form-data; name="file"; filename="video.webm""#
        ));
        assert!(lower.contains("content-type: video/webm"));
        assert!(request.contains("webm-payload"));
    }

    #[tokio::test]
    async fn test_http_client_maps_server_error_status() {
        let (base, server) = serve_once("500 Internal Server Error", r#"{"detail":"boom"}"#).await;
        let err = http_client(base)
            .register("1", &artifact(b"v"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, FailureStage::Status(500));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_client_unreachable_server_is_network_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = http_client(base)
            .register("1", &artifact(b"v"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, FailureStage::Network);
    }

    struct CountingClient {
        calls: Mutex<Vec<(String, String, usize)>>,
        gate: Option<Arc<Notify>>,
        response: UploadResult,
    }

    #[async_trait]
    impl RegistrationClient for CountingClient {
        async fn register(&self, subject_id: &str, artifact: &CaptureArtifact) -> UploadResult {
            self.calls.lock().unwrap().push((
                subject_id.to_string(),
                artifact.media_type().to_string(),
                artifact.len(),
            ));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.response.clone()
        }
    }

    fn artifact(data: &'static [u8]) -> CaptureArtifact {
        CaptureArtifact::new(Bytes::from_static(data), "video/webm")
    }

    #[tokio::test]
    async fn test_send_passes_artifact_and_subject() {
        let client = Arc::new(CountingClient {
            calls: Mutex::new(Vec::new()),
            gate: None,
            response: interpret_response(200, r#"{"status":"ok"}"#),
        });
        let pipeline = UploadPipeline::new(client.clone());
        let reply = pipeline.send(artifact(b"video"), "1").await.unwrap();
        assert_eq!(reply.message, "ok");
        assert_eq!(
            *client.calls.lock().unwrap(),
            vec![("1".to_string(), "video/webm".to_string(), 5)]
        );
        assert!(!pipeline.is_in_flight());
    }

    #[tokio::test]
    async fn test_concurrent_send_is_rejected() {
        let gate = Arc::new(Notify::new());
        let client = Arc::new(CountingClient {
            calls: Mutex::new(Vec::new()),
            gate: Some(gate.clone()),
            response: interpret_response(200, r#"{"status":"ok"}"#),
        });
        let pipeline = UploadPipeline::new(client.clone());

        let first = pipeline.send(artifact(b"one"), "1");
        let second = async {
            let r = pipeline.send(artifact(b"two"), "1").await;
            gate.notify_one();
            r
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert_eq!(second.unwrap_err(), UploadError::InFlight);
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_once_and_clears_guard() {
        let client = Arc::new(CountingClient {
            calls: Mutex::new(Vec::new()),
            gate: None,
            response: interpret_response(500, "boom"),
        });
        let pipeline = UploadPipeline::new(client.clone());
        let err = pipeline.send(artifact(b"v"), "1").await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Failed(UploadFailed {
                stage: FailureStage::Status(500),
                ..
            })
        ));
        assert_eq!(client.calls.lock().unwrap().len(), 1);
        assert!(!pipeline.is_in_flight());
    }
}
