use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::utils::http::get_http_client;
use crate::utils::timing::log_painter_timing;

const INSERT_TASK_PATH: &str = "/insert_task";
const GET_TASK_RESULT_PATH: &str = "/get_task_result";
const PROCESSING_PREFIX: &str = "process";
const QUEUED_PREFIX: &str = "in queue";
const ERROR_BODY_LIMIT: usize = 800;

/// Body of `POST /insert_task`. Field names are the service's wire format.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSubmission {
    pub mode: String,
    pub style: String,
    pub encoded_image: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Processing,
    Queued { position: String },
    Completed { base64_image: String },
}

impl TaskResult {
    /// The service reports progress through string prefixes on `result`;
    /// anything that is not a progress marker is the finished image.
    pub fn from_service_string(result: String) -> Self {
        if result.starts_with(PROCESSING_PREFIX) {
            TaskResult::Processing
        } else if result.starts_with(QUEUED_PREFIX) {
            TaskResult::Queued {
                position: result.replacen(QUEUED_PREFIX, "", 1).trim().to_string(),
            }
        } else {
            TaskResult::Completed {
                base64_image: result,
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskResult::Completed { .. })
    }
}

#[derive(Debug, Error)]
pub enum PainterError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned an unreadable body: {detail}")]
    Decode { endpoint: String, detail: String },
    #[error("{endpoint} response is missing `{field}`")]
    MissingField {
        endpoint: String,
        field: &'static str,
    },
}

#[async_trait]
pub trait PainterApi: Send + Sync {
    async fn insert_task(
        &self,
        base_url: &str,
        submission: &TaskSubmission,
    ) -> Result<TaskHandle, PainterError>;

    async fn get_task_result(
        &self,
        base_url: &str,
        task: &TaskHandle,
    ) -> Result<TaskResult, PainterError>;
}

#[derive(Debug, Deserialize)]
struct InsertTaskResponse {
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TaskResultRequest<'a> {
    task_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TaskResultResponse {
    #[serde(default)]
    result: Option<String>,
}

fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

pub(crate) fn parse_insert_task_response(
    endpoint: &str,
    body: &str,
) -> Result<TaskHandle, PainterError> {
    let parsed: InsertTaskResponse =
        serde_json::from_str(body).map_err(|err| PainterError::Decode {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        })?;
    match parsed.task_id {
        Some(task_id) if !task_id.trim().is_empty() => Ok(TaskHandle { task_id }),
        _ => Err(PainterError::MissingField {
            endpoint: endpoint.to_string(),
            field: "task_id",
        }),
    }
}

pub(crate) fn parse_task_result_response(
    endpoint: &str,
    body: &str,
) -> Result<TaskResult, PainterError> {
    let parsed: TaskResultResponse =
        serde_json::from_str(body).map_err(|err| PainterError::Decode {
            endpoint: endpoint.to_string(),
            detail: err.to_string(),
        })?;
    let result = parsed.result.ok_or_else(|| PainterError::MissingField {
        endpoint: endpoint.to_string(),
        field: "result",
    })?;
    Ok(TaskResult::from_service_string(result))
}

/// `PainterApi` over the service's JSON-over-HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpPainter {
    client: Client,
    timeout: Duration,
}

impl HttpPainter {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn shared(timeout: Duration) -> Self {
        Self::new(get_http_client().clone(), timeout)
    }

    async fn post_json<B: Serialize + ?Sized + Sync>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<String, PainterError> {
        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|source| PainterError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PainterError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: truncate_for_log(&body, ERROR_BODY_LIMIT),
            });
        }

        response
            .text()
            .await
            .map_err(|source| PainterError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })
    }
}

#[async_trait]
impl PainterApi for HttpPainter {
    async fn insert_task(
        &self,
        base_url: &str,
        submission: &TaskSubmission,
    ) -> Result<TaskHandle, PainterError> {
        let endpoint = endpoint_url(base_url, INSERT_TASK_PATH);
        let metadata = json!({
            "mode": submission.mode,
            "style": submission.style,
            "width": submission.width,
            "height": submission.height,
            "encoded_len": submission.encoded_image.len(),
        });

        let handle = log_painter_timing(&endpoint, "insert_task", Some(metadata), || async {
            let body = self.post_json(&endpoint, submission).await?;
            parse_insert_task_response(&endpoint, &body)
        })
        .await?;

        info!(task_id = %handle.task_id, "Painter task submitted");
        Ok(handle)
    }

    async fn get_task_result(
        &self,
        base_url: &str,
        task: &TaskHandle,
    ) -> Result<TaskResult, PainterError> {
        let endpoint = endpoint_url(base_url, GET_TASK_RESULT_PATH);
        let metadata = json!({ "task_id": task.task_id });

        let result = log_painter_timing(&endpoint, "get_task_result", Some(metadata), || async {
            let request = TaskResultRequest {
                task_id: &task.task_id,
            };
            let body = self.post_json(&endpoint, &request).await?;
            parse_task_result_response(&endpoint, &body)
        })
        .await?;

        debug!(task_id = %task.task_id, terminal = result.is_terminal(), "Painter task polled");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    const ENDPOINT: &str = "http://painter.local/insert_task";

    #[test]
    fn classifies_processing_marker() {
        assert_eq!(
            TaskResult::from_service_string("processing".to_string()),
            TaskResult::Processing
        );
        assert_eq!(
            TaskResult::from_service_string("process 40%".to_string()),
            TaskResult::Processing
        );
    }

    #[test]
    fn queued_marker_keeps_the_remainder_as_position() {
        assert_eq!(
            TaskResult::from_service_string("in queue 3".to_string()),
            TaskResult::Queued {
                position: "3".to_string()
            }
        );
        assert_eq!(
            TaskResult::from_service_string("in queue".to_string()),
            TaskResult::Queued {
                position: String::new()
            }
        );
    }

    #[test]
    fn anything_else_is_the_finished_image() {
        let result = TaskResult::from_service_string("iVBORw0KGgo=".to_string());
        assert!(result.is_terminal());
        assert_eq!(
            result,
            TaskResult::Completed {
                base64_image: "iVBORw0KGgo=".to_string()
            }
        );
    }

    #[test]
    fn prefix_match_is_case_sensitive() {
        assert!(TaskResult::from_service_string("Processing".to_string()).is_terminal());
    }

    #[test]
    fn submission_serializes_to_wire_shape() {
        let submission = TaskSubmission {
            mode: "repaint".to_string(),
            style: "anime".to_string(),
            encoded_image: "AAAA".to_string(),
            width: 640,
            height: 480,
        };
        let value = serde_json::to_value(&submission).unwrap();
        assert_eq!(
            value,
            json!({
                "mode": "repaint",
                "style": "anime",
                "encoded_image": "AAAA",
                "width": 640,
                "height": 480
            })
        );
    }

    #[test]
    fn task_result_request_serializes_task_id_only() {
        let value = serde_json::to_value(TaskResultRequest { task_id: "t-1" }).unwrap();
        assert_eq!(value, json!({ "task_id": "t-1" }));
    }

    #[test]
    fn parses_task_id() {
        let handle = parse_insert_task_response(ENDPOINT, r#"{"task_id":"abc123"}"#).unwrap();
        assert_eq!(handle.task_id, "abc123");
    }

    #[test]
    fn missing_or_blank_task_id_is_an_error() {
        for body in [r#"{}"#, r#"{"task_id":null}"#, r#"{"task_id":"  "}"#] {
            let err = parse_insert_task_response(ENDPOINT, body).unwrap_err();
            assert!(
                matches!(err, PainterError::MissingField { field: "task_id", .. }),
                "unexpected error for {body}: {err}"
            );
        }
    }

    #[test]
    fn non_json_body_is_a_decode_error() {
        let err = parse_insert_task_response(ENDPOINT, "<html>502</html>").unwrap_err();
        assert!(matches!(err, PainterError::Decode { .. }));
    }

    #[test]
    fn missing_result_field_is_an_error() {
        let err = parse_task_result_response(ENDPOINT, r#"{"status":"ok"}"#).unwrap_err();
        assert!(matches!(err, PainterError::MissingField { field: "result", .. }));
    }

    #[test]
    fn endpoint_url_tolerates_trailing_slash() {
        assert_eq!(
            endpoint_url("http://host:7860/", GET_TASK_RESULT_PATH),
            "http://host:7860/get_task_result"
        );
    }

    /// Answers exactly one HTTP request and hands back the raw request text.
    async fn serve_once(status_line: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let headers = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + length {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn painter() -> HttpPainter {
        HttpPainter::new(Client::new(), Duration::from_secs(5))
    }

    fn submission() -> TaskSubmission {
        TaskSubmission {
            mode: "repaint".to_string(),
            style: "anime".to_string(),
            encoded_image: "AAAA".to_string(),
            width: 2,
            height: 2,
        }
    }

    #[tokio::test]
    async fn error_status_is_reported_with_a_truncated_body() {
        let (base_url, server) =
            serve_once("503 Service Unavailable", "x".repeat(ERROR_BODY_LIMIT * 2)).await;

        let err = painter()
            .insert_task(&base_url, &submission())
            .await
            .unwrap_err();

        match err {
            PainterError::Status {
                endpoint,
                status,
                body,
            } => {
                assert_eq!(endpoint, format!("{base_url}/insert_task"));
                assert_eq!(status, 503);
                assert!(body.ends_with("... (truncated)"));
                assert_eq!(
                    body.chars().count(),
                    ERROR_BODY_LIMIT + "... (truncated)".len()
                );
            }
            other => panic!("unexpected error: {other}"),
        }

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /insert_task "));
        assert!(request.contains(r#""encoded_image":"AAAA""#));
    }

    #[tokio::test]
    async fn successful_poll_is_classified() {
        let (base_url, server) =
            serve_once("200 OK", r#"{"result":"in queue 2"}"#.to_string()).await;
        let task = TaskHandle {
            task_id: "t-9".to_string(),
        };

        let result = painter().get_task_result(&base_url, &task).await.unwrap();

        assert_eq!(
            result,
            TaskResult::Queued {
                position: "2".to_string()
            }
        );
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /get_task_result "));
        assert!(request.contains(r#"{"task_id":"t-9"}"#));
    }
}
