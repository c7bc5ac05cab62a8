use std::time::Duration;

use serde::Serialize;

use super::models::{RunResult, RunStatus};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Body POSTed to a request's callback URL once the run is terminal.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload<'a> {
    pub run_id: &'a str,
    pub repo_id: &'a str,
    pub status: RunStatus,
    pub result: Option<&'a RunResult>,
}

/// Sends completion webhooks.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl CallbackClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    /// Deliver `payload`. Errors are returned for logging only; a failed
    /// callback never changes a run's outcome.
    pub async fn send(&self, url: &str, payload: &CallbackPayload<'_>) -> Result<(), String> {
        let mut req = self
            .client
            .post(url)
            .timeout(CALLBACK_TIMEOUT)
            .json(payload);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("callback returned {}", resp.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::spawn_http;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn receiver(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| async move {
                        let key = headers
                            .get("x-api-key")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.lock().unwrap().push((key, body));
                        status
                    },
                ),
            )
            .with_state(seen.clone());
        (format!("{}/hook", spawn_http(app).await), seen)
    }

    #[tokio::test]
    async fn test_send_posts_payload_with_api_key() {
        let (url, seen) = receiver(StatusCode::OK).await;
        let result = RunResult {
            success: true,
            commit: Some("abc".into()),
            attempts: 1,
            ..Default::default()
        };
        let client = CallbackClient::new(Some("secret".into()));
        client
            .send(
                &url,
                &CallbackPayload {
                    run_id: "r1",
                    repo_id: "repo",
                    status: RunStatus::Completed,
                    result: Some(&result),
                },
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("secret"));
        assert_eq!(seen[0].1["run_id"], "r1");
        assert_eq!(seen[0].1["status"], "completed");
        assert_eq!(seen[0].1["result"]["commit"], "abc");
    }

    #[tokio::test]
    async fn test_send_reports_rejection() {
        let (url, _seen) = receiver(StatusCode::BAD_GATEWAY).await;
        let err = CallbackClient::new(None)
            .send(
                &url,
                &CallbackPayload {
                    run_id: "r1",
                    repo_id: "repo",
                    status: RunStatus::Failed,
                    result: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.contains("502"));
    }
}
