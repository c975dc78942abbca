//! Session Client (C2) — spec §4.7, §6 "Bridge HTTP API".
//!
//! The trait gives the rest of the pipeline a stateless façade over the
//! Bridge, grounded the way `sem_os_client::SemOsClient` / `HttpClient`
//! split trait from reqwest-backed impl in the example pack. Retries live
//! in [`retry_with_backoff`], grounded on spec §4.7/§7's bounded backoff
//! policy (SPEC_FULL.md §4.7 ADDED): base 200ms, factor 2, 5 attempts,
//! ±20% jitter; a non-2xx response in the 4xx range other than 429 is
//! treated as non-transient and not retried.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn sign_in(&self) -> anyhow::Result<()>;
    async fn sign_out(&self) -> anyhow::Result<()>;
    async fn decide_job(&self, identifier: &str, conf: &serde_json::Value) -> anyhow::Result<()>;
    async fn schedule_task(
        &self,
        descriptor_json: &serde_json::Value,
        files_archive: &[u8],
    ) -> anyhow::Result<String>;
    async fn get_task_status(&self, task_id: &str) -> anyhow::Result<String>;
    async fn get_tasks_statuses(&self) -> anyhow::Result<Vec<TaskStatusEntry>>;
    async fn get_task_error(&self, task_id: &str) -> anyhow::Result<String>;
    async fn download_decision(&self, task_id: &str) -> anyhow::Result<Vec<u8>>;
    async fn remove_task(&self, task_id: &str) -> anyhow::Result<()>;
    async fn upload_report(
        &self,
        report_json: &serde_json::Value,
        archive: Option<&[u8]>,
    ) -> anyhow::Result<()>;
}

pub struct HttpSessionClient {
    base_url: String,
    login: String,
    password: String,
    client: reqwest::Client,
}

impl HttpSessionClient {
    pub fn new(base_url: impl Into<String>, login: impl Into<String>, password: impl Into<String>) -> Self {
        HttpSessionClient {
            base_url: base_url.into(),
            login: login.into(),
            password: password.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Runs `op` with bounded exponential backoff. Retries only on transport
/// errors or a 5xx/429 status; any other 4xx is surfaced immediately as
/// non-transient.
pub async fn retry_with_backoff<T, F, Fut>(mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RetryableError>>,
{
    const BASE: Duration = Duration::from_millis(200);
    const FACTOR: u32 = 2;
    const MAX_ATTEMPTS: u32 = 5;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryableError::Fatal(err)) => return Err(err),
            Err(RetryableError::Transient(err)) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(PipelineError::RemoteTransportError {
                        attempts: attempt,
                        source: err,
                    }
                    .into());
                }
                let backoff = BASE * FACTOR.pow(attempt - 1);
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                let wait = backoff.mul_f64(jitter);
                tokio::time::sleep(wait).await;
            }
        }
    }
}

pub enum RetryableError {
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

fn classify_status(status: StatusCode, body: String) -> RetryableError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryableError::Transient(anyhow::anyhow!("bridge HTTP {status}: {body}"))
    } else {
        RetryableError::Fatal(anyhow::anyhow!("bridge HTTP {status}: {body}"))
    }
}

#[async_trait]
impl SessionClient for HttpSessionClient {
    async fn sign_in(&self) -> anyhow::Result<()> {
        retry_with_backoff(|| async {
            let resp = self
                .client
                .post(self.url("/service/signin/"))
                .json(&serde_json::json!({"username": self.login, "password": self.password}))
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            Ok(())
        })
        .await
    }

    async fn sign_out(&self) -> anyhow::Result<()> {
        retry_with_backoff(|| async {
            let resp = self
                .client
                .post(self.url("/service/signout/"))
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            Ok(())
        })
        .await
    }

    async fn decide_job(&self, identifier: &str, conf: &serde_json::Value) -> anyhow::Result<()> {
        retry_with_backoff(|| async {
            let resp = self
                .client
                .post(self.url(&format!("/service/decide/job/{identifier}/")))
                .json(conf)
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            Ok(())
        })
        .await
    }

    async fn schedule_task(
        &self,
        descriptor_json: &serde_json::Value,
        files_archive: &[u8],
    ) -> anyhow::Result<String> {
        let part = reqwest::multipart::Part::bytes(files_archive.to_vec()).file_name("task files.zip");
        let form = reqwest::multipart::Form::new()
            .text("description", descriptor_json.to_string())
            .part("archive", part);

        retry_with_backoff(|| async {
            let form = form
                .try_clone()
                .expect("multipart form with in-memory parts is always clonable");
            let resp = self
                .client
                .post(self.url("/service/schedule/task/"))
                .multipart(form)
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            let value: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| RetryableError::Fatal(e.into()))?;
            let id = value
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| RetryableError::Fatal(anyhow::anyhow!("schedule_task: missing id in response")))?
                .to_string();
            Ok(id)
        })
        .await
    }

    async fn get_task_status(&self, task_id: &str) -> anyhow::Result<String> {
        let entries = self.get_tasks_statuses().await?;
        entries
            .into_iter()
            .find(|entry| entry.id == task_id)
            .map(|entry| entry.status)
            .ok_or_else(|| anyhow::anyhow!("no status reported for task {task_id}"))
    }

    async fn get_tasks_statuses(&self) -> anyhow::Result<Vec<TaskStatusEntry>> {
        retry_with_backoff(|| async {
            let resp = self
                .client
                .get(self.url("/service/tasks/statuses/"))
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            resp.json::<Vec<TaskStatusEntry>>()
                .await
                .map_err(|e| RetryableError::Fatal(e.into()))
        })
        .await
    }

    async fn get_task_error(&self, task_id: &str) -> anyhow::Result<String> {
        retry_with_backoff(|| async {
            let resp = self
                .client
                .get(self.url(&format!("/service/task/{task_id}/error/")))
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            resp.text().await.map_err(|e| RetryableError::Fatal(e.into()))
        })
        .await
    }

    async fn download_decision(&self, task_id: &str) -> anyhow::Result<Vec<u8>> {
        retry_with_backoff(|| async {
            let resp = self
                .client
                .get(self.url(&format!("/service/task/{task_id}/decision/")))
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            resp.bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| RetryableError::Fatal(e.into()))
        })
        .await
    }

    async fn remove_task(&self, task_id: &str) -> anyhow::Result<()> {
        retry_with_backoff(|| async {
            let resp = self
                .client
                .delete(self.url(&format!("/service/task/{task_id}/")))
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            Ok(())
        })
        .await
    }

    async fn upload_report(
        &self,
        report_json: &serde_json::Value,
        archive: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        retry_with_backoff(|| async {
            let mut form = reqwest::multipart::Form::new().text("report", report_json.to_string());
            if let Some(bytes) = archive {
                form = form.part(
                    "archive",
                    reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("report files.zip"),
                );
            }
            let resp = self
                .client
                .post(self.url("/service/upload/report/"))
                .multipart(form)
                .send()
                .await
                .map_err(|e| RetryableError::Transient(e.into()))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryableError::Transient(anyhow::anyhow!("timeout"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn retry_with_backoff_does_not_retry_fatal_errors() {
        let attempts = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryableError::Fatal(anyhow::anyhow!("bad request"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
