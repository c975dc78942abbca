//! Report Uploader (C1) — spec §4.6.
//!
//! Grounded on `Core.send_reports` (`core/core/core.py`): a single
//! consumer draining the `report files` queue, forwarding each report to
//! the Bridge and exiting non-zero on the first transport failure so the
//! supervisor can cancel siblings.

use std::sync::Arc;

use tracing::{error, info};

use crate::bridge::SessionClient;
use crate::error::PipelineError;
use crate::queue::{Item, Receiver};
use crate::report::Report;
use crate::supervisor::StopToken;

pub struct ReportUploader {
    session: Arc<dyn SessionClient>,
}

impl ReportUploader {
    pub fn new(session: Arc<dyn SessionClient>) -> Self {
        ReportUploader { session }
    }

    /// Drains `reports` until the sentinel, uploading each report in
    /// enqueue order (FIFO, preserving the parent-before-child invariant
    /// from spec §3/§8). Returns `Err` on the first transport failure;
    /// the caller (supervisor) treats that as the uploader's non-zero
    /// exit.
    pub async fn run(&self, mut reports: Receiver<Report>, stop: StopToken) -> anyhow::Result<()> {
        loop {
            if stop.is_stopped() {
                error!("report uploader observed stop signal, terminating");
                return Err(PipelineError::TerminationError {
                    component: "uploader".to_string(),
                }
                .into());
            }

            match reports.get().await {
                None | Some(Item::End) => {
                    info!("report uploader finished draining queue");
                    return Ok(());
                }
                Some(Item::Value(report)) => {
                    let report_json = serde_json::to_value(&report)?;
                    let archive = if report.files.is_empty() {
                        None
                    } else {
                        Some(archive_report_files(&report)?)
                    };
                    if let Err(err) = self
                        .session
                        .upload_report(&report_json, archive.as_deref())
                        .await
                    {
                        error!("report upload failed for {}: {err}", report.identifier);
                        return Err(err);
                    }
                }
            }
        }
    }
}

fn archive_report_files(report: &Report) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buf);
        let mut zip = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::default();
        for file in &report.files {
            let name = file
                .arcname
                .clone()
                .or_else(|| file.path.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "file".to_string());
            zip.start_file(name, options)?;
            let contents = std::fs::read(&file.path)?;
            std::io::Write::write_all(&mut zip, &contents)?;
        }
        zip.finish()?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::report::ReportKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingSession {
        uploaded: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl SessionClient for RecordingSession {
        async fn sign_in(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn sign_out(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn decide_job(&self, _: &str, _: &serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
        async fn schedule_task(&self, _: &serde_json::Value, _: &[u8]) -> anyhow::Result<String> {
            Ok("t".into())
        }
        async fn get_task_status(&self, _: &str) -> anyhow::Result<String> {
            Ok("FINISHED".into())
        }
        async fn get_tasks_statuses(&self) -> anyhow::Result<Vec<crate::bridge::TaskStatusEntry>> {
            Ok(vec![])
        }
        async fn get_task_error(&self, _: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn download_decision(&self, _: &str) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn remove_task(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn upload_report(
            &self,
            report_json: &serde_json::Value,
            _archive: Option<&[u8]>,
        ) -> anyhow::Result<()> {
            let id = report_json.get("identifier").and_then(|v| v.as_str()).unwrap();
            if self.fail_on.as_deref() == Some(id) {
                return Err(anyhow::anyhow!("simulated transport failure"));
            }
            self.uploaded.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_reports_in_fifo_order() {
        let session = Arc::new(RecordingSession {
            uploaded: Mutex::new(vec![]),
            fail_on: None,
        });
        let uploader = ReportUploader::new(session.clone());

        let (tx, rx) = queue::channel::<Report>();
        tx.put(Report::new(ReportKind::Start, "job", None)).unwrap();
        tx.put(Report::new(ReportKind::Verification, "V", Some("job".into())))
            .unwrap();
        tx.close_one().unwrap();

        let (_stop_signal, stop_token) = crate::supervisor::StopSignal::new();
        uploader.run(rx, stop_token).await.unwrap();
        let uploaded = session.uploaded.lock().unwrap();
        assert_eq!(*uploaded, vec!["job".to_string(), "V".to_string()]);
    }

    #[tokio::test]
    async fn stops_and_errors_on_first_transport_failure() {
        let session = Arc::new(RecordingSession {
            uploaded: Mutex::new(vec![]),
            fail_on: Some("V".to_string()),
        });
        let uploader = ReportUploader::new(session.clone());

        let (tx, rx) = queue::channel::<Report>();
        tx.put(Report::new(ReportKind::Start, "job", None)).unwrap();
        tx.put(Report::new(ReportKind::Verification, "V", Some("job".into())))
            .unwrap();
        tx.put(Report::new(ReportKind::Finish, "job", None)).unwrap();
        tx.close_one().unwrap();

        let (_stop_signal, stop_token) = crate::supervisor::StopSignal::new();
        let result = uploader.run(rx, stop_token).await;
        assert!(result.is_err());
        assert_eq!(*session.uploaded.lock().unwrap(), vec!["job".to_string()]);
    }
}
