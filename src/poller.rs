//! Task Poller (C5) — spec §4.3.
//!
//! Grounded on `VRP.__result_processing` (`klever/core/vrp/__init__.py`):
//! drain the `pending` queue with a short timeout, poll
//! `session.get_tasks_statuses()` once per cycle, multiplex finished/error
//! tasks onto `processing`, and close with one sentinel per worker once
//! both the producer and the in-flight map have drained.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::SessionClient;
use crate::error::PipelineError;
use crate::queue::{Item, Receiver, Sender};
use crate::supervisor::StopToken;
use crate::task::TaskDescriptor;

pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(1);
pub const SOLUTION_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Finished,
    Error,
}

#[derive(Debug, Clone)]
pub struct ProcessingItem {
    pub outcome: TaskOutcome,
    pub descriptor: TaskDescriptor,
    pub attempt: u32,
    pub source_paths: Vec<PathBuf>,
}

pub struct TaskPoller {
    session: Arc<dyn SessionClient>,
    worker_count: usize,
    source_paths: Vec<PathBuf>,
}

impl TaskPoller {
    pub fn new(session: Arc<dyn SessionClient>, worker_count: usize, source_paths: Vec<PathBuf>) -> Self {
        TaskPoller {
            session,
            worker_count,
            source_paths,
        }
    }

    /// Runs the poll loop to completion: drains `pending` until the
    /// sentinel arrives, polls the bridge for status until the in-flight
    /// map is empty, then emits one sentinel per worker on `processing`
    /// and returns.
    pub async fn run(
        &self,
        mut pending: Receiver<TaskDescriptor>,
        processing: Sender<ProcessingItem>,
        stop: StopToken,
    ) -> anyhow::Result<()> {
        let mut in_flight: HashMap<String, (TaskDescriptor, u32)> = HashMap::new();
        let mut receiving = true;

        loop {
            if stop.is_stopped() {
                warn!("poller observed stop signal, terminating");
                return Err(PipelineError::TerminationError {
                    component: "poller".to_string(),
                }
                .into());
            }

            if receiving {
                let items = if !in_flight.is_empty() {
                    pending.drain_available()
                } else {
                    match pending.get_waiting(GENERATION_TIMEOUT).await {
                        Some(item) => vec![item],
                        None => Vec::new(),
                    }
                };

                for item in items {
                    match item {
                        Item::End => {
                            receiving = false;
                            info!("expect no further tasks to be generated");
                        }
                        Item::Value(descriptor) => {
                            let key = descriptor.task_id.clone();
                            in_flight.insert(key, (descriptor, 0));
                        }
                    }
                }
            }

            if !in_flight.is_empty() {
                let statuses = self.session.get_tasks_statuses().await?;
                for entry in statuses {
                    let Some((descriptor, attempt)) = in_flight.get(&entry.id) else {
                        continue;
                    };
                    match entry.status.as_str() {
                        "FINISHED" => {
                            let (descriptor, attempt) = in_flight.remove(&entry.id).unwrap();
                            processing.put(ProcessingItem {
                                outcome: TaskOutcome::Finished,
                                descriptor,
                                attempt,
                                source_paths: self.source_paths.clone(),
                            })?;
                        }
                        "ERROR" => {
                            let (descriptor, attempt) = in_flight.remove(&entry.id).unwrap();
                            processing.put(ProcessingItem {
                                outcome: TaskOutcome::Error,
                                descriptor,
                                attempt,
                                source_paths: self.source_paths.clone(),
                            })?;
                        }
                        "PENDING" | "PROCESSING" => {
                            let _ = (descriptor, attempt);
                        }
                        other => {
                            return Err(anyhow::anyhow!("unknown task status {other:?}"));
                        }
                    }
                }
            }

            if !receiving && in_flight.is_empty() {
                processing.close_n(self.worker_count)?;
                debug!("shutting down result processing gracefully");
                break;
            }

            tokio::time::sleep(SOLUTION_TIMEOUT).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TaskStatusEntry;
    use crate::queue;
    use crate::task::{ProgramFragment, RequirementSpec, TaskOptions};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeSession {
        statuses: Mutex<Vec<Vec<TaskStatusEntry>>>,
    }

    #[async_trait]
    impl SessionClient for FakeSession {
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
        async fn get_tasks_statuses(&self) -> anyhow::Result<Vec<TaskStatusEntry>> {
            let mut guard = self.statuses.lock().unwrap();
            if guard.is_empty() {
                Ok(vec![])
            } else {
                Ok(guard.remove(0))
            }
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
        async fn upload_report(&self, _: &serde_json::Value, _: Option<&[u8]>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn descriptor(id: &str) -> TaskDescriptor {
        TaskDescriptor {
            task_id: id.into(),
            spec: RequirementSpec {
                id: "req".into(),
                envmodel_attrs: serde_json::Value::Null,
                class_tag: "linux".into(),
            },
            options: TaskOptions::default(),
            program_fragment: ProgramFragment {
                id: "pf".into(),
                files: vec![],
            },
            verifier: "cpachecker".into(),
            additional_sources: vec![],
            task_files: vec![],
        }
    }

    #[tokio::test]
    async fn emits_finished_then_n_sentinels() {
        let session = Arc::new(FakeSession {
            statuses: Mutex::new(vec![vec![TaskStatusEntry {
                id: "t1".into(),
                status: "FINISHED".into(),
            }]]),
        });
        let poller = TaskPoller::new(session, 2, vec![]);

        let (pending_tx, pending_rx) = queue::channel::<TaskDescriptor>();
        let (proc_tx, mut proc_rx) = queue::channel::<ProcessingItem>();

        pending_tx.put(descriptor("t1")).unwrap();
        pending_tx.close_one().unwrap();
        drop(pending_tx);

        let (_stop_signal, stop_token) = crate::supervisor::StopSignal::new();
        poller.run(pending_rx, proc_tx, stop_token).await.unwrap();

        let first = proc_rx.get().await.unwrap().into_value().unwrap();
        assert!(matches!(first.outcome, TaskOutcome::Finished));
        assert_eq!(first.descriptor.task_id, "t1");

        for _ in 0..2 {
            assert!(matches!(proc_rx.get().await, Some(Item::End)));
        }
    }
}
