mod bridge;
mod cleanup;
mod cli;
mod config;
mod coverage;
mod error;
mod job;
mod poller;
mod queue;
mod registry;
mod report;
mod scheduler;
mod supervisor;
mod task;
mod uploader;
mod witness;
mod worker;

use std::sync::{Arc, Mutex};

use clap::Parser;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use crate::bridge::HttpSessionClient;
use crate::cli::{Cli, Command};
use crate::config::Configuration;
use crate::job::{Job, JobClass, SubJob, SubJobState, ValidationResults, ValidationRow};
use crate::poller::{ProcessingItem, TaskPoller};
use crate::queue;
use crate::registry::TripleRegistry;
use crate::report::{Report, ReportKind, ReportSink};
use crate::supervisor::{ComponentSupervisor, EventBus, StopToken};
use crate::task::TaskDescriptor;
use crate::uploader::ReportUploader;
use crate::worker::{ResultWorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Command::Run { conf_file } => run(conf_file).await,
    };

    std::process::exit(exit_code);
}

async fn run(conf_file: std::path::PathBuf) -> i32 {
    let conf = match Configuration::from_json_file(&conf_file).await {
        Ok(conf) => conf,
        Err(err) => {
            tracing::error!("failed to load configuration: {err}");
            return 1;
        }
    };

    let session: Arc<dyn bridge::SessionClient> = Arc::new(HttpSessionClient::new(
        conf.bridge().host().clone(),
        conf.bridge().login().clone(),
        conf.bridge().password().clone(),
    ));

    if let Err(err) = session.sign_in().await {
        tracing::error!("failed to sign in to bridge: {err}");
        return 1;
    }

    let (report_tx, report_rx) = queue::channel::<Report>();
    let reports = ReportSink::new(report_tx);

    if let Err(err) = reports.emit(Report::new(ReportKind::Start, conf.identifier().clone(), None)) {
        tracing::error!("failed to enqueue start report: {err}");
        return 1;
    }

    let registry = Arc::new(TripleRegistry::new());
    let supervisor = ComponentSupervisor::new();
    let stop_token = supervisor.stop_token();

    // The uploader is a single long-lived component spanning every
    // sub-job in the cascade below: its queue only closes once, at the
    // very end of the run (spec §4.6).
    let uploader = ReportUploader::new(session.clone());
    let uploader_stop = stop_token.clone();
    let uploader_handle = tokio::spawn(async move { uploader.run(report_rx, uploader_stop).await });
    let uploader_component = supervisor.track_uploader("uploader", uploader_handle);

    let mut job = Job::from_configuration(&conf);
    let is_validation = matches!(job.class, JobClass::Validation);

    let mut validation_results = ValidationResults::new();
    let mut cascade_failed = false;
    let mut first_error: Option<anyhow::Error> = None;

    for sub_job in &mut job.sub_jobs {
        if cascade_failed {
            tracing::warn!("aborting remaining sub-jobs after {} failed", sub_job.id);
            break;
        }

        let (outcome, statuses) = run_sub_job(
            sub_job,
            is_validation,
            &conf,
            &session,
            &registry,
            &reports,
            &supervisor,
            &stop_token,
            &uploader_component,
        )
        .await;

        match outcome {
            Ok(()) => {
                if is_validation {
                    validation_results.push(ValidationRow {
                        commit: sub_job
                            .id
                            .rsplit('/')
                            .next()
                            .unwrap_or(&sub_job.id)
                            .to_string(),
                        ideal_verdict: sub_job.ideal_verdict.clone().unwrap_or_default(),
                        obtained_statuses: statuses,
                        comment: sub_job.comment.clone(),
                    });
                }
            }
            Err(err) => {
                tracing::error!("sub-job {} failed: {err}", sub_job.id);
                cascade_failed = true;
                first_error.get_or_insert(err);
            }
        }

        if is_validation {
            if !validation_results.is_empty() {
                let rows = validation_results.take();
                let data = json!(rows
                    .iter()
                    .map(|row| {
                        json!({
                            "commit": row.commit,
                            "ideal verdict": row.ideal_verdict,
                            "obtained statuses": row.obtained_statuses,
                            "comment": row.comment,
                        })
                    })
                    .collect::<Vec<_>>());
                if let Err(err) = reports.emit(
                    Report::new(ReportKind::Data, format!("{}/data", sub_job.id), Some(sub_job.id.clone()))
                        .with_attrs(data),
                ) {
                    tracing::error!("failed to enqueue validation data report: {err}");
                }
            }
            if let Err(err) = reports.emit(Report::new(
                ReportKind::Finish,
                sub_job.id.clone(),
                Some(conf.identifier().clone()),
            )) {
                tracing::error!("failed to enqueue sub-job finish report: {err}");
            }
        }
    }

    if let Err(err) = reports.emit(Report::new(ReportKind::Finish, conf.identifier().clone(), None)) {
        tracing::error!("failed to enqueue finish report: {err}");
    }
    if let Err(err) = reports.close() {
        tracing::error!("failed to close report queue: {err}");
    }

    let result = supervisor.finish_uploader(uploader_component, Ok(())).await;
    let result = match (result, first_error) {
        (Ok(()), Some(err)) => Err(err),
        (result, _) => result,
    };

    let _ = session.sign_out().await;

    if let Err(err) = cleanup::run(&conf) {
        tracing::error!("working directory cleanup failed: {err}");
    }

    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("pipeline run failed: {err}");
            1
        }
    }
}

/// Decides one sub-job: builds a fresh queue set, launches the poller
/// and worker pool under the supervisor, drains the processed-task
/// stream collecting verdict strings for validation reporting, and waits
/// for the report queue to drain before the sub-job is considered
/// finished (spec §4.1 `launched -> draining -> finished`).
///
/// Mirrors the per-commit loop body in `Core.main`, which scopes a fresh
/// working directory and component set to each sub-job in turn.
#[allow(clippy::too_many_arguments)]
async fn run_sub_job(
    sub_job: &mut SubJob,
    is_validation: bool,
    conf: &Configuration,
    session: &Arc<dyn bridge::SessionClient>,
    registry: &Arc<TripleRegistry>,
    reports: &ReportSink,
    supervisor: &ComponentSupervisor,
    stop_token: &StopToken,
    uploader_component: &supervisor::ComponentHandle,
) -> (anyhow::Result<()>, Vec<String>) {
    if is_validation {
        if let Err(err) = reports.emit(Report::new(
            ReportKind::Start,
            sub_job.id.clone(),
            Some(conf.identifier().clone()),
        )) {
            sub_job.state = SubJobState::Failed;
            return (Err(err), Vec::new());
        }
    }

    let mut bus = EventBus::new();
    let attrs_reports = reports.clone();
    let attrs_sub_job_id = sub_job.id.clone();
    bus.register_after(
        "extract_common_prj_attrs",
        Box::new(move || {
            let reports = attrs_reports.clone();
            let sub_job_id = attrs_sub_job_id.clone();
            Box::pin(async move {
                reports.emit(
                    Report::new(ReportKind::Attrs, format!("{sub_job_id}/attrs"), Some(sub_job_id.clone()))
                        .with_attrs(json!({"sub-job": sub_job_id})),
                )
            })
        }),
    );
    if let Err(err) = bus.dispatch("extract_common_prj_attrs", || async { Ok(()) }).await {
        sub_job.state = SubJobState::Failed;
        return (Err(err), Vec::new());
    }

    let build_base = if is_validation {
        conf.working_directory().join(sub_job.id.rsplit('/').next().unwrap_or(&sub_job.id))
    } else {
        conf.working_directory().clone()
    };

    let worker_config = Arc::new(WorkerPoolConfig {
        worker_count: *conf.resource_limits().cpus_num() as usize,
        code_coverage_details: *conf.code_coverage_details(),
        source_trees: conf.working_source_trees().clone(),
        build_base,
        sub_job_identifier: sub_job.id.clone(),
        main_working_directory: conf.main_working_directory().clone(),
        build_base_uuid: uuid::Uuid::new_v4(),
        upload_verifier_input_files: *conf.upload_verifier_input_files(),
        upload_input_files_of_static_verifiers: *conf.upload_input_files_of_static_verifiers(),
    });

    let (pending_tx, pending_rx) = queue::channel::<TaskDescriptor>();
    // Task generation is an external collaborator (spec §1, out of
    // scope): the generator pipeline would feed `pending_tx` here. With
    // nothing upstream yet, close it immediately so the poller drains
    // cleanly.
    let _ = pending_tx.close_one();

    let (processing_tx, processing_rx) = queue::channel::<ProcessingItem>();
    let (processed_tx, processed_rx) = queue::channel::<worker::ProcessedTask>();

    let poller = TaskPoller::new(session.clone(), worker_config.worker_count, conf.working_source_trees().clone());
    let pool = ResultWorkerPool::new(session.clone(), registry.clone(), worker_config.clone());

    let poller_stop = stop_token.clone();
    let poller_handle = tokio::spawn(async move { poller.run(pending_rx, processing_tx, poller_stop).await });

    let pool_reports = reports.clone();
    let pool_stop = stop_token.clone();
    let pool_handle =
        tokio::spawn(async move { pool.run(processing_rx, processed_tx, pool_reports, pool_stop).await });

    let obtained_statuses = Arc::new(Mutex::new(Vec::<String>::new()));
    let consumer_statuses = obtained_statuses.clone();
    let consumer_handle = tokio::spawn(async move {
        processed_rx
            .into_stream()
            .for_each(|item| {
                if let queue::Item::Value(task) = item {
                    consumer_statuses.lock().unwrap().push(task.verdict.as_status_str().to_string());
                }
                async {}
            })
            .await;
        Ok::<(), anyhow::Error>(())
    });

    let components = supervisor.launch_all(vec![
        ("poller".to_string(), Box::pin(async move { poller_handle.await? })),
        ("worker_pool".to_string(), Box::pin(async move { pool_handle.await? })),
        ("processed_drain".to_string(), Box::pin(async move { consumer_handle.await? })),
    ]);
    sub_job.state = SubJobState::Launched;

    let dispatch_result = bus
        .dispatch("launch_all_components", move || async move {
            supervisor.wait_all(components, uploader_component).await
        })
        .await;
    sub_job.state = SubJobState::Draining;

    if dispatch_result.is_ok() && !uploader_component.handle.is_finished() {
        supervisor.await_drain(reports).await;
        sub_job.state = SubJobState::Finished;
    } else {
        sub_job.state = SubJobState::Failed;
    }

    let mut statuses = obtained_statuses.lock().unwrap().clone();
    if statuses.is_empty() {
        statuses.push("unknown".to_string());
    }

    (dispatch_result, statuses)
}
