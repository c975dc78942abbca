//! Result Worker Pool (C6) — spec §4.4.
//!
//! Grounded on `VRP.__loop_worker` (pool shell: take an element, spawn an
//! `RP`-equivalent task, write the final solution triple, forward on
//! `processed`) and `RP.process_finished_task` /
//! `RP.process_single_verdict` / `RP.process_failed_task` (per-element
//! verdict dispatch), all in `klever/core/vrp/__init__.py`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytesize::ByteSize;
use futures::future::join_all;
use itertools::Itertools;
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::SessionClient;
use crate::config::CoverageDetails;
use crate::coverage;
use crate::error::PipelineError;
use crate::poller::{ProcessingItem, TaskOutcome};
use crate::queue::{Item, Receiver, Sender};
use crate::registry::{SolutionTriple, TripleRegistry};
use crate::report::{Report, ReportKind, ReportSink};
use crate::supervisor::StopToken;
use crate::task::TaskDescriptor;
use crate::witness;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Unsafe,
    Unknown,
    NonVerifierUnknown,
}

impl Verdict {
    /// Status string a validation-mode sub-job records alongside the
    /// ideal verdict (SPEC_FULL.md "Job/sub-job cascade").
    pub fn as_status_str(&self) -> &'static str {
        match self {
            Verdict::Safe => "safe",
            Verdict::Unsafe => "unsafe",
            Verdict::Unknown => "unknown",
            Verdict::NonVerifierUnknown => "non-verifier unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedTask {
    pub descriptor: TaskDescriptor,
    pub triple: SolutionTriple,
    pub verdict: Verdict,
}

/// Parsed contents of `decision results.json` inside the decision
/// archive (spec §6 "Decision archive").
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DecisionResults {
    pub status: Option<String>,
    pub resources: DecisionResources,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DecisionResources {
    #[serde(rename = "wall time")]
    pub wall_time: u64,
    #[serde(rename = "CPU time")]
    pub cpu_time: u64,
    #[serde(rename = "memory size")]
    pub memory_size: u64,
}

pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub code_coverage_details: CoverageDetails,
    pub source_trees: Vec<PathBuf>,
    pub build_base: PathBuf,
    pub sub_job_identifier: String,
    pub main_working_directory: PathBuf,
    /// Spec §6 "upload verifier input files" / "upload input files of
    /// static verifiers": gate whether the verification-start report
    /// attaches a task-input archive (§4.4 step 3c).
    pub upload_verifier_input_files: bool,
    pub upload_input_files_of_static_verifiers: bool,
    /// Identity of this job's source snapshot (spec §4.4 step 3c
    /// "original-sources fingerprint"). The snapshot itself is produced by
    /// the C preprocessing front end (out of scope, spec §1); the core
    /// mints one UUID per run and threads it through every fingerprint it
    /// emits, the way `Core.conf['sys_id']`-style run identifiers are
    /// assigned once at startup in the original sources.
    pub build_base_uuid: Uuid,
}

pub struct ResultWorkerPool {
    session: Arc<dyn SessionClient>,
    registry: Arc<TripleRegistry>,
    config: Arc<WorkerPoolConfig>,
}

impl ResultWorkerPool {
    pub fn new(
        session: Arc<dyn SessionClient>,
        registry: Arc<TripleRegistry>,
        config: Arc<WorkerPoolConfig>,
    ) -> Self {
        ResultWorkerPool {
            session,
            registry,
            config,
        }
    }

    /// Spec §4.4 pool shell: `loop { take; if sentinel exit; process;
    /// write triple; emit on processed }`, run by `worker_count`
    /// concurrent consumers sharing one `processing` queue — the
    /// in-process analogue of N OS processes all calling
    /// `queue.get()` on the same `processing tasks` queue.
    pub async fn run(
        &self,
        processing: Receiver<ProcessingItem>,
        processed: Sender<ProcessedTask>,
        reports: ReportSink,
        stop: StopToken,
    ) -> anyhow::Result<()> {
        let processing = Arc::new(Mutex::new(processing));

        let results = join_all((0..self.config.worker_count).map(|_| {
            let processing = processing.clone();
            let processed = processed.clone();
            let reports = reports.clone();
            let stop = stop.clone();
            async move { self.worker_loop(processing, processed, reports, stop).await }
        }))
        .await;

        results.into_iter().collect::<anyhow::Result<Vec<()>>>()?;
        Ok(())
    }

    async fn worker_loop(
        &self,
        processing: Arc<Mutex<Receiver<ProcessingItem>>>,
        processed: Sender<ProcessedTask>,
        reports: ReportSink,
        stop: StopToken,
    ) -> anyhow::Result<()> {
        loop {
            if stop.is_stopped() {
                warn!("worker observed stop signal, terminating");
                return Err(PipelineError::TerminationError {
                    component: "worker".to_string(),
                }
                .into());
            }

            let item = {
                let mut guard = processing.lock().await;
                match guard.get().await {
                    None | Some(Item::End) => break,
                    Some(Item::Value(item)) => item,
                }
            };

            let key = item.descriptor.triple_key();
            self.registry.insert(&key).await;

            let outcome = self.process_element(&item, &key, &reports).await;

            let triple = self.registry.take(&key).await;

            let verdict = match outcome {
                Ok(v) => v,
                Err(ref err) => {
                    warn!("task {} processing failed: {err}", item.descriptor.task_id);
                    Verdict::NonVerifierUnknown
                }
            };

            processed.put(ProcessedTask {
                descriptor: item.descriptor.clone(),
                triple,
                verdict: verdict.clone(),
            })?;

            if let Err(err) = outcome_as_result(outcome) {
                return Err(err);
            }
        }

        Ok(())
    }

    async fn process_element(
        &self,
        item: &ProcessingItem,
        key: &str,
        reports: &ReportSink,
    ) -> anyhow::Result<Verdict> {
        let element_id = format!(
            "RP/{}/{}/{}",
            item.descriptor.program_fragment.id, item.descriptor.spec.envmodel_attrs, item.descriptor.spec.id
        );

        reports.emit(
            Report::new(ReportKind::Patch, element_id.clone(), None).with_attrs(json!({
                "program fragment": item.descriptor.program_fragment.id,
                "requirement": item.descriptor.spec.id,
                "environment model": item.descriptor.spec.envmodel_attrs,
            })),
        )?;

        match item.outcome {
            TaskOutcome::Error => {
                let message = self.session.get_task_error(&item.descriptor.task_id).await?;
                reports.emit(
                    Report::new(ReportKind::Unknown, format!("{element_id}/"), Some(element_id.clone()))
                        .with_attrs(json!({"problem_description": message})),
                )?;
                if let Err(err) = self.session.remove_task(&item.descriptor.task_id).await {
                    warn!("failed to remove task {} from remote: {err}", item.descriptor.task_id);
                }
                Err(PipelineError::RemoteTaskError {
                    task_id: item.descriptor.task_id.clone(),
                    message,
                }
                .into())
            }
            TaskOutcome::Finished => {
                self.process_finished_task(item, &element_id, key, reports).await
            }
        }
    }

    async fn process_finished_task(
        &self,
        item: &ProcessingItem,
        element_id: &str,
        key: &str,
        reports: &ReportSink,
    ) -> anyhow::Result<Verdict> {
        let archive_bytes = self.session.download_decision(&item.descriptor.task_id).await?;
        let workdir = tempfile::tempdir()?;
        extract_zip(&archive_bytes, workdir.path())?;

        let decision_json = std::fs::read_to_string(workdir.path().join("decision results.json"))?;
        let decision: DecisionResults = serde_json::from_str(&decision_json)?;

        let output_dir = workdir.path().join("output");
        let status = parse_benchexec_status(&output_dir)?;

        self.registry
            .update(key, |triple| {
                triple.resources_measured = Some(json!({
                    "wall time": decision.resources.wall_time,
                    "CPU time": decision.resources.cpu_time,
                    "memory size": decision.resources.memory_size,
                }));
            })
            .await;

        let verification_id = format!("{element_id}/{}", item.descriptor.verifier);
        let fingerprint = self.original_sources_fingerprint(item);
        info!(
            "task {} finished: wall {}, cpu {}, {}",
            item.descriptor.task_id,
            humantime::format_duration(std::time::Duration::from_secs(decision.resources.wall_time)),
            humantime::format_duration(std::time::Duration::from_secs(decision.resources.cpu_time)),
            ByteSize(decision.resources.memory_size),
        );

        // §4.4 step 3c: verification-start must include the log file and,
        // when configured, a task-input archive. Both live inside
        // `workdir`, which is dropped at the end of this function, so they
        // are copied out to a location that survives until the uploader
        // reads them asynchronously later.
        let attachments_dir = tempfile::tempdir()?.into_path();
        let log_file = find_single_log_file(&output_dir)?;
        let persisted_log = attachments_dir.join("log.txt");
        std::fs::copy(&log_file, &persisted_log)?;

        let upload_task_input =
            self.config.upload_verifier_input_files || self.config.upload_input_files_of_static_verifiers;
        let persisted_task_input = if upload_task_input {
            find_task_input_file(workdir.path()).map(|src| {
                let dest = attachments_dir.join("task input.xml");
                std::fs::copy(&src, &dest).map(|_| dest)
            })
        } else {
            None
        };

        let mut verification_report =
            Report::new(ReportKind::Verification, verification_id.clone(), Some(element_id.to_string()))
                .with_attrs(json!({
                    "component": item.descriptor.verifier,
                    "wall_time": decision.resources.wall_time,
                    "cpu_time": decision.resources.cpu_time,
                    "memory": decision.resources.memory_size,
                    "original sources": fingerprint,
                }))
                .with_file(persisted_log, Some("log.txt".to_string()));
        if let Some(result) = persisted_task_input {
            let path = result?;
            verification_report = verification_report.with_file(path, Some("task input.xml".to_string()));
        }
        reports.emit(verification_report)?;

        let witnesses = find_witnesses(&output_dir)?;

        let verdict_result = self
            .process_single_verdict(item, &verification_id, &status, &witnesses, &output_dir, &log_file, key, reports)
            .await;

        reports.emit(Report::new(ReportKind::VerificationFinish, verification_id, Some(element_id.to_string())))?;

        let verdict = verdict_result?;

        if !matches!(self.config.code_coverage_details, CoverageDetails::None) {
            if let Err(err) = self.assemble_coverage(item, &witnesses, &output_dir, key).await {
                if verdict != Verdict::Unknown {
                    return Err(err);
                }
                warn!("coverage assembly failed for {}: {err}", item.descriptor.task_id);
            }
        }

        if let Err(err) = self.session.remove_task(&item.descriptor.task_id).await {
            warn!("failed to remove task {} from remote: {err}", item.descriptor.task_id);
        }

        Ok(verdict)
    }

    async fn process_single_verdict(
        &self,
        item: &ProcessingItem,
        verification_id: &str,
        status: &str,
        witnesses: &[PathBuf],
        output_dir: &Path,
        log_file: &Path,
        key: &str,
        reports: &ReportSink,
    ) -> anyhow::Result<Verdict> {
        let true_re = Regex::new("true").unwrap();
        let false_re = Regex::new("false").unwrap();

        if true_re.is_match(status) {
            reports.emit(Report::new(ReportKind::Safe, format!("{verification_id}/"), Some(verification_id.to_string())))?;
            return Ok(Verdict::Safe);
        }

        if false_re.is_match(status) {
            if item.descriptor.options.expect_several_witnesses {
                let mut first_error = None;
                for (idx, witness_path) in witnesses.iter().enumerate() {
                    let ordinal = idx + 1;
                    match self.emit_unsafe_report(item, verification_id, witness_path, Some(ordinal), reports) {
                        Ok(()) => {}
                        Err(e) => {
                            warn!("failed to process witness {}: {e}", witness_path.display());
                            first_error.get_or_insert(e);
                        }
                    }
                }
                return if first_error.is_some() {
                    Ok(Verdict::NonVerifierUnknown)
                } else {
                    Ok(Verdict::Unsafe)
                };
            }

            if witnesses.len() != 1 {
                return Err(anyhow::anyhow!(
                    "just one witness is supported (but {} are given)",
                    witnesses.len()
                ));
            }
            self.emit_unsafe_report(item, verification_id, &witnesses[0], None, reports)?;
            return Ok(Verdict::Unsafe);
        }

        // Anything else: unknown. OOM/TIMEOUT record a termination reason;
        // other unrecognized statuses link the verifier log instead.
        if status == "OUT OF MEMORY" || status == "TIMEOUT" {
            let msg = if status == "OUT OF MEMORY" {
                "memory exhausted"
            } else {
                "CPU time exhausted"
            };
            self.registry
                .update(key, |triple| triple.termination_reason = Some(status.to_string()))
                .await;
            reports.emit(
                Report::new(ReportKind::Unknown, format!("{verification_id}/"), Some(verification_id.to_string()))
                    .with_attrs(json!({"problem_description": msg})),
            )?;
        } else {
            reports.emit(
                Report::new(ReportKind::Unknown, format!("{verification_id}/"), Some(verification_id.to_string()))
                    .with_attrs(json!({"problem_description_symlink": log_file.display().to_string()})),
            )?;
        }
        Ok(Verdict::Unknown)
    }

    fn emit_unsafe_report(
        &self,
        item: &ProcessingItem,
        verification_id: &str,
        witness_path: &Path,
        ordinal: Option<usize>,
        reports: &ReportSink,
    ) -> anyhow::Result<()> {
        let trace = witness::process_witness(
            witness_path,
            &self.config.build_base,
            &self.config.build_base,
            &self.config.source_trees,
            &item.source_paths,
        )?;
        let identifier = match ordinal {
            Some(n) => format!("{verification_id}/{n}"),
            None => format!("{verification_id}/"),
        };

        // `into_path()` leaks the directory instead of removing it on drop:
        // the uploader reads this file later, asynchronously, so it must
        // outlive this function's scope.
        let trace_dir = tempfile::tempdir()?.into_path();
        let trace_path = trace_dir.join("error trace.json");
        std::fs::write(&trace_path, serde_json::to_vec(&trace)?)?;

        reports.emit(
            Report::new(ReportKind::Unsafe, identifier, Some(verification_id.to_string()))
                .with_attrs(json!({
                    "edges": trace.edges.len(),
                    "violation path edges": trace.violation_path.len(),
                    "task_id": item.descriptor.task_id,
                }))
                .with_file(trace_path, Some("error trace.json".to_string())),
        )?;
        Ok(())
    }

    /// Spec §4.4 step 3c: `<build-base UUID>-<12 hex chars of a metadata
    /// checksum>`, identifying the source snapshot a verification ran
    /// against. The checksum covers the program fragment's file manifest
    /// plus the requirement id, the only per-task metadata this core
    /// itself holds (the fragment's actual content hash is the C
    /// preprocessing front end's concern, out of scope per spec §1).
    fn original_sources_fingerprint(&self, item: &ProcessingItem) -> String {
        let mut hasher = Sha256::new();
        hasher.update(item.descriptor.program_fragment.id.as_bytes());
        for file in &item.descriptor.program_fragment.files {
            hasher.update(file.as_bytes());
        }
        hasher.update(item.descriptor.spec.id.as_bytes());
        let digest = hasher.finalize();
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        format!("{}-{}", self.config.build_base_uuid, &hex[..12])
    }

    async fn assemble_coverage(
        &self,
        item: &ProcessingItem,
        witnesses: &[PathBuf],
        output_dir: &Path,
        _key: &str,
    ) -> anyhow::Result<()> {
        let coverage_file = coverage::select_coverage_file(output_dir, witnesses.len())?;
        let lcov_text = std::fs::read_to_string(&coverage_file)?;
        let report = coverage::assemble_lcov(&lcov_text, &self.config.build_base, &self.config.source_trees)?;

        let coverage_dir = self
            .config
            .main_working_directory
            .join("total coverages")
            .join(&self.config.sub_job_identifier)
            .join(item.descriptor.spec.id.replace('/', "-"));
        std::fs::create_dir_all(&coverage_dir)?;
        let out_path = coverage_dir.join(format!("{}_coverage_info.json", item.descriptor.task_id.replace('/', "-")));
        std::fs::write(out_path, serde_json::to_vec(&report)?)?;
        Ok(())
    }
}

fn outcome_as_result(outcome: anyhow::Result<Verdict>) -> anyhow::Result<()> {
    outcome.map(|_| ())
}

fn extract_zip(bytes: &[u8], dest: &Path) -> anyhow::Result<()> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)?;
    archive.extract(dest)?;
    Ok(())
}

fn find_witnesses(output_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if output_dir.is_dir() {
        for entry in std::fs::read_dir(output_dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("witness.") && name.ends_with(".graphml") {
                    found.push(path);
                }
            }
        }
    }
    // Ordinal suffixes (spec §4.4 step 3d "expect several witnesses") must
    // be assigned in a stable order across runs.
    found = found.into_iter().sorted().collect();
    Ok(found)
}

/// Locates the BenchExec benchmark-definition XML directly under
/// `workdir` (as opposed to the `*.results.xml` report under `output/`),
/// used as the optional task-input attachment gated by `upload verifier
/// input files` / `upload input files of static verifiers` (spec §6).
fn find_task_input_file(workdir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(workdir).ok()?.filter_map(|e| e.ok()).map(|e| e.path()).find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(".xml") && !n.ends_with(".results.xml"))
            .unwrap_or(false)
    })
}

fn find_single_log_file(output_dir: &Path) -> anyhow::Result<PathBuf> {
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("benchmark") && name.ends_with("logfiles") {
                    let mut logs: Vec<PathBuf> = std::fs::read_dir(&path)?
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .collect();
                    if logs.len() != 1 {
                        return Err(anyhow::anyhow!(
                            "exactly one log file should be outputted, found {}",
                            logs.len()
                        ));
                    }
                    return Ok(logs.remove(0));
                }
            }
        }
    }
    Err(anyhow::anyhow!("no benchmark logfiles directory found under {}", output_dir.display()))
}

/// Parses the single `*.results.xml` BenchExec report for the `status`
/// column (spec §4.4 step 3b).
fn parse_benchexec_status(output_dir: &Path) -> anyhow::Result<String> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(output_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with(".results.xml")).unwrap_or(false))
        .collect();
    if candidates.len() != 1 {
        return Err(PipelineError::ComponentInternalError {
            component: "result worker".to_string(),
            reason: format!(
                "expected strictly single BenchExec XML report file under {}, found {}",
                output_dir.display(),
                candidates.len()
            ),
        }
        .into());
    }
    let xml = std::fs::read_to_string(candidates.remove(0))?;

    let mut reader = quick_xml::Reader::from_str(&xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut in_status_column = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Empty(e)) | Ok(quick_xml::events::Event::Start(e)) => {
                if e.name().as_ref() == b"column" {
                    let is_status = e
                        .attributes()
                        .flatten()
                        .any(|a| a.key.as_ref() == b"title" && a.unescape_value().map(|v| v == "status").unwrap_or(false));
                    if is_status {
                        if let Some(value) = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"value")
                            .and_then(|a| a.unescape_value().ok())
                        {
                            return Ok(value.to_string());
                        }
                        in_status_column = true;
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            _ => {}
        }
        buf.clear();
    }
    let _ = in_status_column;
    Err(anyhow::anyhow!("no solution status found in BenchExec XML report"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_benchexec_status_reads_value_attribute() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("foo.results.xml"),
            r#"<result><run><column title="status" value="true"/></run></result>"#,
        )
        .unwrap();
        let status = parse_benchexec_status(tmp.path()).unwrap();
        assert_eq!(status, "true");
    }

    #[test]
    fn find_witnesses_sorts_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("witness.b.graphml"), "").unwrap();
        std::fs::write(tmp.path().join("witness.a.graphml"), "").unwrap();
        let found = find_witnesses(tmp.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].to_string_lossy().contains("witness.a"));
    }
}
