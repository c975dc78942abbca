//! Job / sub-job data model (spec §3 "Job", §4.1 state machine,
//! SPEC_FULL.md §3 "Job/sub-job cascade").
//!
//! Grounded on `core.job.Job` and the sub-job loop in `Core.main`
//! (`core/core/core.py`): a Job owns an ordered list of sub-jobs built from
//! a common configuration merged with each sub-job's concrete overrides,
//! decided one at a time, aborting the remaining sub-jobs on the first
//! uploader failure while still emitting the top-level `finish` report.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Configuration;

/// Selects which component chain a job (or sub-job) runs through.
/// `SPEC_FULL.md` keeps this open rather than hardcoding the plugin chain
/// itself (out of scope per spec §1), but the class tag still decides
/// which named component set the supervisor wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    Standalone,
    Validation,
}

impl Default for JobClass {
    fn default() -> Self {
        JobClass::Standalone
    }
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// State machine a sub-job moves through under the supervisor (spec
/// §4.1):
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> Prepared
///     Prepared --> Launched: components started
///     Launched --> Draining: component set all exited
///     Draining --> Finished: report queue empty twice, 1s apart
///     Launched --> Failed: a component exits non-zero
///     Draining --> Failed: a component exits non-zero
///     Finished --> [*]
///     Failed --> [*]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubJobState {
    Prepared,
    Launched,
    Draining,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SubJob {
    pub id: String,
    pub conf: Value,
    pub state: SubJobState,
    /// `ideal verdict` + all obtained verification statuses, gathered for
    /// `report_validation_results` (only meaningful in validation mode).
    pub ideal_verdict: Option<String>,
    pub obtained_statuses: Vec<String>,
    pub comment: Option<String>,
}

impl SubJob {
    pub fn new(id: impl Into<String>, conf: Value) -> Self {
        SubJob {
            id: id.into(),
            conf,
            state: SubJobState::Prepared,
            ideal_verdict: None,
            obtained_statuses: Vec::new(),
            comment: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub identifier: String,
    pub class: JobClass,
    pub conf: Value,
    pub sub_jobs: Vec<SubJob>,
}

impl Job {
    pub fn new(identifier: impl Into<String>, class: JobClass, conf: Value) -> Self {
        Job {
            identifier: identifier.into(),
            class,
            conf,
            sub_jobs: Vec::new(),
        }
    }

    /// Builds the job/sub-job tree for one run (SPEC_FULL.md "Job/sub-job
    /// cascade", grounded on the dispatch on `job.type` in `Core.main`):
    /// a standalone job gets a single implicit sub-job rooted at the job
    /// identifier itself, so the cascade driver can treat both classes
    /// uniformly; a validation job gets one sub-job per `"Sub-jobs"`
    /// entry, identified `"<job id>/<commit>"` and carrying that entry's
    /// ideal verdict and comment for later validation-row reporting.
    pub fn from_configuration(conf: &Configuration) -> Job {
        let mut job = Job::new(conf.identifier().clone(), *conf.job_class(), Value::Null);
        match conf.job_class() {
            JobClass::Standalone => {
                job.sub_jobs.push(SubJob::new(conf.identifier().clone(), Value::Null));
            }
            JobClass::Validation => {
                for sub_conf in conf.sub_jobs() {
                    let id = format!("{}/{}", conf.identifier(), sub_conf.commit());
                    let mut sub_job = SubJob::new(id, Value::Null);
                    sub_job.ideal_verdict = Some(sub_conf.ideal_verdict().clone());
                    sub_job.comment = sub_conf.comment().clone();
                    job.sub_jobs.push(sub_job);
                }
            }
        }
        job
    }
}

/// Per-sub-job validation row: `[commit, ideal_verdict, ...obtained
/// statuses, comment]`, accumulated across the validation run and cleared
/// once reported (SPEC_FULL.md resolves Open Question 2: `take()` both
/// hands the caller the accumulated rows and empties the accumulator, so a
/// re-entrant report call cannot re-emit the same rows).
#[derive(Debug, Clone, Default)]
pub struct ValidationResults {
    rows: Vec<ValidationRow>,
}

#[derive(Debug, Clone)]
pub struct ValidationRow {
    pub commit: String,
    pub ideal_verdict: String,
    pub obtained_statuses: Vec<String>,
    pub comment: Option<String>,
}

impl ValidationResults {
    pub fn new() -> Self {
        ValidationResults::default()
    }

    pub fn push(&mut self, row: ValidationRow) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Hand back everything accumulated so far and clear the accumulator.
    pub fn take(&mut self) -> Vec<ValidationRow> {
        std::mem::take(&mut self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_accumulator() {
        let mut results = ValidationResults::new();
        results.push(ValidationRow {
            commit: "abc123".into(),
            ideal_verdict: "unsafe".into(),
            obtained_statuses: vec!["unsafe".into()],
            comment: None,
        });
        assert!(!results.is_empty());

        let rows = results.take();
        assert_eq!(rows.len(), 1);
        assert!(results.is_empty());
        assert!(results.take().is_empty());
    }

    fn base_conf_json(job_extra: &str) -> String {
        format!(
            r#"{{
                "identifier": "job-1",
                "Klever Bridge": {{"host": "http://bridge.example/", "login": "u", "password": "p"}},
                "working directory": "/tmp/wd",
                "main working directory": "/tmp/mwd",
                "resource limits": {{"memory size": 1, "CPU time": 1, "wall time": 1, "CPUs num": 1}},
                "VTG strategy": {{
                    "verifier": {{"name": "cpachecker", "version": "1.9"}},
                    "resource limits": {{"memory size": 1, "CPU time": 1, "wall time": 1, "CPUs num": 1}},
                    "merge source files": false
                }}{job_extra}
            }}"#
        )
    }

    #[test]
    fn standalone_job_gets_one_implicit_sub_job() {
        let conf = Configuration::from_json_str(&base_conf_json("")).unwrap();
        let job = Job::from_configuration(&conf);
        assert_eq!(job.class, JobClass::Standalone);
        assert_eq!(job.sub_jobs.len(), 1);
        assert_eq!(job.sub_jobs[0].id, "job-1");
    }

    #[test]
    fn validation_job_builds_one_sub_job_per_commit() {
        let extra = r#", "job class": "validation", "Sub-jobs": [
            {"commit": "abc123", "ideal verdict": "safe"},
            {"commit": "def456", "ideal verdict": "unsafe", "comment": "fixed in def456"}
        ]"#;
        let conf = Configuration::from_json_str(&base_conf_json(extra)).unwrap();
        let job = Job::from_configuration(&conf);
        assert_eq!(job.class, JobClass::Validation);
        assert_eq!(job.sub_jobs.len(), 2);
        assert_eq!(job.sub_jobs[0].id, "job-1/abc123");
        assert_eq!(job.sub_jobs[0].ideal_verdict.as_deref(), Some("safe"));
        assert_eq!(job.sub_jobs[1].id, "job-1/def456");
        assert_eq!(job.sub_jobs[1].comment.as_deref(), Some("fixed in def456"));
    }
}
