//! Configuration tree (spec §6 "Configuration").
//!
//! Grounded on the JSON document shape `Core.get_conf`/`core.utils.get_parallel_workers_num`
//! read from in the original sources, expressed the way the teacher's
//! `Endpoint`/`EndpointConfiguration` pair builds nested configuration:
//! `typed-builder` for construction, `getset` for read-only field access
//! once built.

use std::path::PathBuf;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use url::Url;

use crate::job::JobClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageDetails {
    None,
    Lines,
    Conditions,
}

impl Default for CoverageDetails {
    fn default() -> Self {
        CoverageDetails::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub")]
pub struct ResourceLimits {
    #[serde(rename = "memory size")]
    memory_size: u64,

    #[serde(rename = "CPU model", default)]
    #[builder(default)]
    cpu_model: Option<String>,

    #[serde(rename = "CPU time")]
    cpu_time: u64,

    #[serde(rename = "wall time")]
    wall_time: u64,

    #[serde(rename = "CPUs num")]
    cpus_num: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub")]
pub struct VerifierSpec {
    name: String,
    version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub")]
pub struct VtgStrategy {
    verifier: VerifierSpec,

    #[serde(rename = "resource limits")]
    resource_limits: ResourceLimits,

    #[serde(rename = "merge source files")]
    merge_source_files: bool,
}

/// One entry of the `"Sub-jobs"` list a validation job carries
/// (SPEC_FULL.md "Job/sub-job cascade"), grounded on the per-commit
/// entries `Core.main` iterates in validation mode.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub")]
pub struct SubJobConf {
    commit: String,

    #[serde(rename = "ideal verdict")]
    ideal_verdict: String,

    #[serde(default)]
    #[builder(default)]
    comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub")]
pub struct BridgeConfig {
    host: Url,
    login: String,

    #[serde(skip_serializing)]
    password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub")]
pub struct Configuration {
    identifier: String,

    #[serde(rename = "Klever Bridge")]
    bridge: BridgeConfig,

    #[serde(rename = "working directory")]
    working_directory: PathBuf,

    #[serde(rename = "main working directory")]
    main_working_directory: PathBuf,

    #[serde(rename = "keep intermediate files", default)]
    #[builder(default)]
    keep_intermediate_files: bool,

    #[serde(rename = "keep working directory", default)]
    #[builder(default)]
    keep_working_directory: bool,

    #[serde(rename = "working source trees", default)]
    #[builder(default)]
    working_source_trees: Vec<PathBuf>,

    #[serde(rename = "job class", default)]
    #[builder(default)]
    job_class: JobClass,

    #[serde(rename = "Sub-jobs", default)]
    #[builder(default)]
    sub_jobs: Vec<SubJobConf>,

    #[serde(rename = "upload verifier input files", default)]
    #[builder(default)]
    upload_verifier_input_files: bool,

    #[serde(rename = "upload input files of static verifiers", default)]
    #[builder(default)]
    upload_input_files_of_static_verifiers: bool,

    #[serde(rename = "code coverage details", default)]
    #[builder(default)]
    code_coverage_details: CoverageDetails,

    #[serde(rename = "resource limits")]
    resource_limits: ResourceLimits,

    #[serde(rename = "VTG strategy")]
    vtg_strategy: VtgStrategy,

    /// Derived, not part of the JSON document: number of C6 workers, the
    /// systems-language analogue of `core.utils.get_parallel_workers_num`.
    #[serde(default = "default_parallel_workers")]
    #[builder(default = default_parallel_workers())]
    parallel_workers: usize,
}

fn default_parallel_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Configuration {
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| crate::error::PipelineError::ConfigError(e.to_string()).into())
    }

    pub async fn from_json_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let text = r#"{
            "identifier": "job-1",
            "Klever Bridge": {"host": "http://bridge.example/", "login": "u", "password": "p"},
            "working directory": "/tmp/wd",
            "main working directory": "/tmp/mwd",
            "working source trees": ["/src"],
            "resource limits": {"memory size": 2147483648, "CPU time": 900, "wall time": 900, "CPUs num": 1},
            "VTG strategy": {
                "verifier": {"name": "cpachecker", "version": "1.9"},
                "resource limits": {"memory size": 2147483648, "CPU time": 900, "wall time": 900, "CPUs num": 1},
                "merge source files": false
            }
        }"#;
        let conf = Configuration::from_json_str(text).unwrap();
        assert_eq!(conf.identifier(), "job-1");
        assert_eq!(*conf.resource_limits().memory_size(), 2147483648);
        assert!(!*conf.keep_intermediate_files());
        assert_eq!(*conf.code_coverage_details(), CoverageDetails::None);
    }
}
