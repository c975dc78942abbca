//! Task descriptor, program fragment and requirement spec (spec §3).
//!
//! Grounded on the `(task_id, spec, options, ...)` tuple the poller hands
//! to the worker pool in `klever/core/vrp/__init__.py` (`__result_processing`
//! builds these tuples straight out of `self.vals['solution tasks']`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier plus the file-list manifest grouping reports (spec
/// §3 "Program fragment").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProgramFragment {
    pub id: String,
    pub files: Vec<String>,
}

/// Spec §3 "Requirement spec".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirementSpec {
    pub id: String,
    /// Free-form environment-model attributes, empty when none apply.
    #[serde(default)]
    pub envmodel_attrs: Value,
    pub class_tag: String,
}

/// Options controlling how a single verdict is interpreted (spec §4.4
/// step 2d): `expect several witnesses` toggles the multi-witness path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default, rename = "expect several witnesses")]
    pub expect_several_witnesses: bool,
}

/// `(task_id, spec, options, program_fragment, verifier, additional_sources,
/// task_files)` from spec §3 "Task descriptor".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub spec: RequirementSpec,
    pub options: TaskOptions,
    pub program_fragment: ProgramFragment,
    pub verifier: String,
    #[serde(default)]
    pub additional_sources: Vec<PathBuf>,
    #[serde(default)]
    pub task_files: Vec<PathBuf>,
}

impl TaskDescriptor {
    /// Key into the solution-triple registry: `fragment:env:requirement`.
    pub fn triple_key(&self) -> String {
        let envmodel = if self.spec.envmodel_attrs.is_null() {
            "none".to_string()
        } else {
            self.spec.envmodel_attrs.to_string()
        };
        crate::registry::triple_key(&self.program_fragment.id, &envmodel, &self.spec.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_key_uses_fragment_env_requirement() {
        let task = TaskDescriptor {
            task_id: "t1".into(),
            spec: RequirementSpec {
                id: "req1".into(),
                envmodel_attrs: Value::Null,
                class_tag: "linux".into(),
            },
            options: TaskOptions::default(),
            program_fragment: ProgramFragment {
                id: "pf1".into(),
                files: vec![],
            },
            verifier: "cpachecker".into(),
            additional_sources: vec![],
            task_files: vec![],
        };
        assert_eq!(task.triple_key(), "pf1:none:req1");
    }
}
