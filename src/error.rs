//! Error taxonomy for the pipeline core (see spec §7).
//!
//! Every component propagates `anyhow::Result`, the way the teacher crate
//! does throughout `orchestrator/orchestrator.rs`. The handful of call
//! sites that need to branch on error *kind* (the supervisor deciding
//! whether to cancel siblings, the worker pool deciding whether a
//! coverage failure should be swallowed) downcast the `anyhow::Error`
//! back to `PipelineError` with `anyhow::Error::downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("scheduler cannot admit {identifier}: {reason}")]
    SchedulerError { identifier: String, reason: String },

    #[error("transport error talking to the bridge after {attempts} attempts: {source}")]
    RemoteTransportError {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote solver reported task {task_id} as ERROR: {message}")]
    RemoteTaskError { task_id: String, message: String },

    #[error("failed to parse witness {path}: {reason}")]
    WitnessParseError { path: String, reason: String },

    #[error("failed to assemble coverage from {path}: {reason}")]
    CoverageError { path: String, reason: String },

    #[error("component {component} failed internally: {reason}")]
    ComponentInternalError { component: String, reason: String },

    #[error("stop requested while {component} was still active")]
    TerminationError { component: String },
}

impl PipelineError {
    /// Whether this error should downgrade a verdict to `non-verifier
    /// unknown` rather than aborting the worker pool (spec §7).
    pub fn is_recoverable_at_task_level(&self) -> bool {
        matches!(
            self,
            PipelineError::RemoteTaskError { .. } | PipelineError::WitnessParseError { .. }
        )
    }
}

pub type Result<T> = anyhow::Result<T>;
