//! Report model (spec §3 "Report", §8 invariants 1-2).
//!
//! Every component emits reports exclusively through a [`ReportSink`],
//! which wraps the `report files` queue (spec §4.6). Because every
//! component must hold a parent's id *before* it can construct a child
//! report, parent-before-child ordering (invariant 1) falls out of plain
//! call order rather than needing to be checked at runtime — the same
//! trick `core.utils.report(...)` relies on in the original sources.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Start,
    Finish,
    Patch,
    Attrs,
    Verification,
    #[serde(rename = "verification finish")]
    VerificationFinish,
    Safe,
    Unsafe,
    Unknown,
    Data,
}

/// A file attached to a report, either copied in verbatim or archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFile {
    pub path: PathBuf,
    /// Name the file should carry inside the report archive, if different
    /// from `path`'s file name (mirrors `ArchiveFiles(..., arcnames=...)`).
    pub arcname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub kind: ReportKind,
    pub identifier: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub attrs: Value,
    #[serde(default)]
    pub files: Vec<ReportFile>,
    pub timestamp: DateTime<Utc>,
}

impl Report {
    pub fn new(kind: ReportKind, identifier: impl Into<String>, parent: Option<String>) -> Self {
        Report {
            kind,
            identifier: identifier.into(),
            parent,
            attrs: Value::Null,
            files: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_attrs(mut self, attrs: Value) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, arcname: Option<String>) -> Self {
        self.files.push(ReportFile {
            path: path.into(),
            arcname,
        });
        self
    }
}

/// Message shape the uploader drains: either a report or a sentinel.
/// Mirrors `{'report file': ..., 'report files archive': ...}` from
/// `Core.send_reports` — here we ship the `Report` value directly and let
/// the uploader (§4.6) serialize it to the on-disk `report files`
/// directory at upload time.
pub type ReportMessage = Report;

/// Handle every component uses to emit reports. Cloning is cheap (it is
/// just a clone of the underlying queue sender).
#[derive(Clone)]
pub struct ReportSink {
    sender: Sender<ReportMessage>,
}

impl ReportSink {
    pub fn new(sender: Sender<ReportMessage>) -> Self {
        ReportSink { sender }
    }

    pub fn emit(&self, report: Report) -> anyhow::Result<()> {
        self.sender.put(report)
    }

    pub fn close(&self) -> anyhow::Result<()> {
        self.sender.close_one()
    }

    /// Reports (and unconsumed sentinels) still sitting in the queue.
    /// Used by the supervisor's `draining` wait (spec §4.1), which needs
    /// to poll queue depth without taking the receiving end away from
    /// the uploader.
    pub fn pending_count(&self) -> usize {
        self.sender.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;

    /// Invariant 1 (spec §8): a parent `verification` report is enqueued
    /// strictly before any of its `safe`/`unsafe`/`unknown` children.
    #[tokio::test]
    async fn verification_precedes_its_children() {
        let (tx, mut rx) = queue::channel::<ReportMessage>();
        let sink = ReportSink::new(tx);

        sink.emit(Report::new(ReportKind::Verification, "V", Some("RP".into())))
            .unwrap();
        sink.emit(Report::new(ReportKind::Safe, "V/", Some("V".into())))
            .unwrap();
        sink.emit(Report::new(
            ReportKind::VerificationFinish,
            "V",
            Some("RP".into()),
        ))
        .unwrap();

        let first = rx.get().await.unwrap().into_value().unwrap();
        assert_eq!(first.kind, ReportKind::Verification);
        let second = rx.get().await.unwrap().into_value().unwrap();
        assert_eq!(second.kind, ReportKind::Safe);
        assert_eq!(second.parent.as_deref(), Some("V"));
        let third = rx.get().await.unwrap().into_value().unwrap();
        assert_eq!(third.kind, ReportKind::VerificationFinish);
    }
}
