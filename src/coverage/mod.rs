//! Coverage Assembler (C8) — spec §4.4 step "coverage is best-effort",
//! §4.6's `LCOV(...)` invocation in `process_finished_task`.
//!
//! Converts an LCOV-format line-coverage blob into per-source-file
//! coverage records, rewriting paths the same way [`crate::witness`]
//! trims witness file names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FileCoverage {
    pub file: String,
    /// line number -> hit count.
    pub lines: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoverageReport {
    pub files: Vec<FileCoverage>,
}

/// Spec §6 "code coverage details": `{"None", "lines", "conditions"}`.
/// `conditions` additionally tracks branch coverage; core-only behavior
/// here covers `lines`, since branch-level reporting is driven entirely
/// by the verifier's own output format (out of scope, spec §1).
pub fn assemble_lcov(
    lcov_text: &str,
    source_root: &Path,
    source_trees: &[PathBuf],
) -> anyhow::Result<CoverageReport> {
    let mut files = Vec::new();
    let mut current: Option<FileCoverage> = None;

    for (lineno, raw_line) in lcov_text.lines().enumerate() {
        let line = raw_line.trim();
        if let Some(path) = line.strip_prefix("SF:") {
            if let Some(done) = current.take() {
                files.push(done);
            }
            let trimmed_path = crate::witness::trim_file_name(path, source_root, source_trees, &[]);
            current = Some(FileCoverage {
                file: trimmed_path,
                lines: BTreeMap::new(),
            });
        } else if let Some(rest) = line.strip_prefix("DA:") {
            let fc = current.as_mut().ok_or_else(|| PipelineError::CoverageError {
                path: format!("line {}", lineno + 1),
                reason: "DA record before any SF record".to_string(),
            })?;
            let mut parts = rest.splitn(2, ',');
            let line_no: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| PipelineError::CoverageError {
                    path: fc.file.clone(),
                    reason: format!("malformed DA record at line {}", lineno + 1),
                })?;
            let hits: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| PipelineError::CoverageError {
                    path: fc.file.clone(),
                    reason: format!("malformed DA record at line {}", lineno + 1),
                })?;
            fc.lines.insert(line_no, hits);
        } else if line == "end_of_record" {
            if let Some(done) = current.take() {
                files.push(done);
            }
        }
    }
    if let Some(done) = current.take() {
        files.push(done);
    }

    Ok(CoverageReport { files })
}

/// Selects the LCOV source file within the verification-task output
/// directory, per spec §4.4 step "coverage is best-effort": when a
/// single violation witness exists, prefer
/// `Counterexample.*.additionalCoverage.info`, falling back to
/// `coverage.info`; otherwise use `coverage.info` directly. This follows
/// the original exactly and does not branch on verdict (Open Question,
/// resolved in SPEC_FULL.md §9).
pub fn select_coverage_file(output_dir: &Path, witness_count: usize) -> anyhow::Result<PathBuf> {
    if witness_count == 1 {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(output_dir)
            .map_err(|e| PipelineError::CoverageError {
                path: output_dir.display().to_string(),
                reason: e.to_string(),
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("Counterexample.") && n.ends_with(".additionalCoverage.info"))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        if let Some(first) = candidates.into_iter().next() {
            return Ok(first);
        }
    }
    Ok(output_dir.join("coverage.info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_file_record() {
        let lcov = "SF:/src/a.c\nDA:1,3\nDA:2,0\nend_of_record\n";
        let report = assemble_lcov(lcov, Path::new("/clade"), &[]).unwrap();
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].file, "/src/a.c");
        assert_eq!(report.files[0].lines.get(&1), Some(&3));
        assert_eq!(report.files[0].lines.get(&2), Some(&0));
    }

    #[test]
    fn da_before_sf_is_an_error() {
        let lcov = "DA:1,3\n";
        let err = assemble_lcov(lcov, Path::new("/clade"), &[]).unwrap_err();
        assert!(err.to_string().contains("DA record before"));
    }

    #[test]
    fn select_coverage_file_falls_back_when_no_additional_coverage() {
        let tmp = tempfile::tempdir().unwrap();
        let picked = select_coverage_file(tmp.path(), 1).unwrap();
        assert_eq!(picked, tmp.path().join("coverage.info"));
    }
}
