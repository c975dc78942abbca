//! Working-directory cleanup (spec §6 "Filesystem layout produced by
//! core", `keep intermediate files` / `keep working directory`).
//!
//! Grounded on `scheduler/schedulers/native.py`'s `process_task_result`/
//! `process_job_result` (`shutil.rmtree(task_work_dir)` once a
//! reservation is released, skipped when `"keep working directory"` is
//! set) and `core/core/core.py`'s `create_components_conf` (the
//! `components conf.json` file is written at all only when
//! `"keep intermediate files"` is set). The pipeline has a single working
//! directory rather than per-task/per-job ones, so both checks collapse
//! into one end-of-run pass over `conf.working_directory()`.

use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::Configuration;

const COMPONENTS_CONF_FILE: &str = "components conf.json";

/// Runs once the pipeline has finished (spec §5, after the uploader has
/// drained). Removes the whole working directory unless `keep working
/// directory` is set; otherwise, if `keep intermediate files` is unset,
/// removes just the merged-configuration artifact that intermediate-file
/// retention would have kept around.
pub fn run(conf: &Configuration) -> anyhow::Result<()> {
    let working_directory = conf.working_directory();

    if !*conf.keep_working_directory() {
        remove_working_directory(working_directory)
    } else {
        if !*conf.keep_intermediate_files() {
            remove_components_conf(working_directory)?;
        }
        Ok(())
    }
}

fn remove_working_directory(working_directory: &Path) -> anyhow::Result<()> {
    if !working_directory.exists() {
        return Ok(());
    }

    let entry_count = WalkDir::new(working_directory).into_iter().filter_map(Result::ok).count();
    debug!(
        "removing working directory {} ({entry_count} entries)",
        working_directory.display()
    );
    std::fs::remove_dir_all(working_directory)?;
    Ok(())
}

fn remove_components_conf(working_directory: &Path) -> anyhow::Result<()> {
    for entry in WalkDir::new(working_directory)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_name() == COMPONENTS_CONF_FILE)
    {
        debug!("removing intermediate file {}", entry.path().display());
        std::fs::remove_file(entry.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conf_with(dir: &Path, keep_working_directory: bool, keep_intermediate_files: bool) -> Configuration {
        let text = json!({
            "identifier": "job-1",
            "Klever Bridge": {"host": "http://bridge.example/", "login": "u", "password": "p"},
            "working directory": dir,
            "main working directory": dir,
            "keep working directory": keep_working_directory,
            "keep intermediate files": keep_intermediate_files,
            "resource limits": {"memory size": 1, "CPU time": 1, "wall time": 1, "CPUs num": 1},
            "VTG strategy": {
                "verifier": {"name": "cpachecker", "version": "1.9"},
                "resource limits": {"memory size": 1, "CPU time": 1, "wall time": 1, "CPUs num": 1},
                "merge source files": false
            }
        })
        .to_string();
        Configuration::from_json_str(&text).unwrap()
    }

    #[test]
    fn removes_whole_directory_when_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report files"), b"x").unwrap();
        let conf = conf_with(dir.path(), false, false);

        run(&conf).unwrap();

        assert!(!dir.path().exists());
    }

    #[test]
    fn keeps_directory_but_removes_components_conf_when_intermediate_files_unkept() {
        let dir = tempfile::tempdir().unwrap();
        let components_conf = dir.path().join(COMPONENTS_CONF_FILE);
        std::fs::write(&components_conf, b"{}").unwrap();
        let other = dir.path().join("report files");
        std::fs::write(&other, b"x").unwrap();
        let conf = conf_with(dir.path(), true, false);

        run(&conf).unwrap();

        assert!(dir.path().exists());
        assert!(!components_conf.exists());
        assert!(other.exists());
    }

    #[test]
    fn keeps_everything_when_both_flags_set() {
        let dir = tempfile::tempdir().unwrap();
        let components_conf = dir.path().join(COMPONENTS_CONF_FILE);
        std::fs::write(&components_conf, b"{}").unwrap();
        let conf = conf_with(dir.path(), true, true);

        run(&conf).unwrap();

        assert!(components_conf.exists());
    }
}
