//! Filesystem layout under `scheduler.jobs_dir` (spec §6).
//!
//! One directory per job: `<jobs_dir>/<job_id>/`, holding `output` (combined
//! worker stdout/stderr), `.{job_id}` (the result file, §3), and
//! `wrapper_init_parameters` (transient state for the cleanup re-exec
//! handoff, §4.2). Path construction is centralized here the way the
//! teacher centralizes job-directory paths in its own `JobDir`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A job's on-disk working directory.
pub struct JobDir {
    pub path: PathBuf,
    pub job_id: i64,
}

impl JobDir {
    /// Open (and create if missing) the directory for `job_id` under `root`.
    /// The returned path is always canonical (absolute, symlinks resolved) so
    /// it stays valid after the worker `chdir`s into it (spec §4.2 step 1).
    pub fn open(root: &Path, job_id: i64) -> Result<Self> {
        let path = root.join(job_id.to_string());
        std::fs::create_dir_all(&path)
            .with_context(|| format!("create job dir {}", path.display()))?;
        let path = std::fs::canonicalize(&path)
            .with_context(|| format!("canonicalize job dir {}", path.display()))?;
        Ok(JobDir { path, job_id })
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join("output")
    }

    /// `<jobs_dir>/<job_id>/.<job_id>` per spec §3/§6.
    pub fn result_path(&self) -> PathBuf {
        self.path.join(format!(".{}", self.job_id))
    }

    pub fn wrapper_init_parameters_path(&self) -> PathBuf {
        self.path.join("wrapper_init_parameters")
    }

    /// Handshake file a worker writes at startup so its PID can be
    /// attributed without `/proc` access (used on non-Linux targets, spec §9).
    pub fn handshake_path(&self) -> PathBuf {
        self.path.join(".worker_handshake")
    }

    /// Read and parse the result file, if present.
    pub fn read_result(&self) -> Result<Option<crate::wrapper::ResultFile>> {
        let path = self.result_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading result file {}", path.display()))?;
        Ok(Some(crate::wrapper::ResultFile::parse(&raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_directory_and_derives_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let jd = JobDir::open(tmp.path(), 42).unwrap();
        assert!(jd.path.exists());
        assert!(jd.result_path().ends_with(".42"));
        assert!(jd.output_path().ends_with("output"));
    }

    #[test]
    fn read_result_is_none_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let jd = JobDir::open(tmp.path(), 7).unwrap();
        assert!(jd.read_result().unwrap().is_none());
    }
}
