//! Per-job artifact directory: screenshots and the outcome record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::JobReport;

/// Layout of one job's artifact directory.
#[derive(Debug, Clone)]
pub struct JobDir {
    pub dir: PathBuf,
    pub outcome_path: PathBuf,
}

impl JobDir {
    pub fn new(base: &Path, job_id: &str) -> Self {
        let dir = base.join(sanitize(job_id));
        Self {
            outcome_path: dir.join("outcome.json"),
            dir,
        }
    }

    /// Create the directory on disk.
    pub fn create(base: &Path, job_id: &str) -> Result<Self> {
        let job_dir = Self::new(base, job_id);
        fs::create_dir_all(&job_dir.dir)
            .with_context(|| format!("create job dir {}", job_dir.dir.display()))?;
        Ok(job_dir)
    }

    /// Path for a named screenshot, e.g. `product_2_before_add` -> `product_2_before_add.png`.
    pub fn image(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.png", sanitize(name)))
    }

    pub fn write_outcome(&self, report: &JobReport) -> Result<()> {
        write_json(&self.outcome_path, report)
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
