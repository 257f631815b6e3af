//! Filesystem contract shared with the agent sandbox.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::TaskRunId;

pub const DEFAULT_LIFECYCLE_DIR: &str = "/root/lifecycle";
pub const DEFAULT_TELEMETRY_DIR: &str = "/tmp";
pub const MARKER_PREFIX: &str = "minimax-complete-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleLayout {
    #[serde(default = "default_lifecycle_dir")]
    pub lifecycle_dir: PathBuf,
    #[serde(default = "default_telemetry_dir")]
    pub telemetry_dir: PathBuf,
}

fn default_lifecycle_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LIFECYCLE_DIR)
}

fn default_telemetry_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TELEMETRY_DIR)
}

impl Default for LifecycleLayout {
    fn default() -> Self {
        Self {
            lifecycle_dir: default_lifecycle_dir(),
            telemetry_dir: default_telemetry_dir(),
        }
    }
}

impl LifecycleLayout {
    pub fn marker_path(&self, task_run_id: &TaskRunId) -> PathBuf {
        self.lifecycle_dir.join(marker_file_name(task_run_id))
    }

    pub fn telemetry_log_path(&self, task_run_id: &TaskRunId) -> PathBuf {
        self.telemetry_dir
            .join(format!("gemini-telemetry-{}.log", task_run_id.0))
    }
}

pub fn marker_file_name(task_run_id: &TaskRunId) -> String {
    format!("{MARKER_PREFIX}{}", task_run_id.0)
}
